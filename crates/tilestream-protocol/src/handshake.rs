//! Client-side acceptance of a server hello.

use tracing::{debug, warn};

use crate::messages::{ServerHello, WireMessage};
use crate::worldgen::WorldGenConfigError;
use crate::WireError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("malformed server hello: {0}")]
    Malformed(#[from] WireError),
    #[error("config checksum mismatch: server sent {sent:#018x}, blob hashes to {computed:#018x}")]
    ChecksumMismatch { sent: u64, computed: u64 },
    #[error("server world gen config rejected: {0}")]
    InvalidConfig(#[from] WorldGenConfigError),
}

/// Decode a hello payload and check that the embedded blob hashes to the
/// transmitted CRC64 and describes a usable world.
pub fn validate_server_hello(payload: &[u8]) -> Result<ServerHello, HandshakeError> {
    let hello = ServerHello::decode(payload)?;

    let computed = hello.config.checksum();
    if computed != hello.config_crc64 {
        warn!(
            sent = hello.config_crc64,
            computed, "server hello config checksum mismatch"
        );
        return Err(HandshakeError::ChecksumMismatch {
            sent: hello.config_crc64,
            computed,
        });
    }

    hello.config.validate()?;

    debug!(
        seed = hello.world_seed,
        tick_rate = hello.tick_rate_hz,
        crc = hello.config_crc64,
        "server hello accepted"
    );
    Ok(hello)
}
