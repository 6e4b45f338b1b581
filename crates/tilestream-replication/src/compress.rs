//! Compression backends for snapshot payloads.
//!
//! The snapshot codec only ever sees the [`Compressor`] trait, so the wire
//! format stays fixed while the algorithm is swapped per deployment.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompressError {
    #[error("output buffer too small: need at least {needed} bytes, have {available}")]
    OutputTooSmall { needed: usize, available: usize },
    #[error("corrupt compressed input: {0}")]
    Corrupt(String),
}

pub trait Compressor {
    /// Stable name, used for config selection and logs.
    fn name(&self) -> &'static str;

    /// Worst-case compressed size for `len` input bytes.
    fn compress_bound(&self, len: usize) -> usize;

    /// Compress `src` into `dst`, returning bytes written.
    fn compress(&self, src: &[u8], dst: &mut [u8]) -> Result<usize, CompressError>;

    /// Decompress `src` into `dst`, returning bytes written.
    fn decompress(&self, src: &[u8], dst: &mut [u8]) -> Result<usize, CompressError>;
}

fn copy_into(src: &[u8], dst: &mut [u8]) -> Result<usize, CompressError> {
    if dst.len() < src.len() {
        return Err(CompressError::OutputTooSmall {
            needed: src.len(),
            available: dst.len(),
        });
    }
    dst[..src.len()].copy_from_slice(src);
    Ok(src.len())
}

/// Identity "compression".
#[derive(Debug, Clone, Copy, Default)]
pub struct StoredCompressor;

impl Compressor for StoredCompressor {
    fn name(&self) -> &'static str {
        "stored"
    }

    fn compress_bound(&self, len: usize) -> usize {
        len
    }

    fn compress(&self, src: &[u8], dst: &mut [u8]) -> Result<usize, CompressError> {
        copy_into(src, dst)
    }

    fn decompress(&self, src: &[u8], dst: &mut [u8]) -> Result<usize, CompressError> {
        copy_into(src, dst)
    }
}

/// Byte-run encoding as `(run_len, byte)` pairs, `run_len` in `1..=255`.
/// Height and biome fields are long flat runs, so this does well on them.
#[derive(Debug, Clone, Copy, Default)]
pub struct RleCompressor;

impl Compressor for RleCompressor {
    fn name(&self) -> &'static str {
        "rle"
    }

    fn compress_bound(&self, len: usize) -> usize {
        len * 2
    }

    fn compress(&self, src: &[u8], dst: &mut [u8]) -> Result<usize, CompressError> {
        let mut written = 0;
        let mut i = 0;
        while i < src.len() {
            let byte = src[i];
            let mut run = 1;
            while i + run < src.len() && src[i + run] == byte && run < u8::MAX as usize {
                run += 1;
            }
            if written + 2 > dst.len() {
                return Err(CompressError::OutputTooSmall {
                    needed: written + 2,
                    available: dst.len(),
                });
            }
            dst[written] = run as u8;
            dst[written + 1] = byte;
            written += 2;
            i += run;
        }
        Ok(written)
    }

    fn decompress(&self, src: &[u8], dst: &mut [u8]) -> Result<usize, CompressError> {
        if src.len() % 2 != 0 {
            return Err(CompressError::Corrupt(format!("odd rle length {}", src.len())));
        }
        let mut written = 0;
        for pair in src.chunks_exact(2) {
            let run = pair[0] as usize;
            if run == 0 {
                return Err(CompressError::Corrupt("zero-length run".into()));
            }
            let end = written + run;
            if end > dst.len() {
                return Err(CompressError::OutputTooSmall {
                    needed: end,
                    available: dst.len(),
                });
            }
            dst[written..end].fill(pair[1]);
            written = end;
        }
        Ok(written)
    }
}

/// zstd at a fixed level.
#[cfg(feature = "zstd")]
#[derive(Debug, Clone, Copy)]
pub struct ZstdCompressor {
    pub level: i32,
}

#[cfg(feature = "zstd")]
impl Default for ZstdCompressor {
    fn default() -> Self {
        Self { level: 3 }
    }
}

#[cfg(feature = "zstd")]
impl Compressor for ZstdCompressor {
    fn name(&self) -> &'static str {
        "zstd"
    }

    fn compress_bound(&self, len: usize) -> usize {
        zstd::zstd_safe::compress_bound(len)
    }

    fn compress(&self, src: &[u8], dst: &mut [u8]) -> Result<usize, CompressError> {
        zstd::bulk::compress_to_buffer(src, dst, self.level).map_err(|e| CompressError::Corrupt(e.to_string()))
    }

    fn decompress(&self, src: &[u8], dst: &mut [u8]) -> Result<usize, CompressError> {
        zstd::bulk::decompress_to_buffer(src, dst).map_err(|e| CompressError::Corrupt(e.to_string()))
    }
}

/// Look up a compressor by its config name.
pub fn compressor_by_name(name: &str) -> Option<Box<dyn Compressor + Send>> {
    match name {
        "stored" => Some(Box::new(StoredCompressor)),
        "rle" => Some(Box::new(RleCompressor)),
        #[cfg(feature = "zstd")]
        "zstd" => Some(Box::new(ZstdCompressor::default())),
        _ => None,
    }
}
