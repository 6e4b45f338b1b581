//! Protocol eras -- versioned parameter sets both ends of a connection share.
//!
//! An era fixes the wire-level limits and the replication timing defaults.
//! Per-connection budgets may be tuned locally from config; the era values
//! are what a freshly configured node uses.

/// A protocol era: a named, versioned set of limits and timing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolEra {
    /// Era identifier. Monotonically increasing.
    pub id: u16,

    // -- Transport --
    /// Largest datagram the fragmenter plans for.
    pub max_datagram_payload: usize,
    /// Largest envelope a stream decoder accepts.
    pub max_message_bytes: usize,
    /// Server tick rate advertised in the hello.
    pub tick_rate_hz: u32,

    // -- Reassembly --
    /// Ticks without a new fragment before a transfer is evicted.
    pub transfer_timeout_ticks: u64,

    // -- Resync throttling --
    /// Per-chunk ticks between resync requests.
    pub resync_cooldown_ticks: u64,
    /// Sliding window length for the global resync cap.
    pub resync_window_ticks: u64,
    /// Resync requests allowed per window across all chunks.
    pub resync_max_per_window: usize,

    // -- Streaming --
    /// Chebyshev radius scanned around the focus chunk.
    pub ring_radius: i32,
    /// Byte budget per connection per tick.
    pub max_bytes_per_tick: usize,
    /// Message budget per connection per tick.
    pub max_messages_per_tick: usize,
}

/// Era 0: Genesis parameters.
pub const ERA_0: ProtocolEra = ProtocolEra {
    id: 0,

    // Transport
    max_datagram_payload: 1200,
    max_message_bytes: 64 * 1024,
    tick_rate_hz: 30,

    // Reassembly: 10s at 30Hz
    transfer_timeout_ticks: 300,

    // Resync: at most 8 per second, one per chunk per second
    resync_cooldown_ticks: 30,
    resync_window_ticks: 30,
    resync_max_per_window: 8,

    // Streaming
    ring_radius: 3,
    max_bytes_per_tick: 32 * 1024,
    max_messages_per_tick: 64,
};

/// The current active era.
pub const CURRENT_ERA: &ProtocolEra = &ERA_0;
