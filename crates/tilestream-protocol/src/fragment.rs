//! Splitting compressed snapshots into datagram-sized fragments.

/// Upper bound for one datagram (envelope + message).
pub const MAX_DATAGRAM_PAYLOAD: usize = 1200;

/// Fixed bytes of a v1 fragment message before its payload, including the
/// version byte.
pub const FRAG_HEADER_SIZE: usize = 21;

/// Fragments never carry fewer than this many payload bytes.
pub const MIN_FRAG_PAYLOAD: usize = 64;

/// Payload bytes per fragment after envelope and fragment headers.
pub fn frag_payload_capacity(envelope_overhead: usize) -> usize {
    MAX_DATAGRAM_PAYLOAD
        .saturating_sub(envelope_overhead)
        .saturating_sub(FRAG_HEADER_SIZE)
        .max(MIN_FRAG_PAYLOAD)
}

pub fn frag_count(total_len: usize, cap: usize) -> usize {
    if cap == 0 {
        return 0;
    }
    total_len.div_ceil(cap)
}

/// Iterates `(frag_index, offset, len)` over a buffer of `total_len` bytes.
/// All fragments but the last are exactly `cap` bytes.
#[derive(Debug, Clone)]
pub struct FragmentPlan {
    total_len: usize,
    cap: usize,
    next: usize,
}

impl FragmentPlan {
    pub fn new(total_len: usize, cap: usize) -> Self {
        Self {
            total_len,
            cap,
            next: 0,
        }
    }

    /// Number of fragments the plan yields in total.
    pub fn fragment_count(&self) -> usize {
        frag_count(self.total_len, self.cap)
    }
}

impl Iterator for FragmentPlan {
    type Item = (usize, usize, usize);

    fn next(&mut self) -> Option<Self::Item> {
        if self.cap == 0 {
            return None;
        }
        let offset = self.next * self.cap;
        if offset >= self.total_len {
            return None;
        }
        let len = self.cap.min(self.total_len - offset);
        let index = self.next;
        self.next += 1;
        Some((index, offset, len))
    }
}
