//! Network message cache for replay protection
//!
//! SEQ combined with the IV index is unique per source, and the IV index
//! changes rarely, so 16 bits SRC, 1 bit IVI and the low 15 bits of SEQ make
//! a good 32-bit fingerprint.

use crate::pdu::NetworkPdu;
use std::collections::VecDeque;
use tracing::trace;

/// Fingerprint of a decrypted network PDU
pub fn hash(pdu: &NetworkPdu) -> u32 {
    hash_fields(pdu.src(), pdu.ivi(), pdu.seq())
}

pub fn hash_fields(src: u16, ivi: u8, seq: u32) -> u32 {
    ((src as u32) << 16) | (((ivi & 1) as u32) << 15) | (seq & 0x7fff)
}

/// Ring of the most recently accepted fingerprints
pub struct ReplayCache {
    entries: VecDeque<u32>,
    capacity: usize,
}

impl ReplayCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn contains(&self, hash: u32) -> bool {
        self.entries.contains(&hash)
    }

    /// Remember `hash`, overwriting the oldest entry when full
    pub fn insert(&mut self, hash: u32) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(hash);
        trace!("Network cache: {} / {} entries", self.entries.len(), self.capacity);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
