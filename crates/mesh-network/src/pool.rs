//! Fixed-size arena of network PDUs
//!
//! PDUs are addressed by [`PduHandle`]. A handle carries the generation of its
//! slot, so a handle that outlives its PDU (for example a second
//! `processed()` call) is detected instead of aliasing a newer PDU.

use crate::error::{MeshError, MeshResult};
use crate::pdu::NetworkPdu;
use std::fmt;
use tracing::{trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PduHandle {
    index: u16,
    generation: u32,
}

impl PduHandle {
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

impl fmt::Display for PduHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pdu#{}.{}", self.index, self.generation)
    }
}

struct Slot {
    generation: u32,
    pdu: Option<NetworkPdu>,
}

pub struct PduPool {
    slots: Vec<Slot>,
    free: Vec<u16>,
}

impl PduPool {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.min(u16::MAX as usize);
        let slots = (0..capacity)
            .map(|_| Slot {
                generation: 0,
                pdu: None,
            })
            .collect();
        // lowest index is handed out first
        let free = (0..capacity as u16).rev().collect();
        Self { slots, free }
    }

    /// Move a PDU into a free slot
    pub fn allocate(&mut self, pdu: NetworkPdu) -> MeshResult<PduHandle> {
        let Some(index) = self.free.pop() else {
            warn!("Network PDU pool exhausted ({} slots)", self.slots.len());
            return Err(MeshError::PoolExhausted);
        };
        let slot = &mut self.slots[index as usize];
        slot.pdu = Some(pdu);
        let handle = PduHandle {
            index,
            generation: slot.generation,
        };
        trace!("Allocated {}", handle);
        Ok(handle)
    }

    pub fn get(&self, handle: PduHandle) -> Option<&NetworkPdu> {
        self.slots
            .get(handle.index())
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.pdu.as_ref())
    }

    pub fn get_mut(&mut self, handle: PduHandle) -> Option<&mut NetworkPdu> {
        self.slots
            .get_mut(handle.index())
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.pdu.as_mut())
    }

    pub fn contains(&self, handle: PduHandle) -> bool {
        self.get(handle).is_some()
    }

    /// Free a slot and hand back its PDU. The handle is invalid afterwards.
    pub fn release(&mut self, handle: PduHandle) -> MeshResult<NetworkPdu> {
        let slot = self
            .slots
            .get_mut(handle.index())
            .filter(|slot| slot.generation == handle.generation)
            .ok_or_else(|| MeshError::UnknownPdu(handle.to_string()))?;
        let pdu = slot
            .pdu
            .take()
            .ok_or_else(|| MeshError::UnknownPdu(handle.to_string()))?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        trace!("Released {}", handle);
        Ok(pdu)
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn in_use(&self) -> usize {
        self.capacity() - self.available()
    }
}
