//! Mesh address classes and network-layer address validation

use crate::error::{MeshError, MeshResult};
use tracing::debug;

pub const UNASSIGNED_ADDRESS: u16 = 0x0000;

const ADDRESS_CLASS_MASK: u16 = 0xC000;
const VIRTUAL_ADDRESS_CLASS: u16 = 0x8000;
const GROUP_ADDRESS_CLASS: u16 = 0xC000;

/// First and last group address reserved for future use
const RFU_GROUP_START: u16 = 0xFF00;
const RFU_GROUP_END: u16 = 0xFFFB;

pub fn is_unassigned(addr: u16) -> bool {
    addr == UNASSIGNED_ADDRESS
}

/// Unicast addresses are 0x0001..=0x7FFF
pub fn is_unicast(addr: u16) -> bool {
    addr != UNASSIGNED_ADDRESS && addr & 0x8000 == 0
}

pub fn is_virtual(addr: u16) -> bool {
    addr & ADDRESS_CLASS_MASK == VIRTUAL_ADDRESS_CLASS
}

pub fn is_group(addr: u16) -> bool {
    addr & ADDRESS_CLASS_MASK == GROUP_ADDRESS_CLASS
}

pub fn is_reserved_group(addr: u16) -> bool {
    (RFU_GROUP_START..=RFU_GROUP_END).contains(&addr)
}

/// Validate the source and destination of a received network PDU.
///
/// The source must be a unicast address. The destination must be assigned,
/// control messages may not target a virtual address, and access messages
/// may not target the RFU group range.
pub fn validate(ctl: bool, src: u16, dst: u16) -> bool {
    if is_unassigned(src) {
        debug!("SRC {:04x} unassigned, ignoring", src);
        return false;
    }
    if is_virtual(src) {
        debug!("SRC {:04x} is a virtual address, ignoring", src);
        return false;
    }
    if is_group(src) {
        debug!("SRC {:04x} is a group address, ignoring", src);
        return false;
    }
    if is_unassigned(dst) {
        debug!("DST unassigned, ignoring");
        return false;
    }
    if is_virtual(dst) && ctl {
        debug!("DST {:04x} virtual in control message, ignoring", dst);
        return false;
    }
    if is_reserved_group(dst) && !ctl {
        debug!("DST {:04x} RFU group in access message, ignoring", dst);
        return false;
    }
    true
}

/// Same as [`validate`] but as a result
pub fn check(ctl: bool, src: u16, dst: u16) -> MeshResult<()> {
    if validate(ctl, src, dst) {
        Ok(())
    } else {
        Err(MeshError::InvalidAddress { src, dst })
    }
}
