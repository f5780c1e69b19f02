//! Relay decision for received network PDUs
//!
//! Once the higher layer is done with a validated PDU it is either
//! forwarded with TTL - 1 or released. PDUs from our own elements and PDUs
//! whose TTL would drop below 1 are never relayed.

use crate::network::NetworkContext;
use crate::pdu::{Completion, NetworkPdu};
use tracing::debug;

/// Smallest received TTL that may still be relayed
pub const MIN_RELAY_TTL: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayDecision {
    /// Re-encrypt and send with the new TTL
    Forward { ttl: u8 },
    Release,
}

pub fn relay_decision(pdu: &NetworkPdu, ctx: &NetworkContext) -> RelayDecision {
    if pdu.is_proxy() {
        return RelayDecision::Release;
    }
    if ctx.is_own_address(pdu.src()) {
        debug!("Not relaying PDU from own element {:04x}", pdu.src());
        return RelayDecision::Release;
    }
    let ttl = pdu.ttl();
    if ttl < MIN_RELAY_TTL {
        debug!("Not relaying PDU from {:04x}, TTL {}", pdu.src(), ttl);
        return RelayDecision::Release;
    }
    RelayDecision::Forward { ttl: ttl - 1 }
}

/// Turn a decrypted PDU back into a plaintext PDU ready for encryption.
///
/// The NetMIC was already stripped by validation, the stored length is the
/// plaintext length. Keeps the subnet the PDU arrived on.
pub fn prepare_for_relay(pdu: &mut NetworkPdu, ttl: u8) {
    pdu.set_ctl_ttl(pdu.ctl(), ttl);
    pdu.completion = Some(Completion::Relay);
    debug!(
        "Relaying {:04x} -> {:04x} seq {:06x} with TTL {}",
        pdu.src(),
        pdu.dst(),
        pdu.seq(),
        ttl
    );
}
