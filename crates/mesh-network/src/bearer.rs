//! Bearer abstractions
//!
//! [`Bearer`] is the synchronous port used by the network layer: it asks for
//! a transmit slot and later, when the host calls
//! `NetworkLayer::on_can_send_now`, hands exactly one PDU to `transmit`.
//!
//! [`MeshBearer`] is the async radio side driven by the service task.

use crate::error::{MeshError, MeshResult};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Maximum number of attempts for a single bearer transmission
pub const MESH_TRANSMISSION_RETRIES: u32 = 3;

/// Delay between transmission attempts
pub const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Slot-based bearer consumed by the network layer
pub trait Bearer {
    /// Ask for a transmit slot; the host answers with `on_can_send_now`
    fn request_can_send_now(&mut self);

    /// Send one network PDU in the granted slot
    fn transmit(&mut self, pdu: &[u8]);
}

/// Platform radio that actually puts network PDUs on air
#[async_trait]
pub trait MeshBearer: Send + Sync {
    /// Send one obfuscated and encrypted network PDU
    async fn send_mesh_message(&self, pdu: &[u8]) -> MeshResult<()>;
}

/// Send `pdu` over `bearer`, retrying failed attempts
pub async fn transmit_with_retry(bearer: &dyn MeshBearer, pdu: &[u8]) -> MeshResult<()> {
    let mut attempts = 0;
    loop {
        match bearer.send_mesh_message(pdu).await {
            Ok(()) => {
                debug!("Sent {} byte network PDU", pdu.len());
                return Ok(());
            }
            Err(e) => {
                attempts += 1;
                if attempts >= MESH_TRANSMISSION_RETRIES {
                    error!(
                        "Failed to send network PDU after {} attempts: {}",
                        MESH_TRANSMISSION_RETRIES, e
                    );
                    return Err(MeshError::Transmission(format!(
                        "gave up after {} attempts: {}",
                        MESH_TRANSMISSION_RETRIES, e
                    )));
                }
                warn!("Send attempt {} failed, retrying: {}", attempts, e);
                tokio::time::sleep(RETRY_DELAY).await;
            }
        }
    }
}

/// Bearer that buffers transmitted PDUs for the host to pick up.
///
/// Slot requests are counted, so a host loop can grant them with
/// [`BufferedBearer::take_slot_request`].
#[derive(Debug, Default)]
pub struct BufferedBearer {
    slot_requests: usize,
    frames: VecDeque<Vec<u8>>,
    transmitted: usize,
}

impl BufferedBearer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one outstanding slot request
    pub fn take_slot_request(&mut self) -> bool {
        if self.slot_requests == 0 {
            return false;
        }
        self.slot_requests -= 1;
        true
    }

    pub fn pending_slot_requests(&self) -> usize {
        self.slot_requests
    }

    /// Oldest transmitted PDU not yet picked up
    pub fn pop_frame(&mut self) -> Option<Vec<u8>> {
        self.frames.pop_front()
    }

    pub fn frames(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.frames.iter().map(Vec::as_slice)
    }

    /// Total number of `transmit` calls
    pub fn transmitted(&self) -> usize {
        self.transmitted
    }
}

impl Bearer for BufferedBearer {
    fn request_can_send_now(&mut self) {
        self.slot_requests += 1;
    }

    fn transmit(&mut self, pdu: &[u8]) {
        self.transmitted += 1;
        self.frames.push_back(pdu.to_vec());
    }
}
