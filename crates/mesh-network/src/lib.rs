//! Bluetooth Mesh network layer
//!
//! This crate turns transport PDUs plus routing fields into obfuscated,
//! authenticated network PDUs and validates, de-duplicates and relays
//! received ones. The core ([`NetworkLayer`]) is a single-threaded state
//! machine driven by crypto completions and bearer slots; [`service`] runs it
//! on tokio.

pub mod address;
pub mod bearer;
pub mod cache;
pub mod config;
pub mod crypto;
pub mod error;
pub mod network;
pub mod nonce;
pub mod pdu;
pub mod pipeline;
pub mod pool;
pub mod relay;
pub mod service;
pub mod subnet;

// Re-export main types
pub use bearer::{Bearer, BufferedBearer, MeshBearer};
pub use config::NetworkConfig;
pub use crypto::{
    ChannelCryptoEngine, CryptoEngine, CryptoRequest, CryptoResponse, CryptoStats,
    DeferredCryptoEngine, SoftwareCrypto,
};
pub use error::{MeshError, MeshResult};
pub use network::{NetworkContext, NetworkEvent, NetworkLayer, QueueLengths};
pub use pdu::{Completion, NetworkHeader, NetworkPdu};
pub use pool::PduHandle;
pub use relay::RelayDecision;
pub use service::{MeshNetworkHandle, MeshNetworkService, ReceivedPdu, ServiceEvent};
pub use subnet::{Key128, ProvisioningData, SubnetKey};
