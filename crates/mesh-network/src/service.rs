//! Async driver for the network layer
//!
//! A single tokio task owns the [`NetworkLayer`]. Commands arrive on an mpsc
//! channel, crypto requests are computed by a worker task and fed back as
//! completions, encrypted PDUs are handed to a [`MeshBearer`] and everything
//! the higher layer needs to see is published as a [`ServiceEvent`].

use crate::bearer::{transmit_with_retry, BufferedBearer, MeshBearer};
use crate::config::NetworkConfig;
use crate::crypto::{ChannelCryptoEngine, CryptoRequest, CryptoResponse, SoftwareCrypto};
use crate::error::{MeshError, MeshResult};
use crate::network::{NetworkEvent, NetworkLayer};
use crate::pdu::NetworkHeader;
use crate::pool::PduHandle;
use crate::subnet::SubnetKey;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Snapshot of a received PDU handed to the higher layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedPdu {
    pub handle: PduHandle,
    pub ctl: bool,
    pub ttl: u8,
    pub seq: u32,
    pub src: u16,
    pub dst: u16,
    pub netkey_index: u16,
    pub transport_pdu: Vec<u8>,
}

#[derive(Debug)]
pub enum ServiceEvent {
    /// Call [`MeshNetworkHandle::processed`] once done with it
    PduReceived(ReceivedPdu),
    /// Call [`MeshNetworkHandle::processed`] once done with it
    ProxyPduReceived(ReceivedPdu),
    /// Encrypted proxy PDU, already released
    ProxyPduEncrypted { handle: PduHandle, pdu: Vec<u8> },
    PduSent {
        handle: PduHandle,
        src: u16,
        dst: u16,
        seq: u32,
    },
    SendFailed { handle: PduHandle, reason: MeshError },
    Dropped { handle: PduHandle, reason: MeshError },
}

enum Command {
    Received {
        bytes: Vec<u8>,
        proxy: bool,
        reply: oneshot::Sender<MeshResult<PduHandle>>,
    },
    Send {
        transport_pdu: Vec<u8>,
        netkey_index: u16,
        header: NetworkHeader,
        proxy: bool,
        reply: oneshot::Sender<MeshResult<PduHandle>>,
    },
    Processed {
        handle: PduHandle,
        reply: oneshot::Sender<MeshResult<()>>,
    },
    AddSubnet {
        key: SubnetKey,
        reply: oneshot::Sender<()>,
    },
    SetIvIndex {
        iv_index: u32,
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to a running [`MeshNetworkService`]
#[derive(Clone)]
pub struct MeshNetworkHandle {
    commands: mpsc::Sender<Command>,
}

impl MeshNetworkHandle {
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> MeshResult<T> {
        let (reply, response) = oneshot::channel();
        self.commands.send(build(reply)).await?;
        Ok(response.await?)
    }

    pub async fn received_bytes(&self, bytes: &[u8]) -> MeshResult<PduHandle> {
        self.request(|reply| Command::Received {
            bytes: bytes.to_vec(),
            proxy: false,
            reply,
        })
        .await?
    }

    pub async fn received_proxy_bytes(&self, bytes: &[u8]) -> MeshResult<PduHandle> {
        self.request(|reply| Command::Received {
            bytes: bytes.to_vec(),
            proxy: true,
            reply,
        })
        .await?
    }

    pub async fn send_pdu(
        &self,
        transport_pdu: &[u8],
        netkey_index: u16,
        header: NetworkHeader,
    ) -> MeshResult<PduHandle> {
        self.request(|reply| Command::Send {
            transport_pdu: transport_pdu.to_vec(),
            netkey_index,
            header,
            proxy: false,
            reply,
        })
        .await?
    }

    pub async fn send_proxy_pdu(
        &self,
        transport_pdu: &[u8],
        netkey_index: u16,
        header: NetworkHeader,
    ) -> MeshResult<PduHandle> {
        self.request(|reply| Command::Send {
            transport_pdu: transport_pdu.to_vec(),
            netkey_index,
            header,
            proxy: true,
            reply,
        })
        .await?
    }

    pub async fn processed(&self, handle: PduHandle) -> MeshResult<()> {
        self.request(|reply| Command::Processed { handle, reply })
            .await?
    }

    pub async fn add_subnet(&self, key: SubnetKey) -> MeshResult<()> {
        self.request(|reply| Command::AddSubnet { key, reply }).await
    }

    pub async fn set_iv_index(&self, iv_index: u32) -> MeshResult<()> {
        self.request(|reply| Command::SetIvIndex { iv_index, reply })
            .await
    }

    /// Stop the service. PDUs still queued are dropped.
    pub async fn shutdown(&self) -> MeshResult<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

pub struct MeshNetworkService {
    layer: NetworkLayer<ChannelCryptoEngine, BufferedBearer>,
    bearer: Arc<dyn MeshBearer>,
    commands: mpsc::Receiver<Command>,
    crypto_results: mpsc::UnboundedReceiver<CryptoResponse>,
    events: mpsc::Sender<ServiceEvent>,
    /// Events waiting for room in `events`
    backlog: VecDeque<ServiceEvent>,
}

impl MeshNetworkService {
    /// Start the service and its crypto worker on the current runtime
    pub fn spawn(
        config: NetworkConfig,
        subnets: Vec<SubnetKey>,
        bearer: Arc<dyn MeshBearer>,
    ) -> MeshResult<(MeshNetworkHandle, mpsc::Receiver<ServiceEvent>)> {
        config.validate()?;

        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (result_tx, result_rx) = mpsc::unbounded_channel();
        tokio::spawn(crypto_worker(request_rx, result_tx));

        let mut layer = NetworkLayer::new(
            &config,
            ChannelCryptoEngine::new(request_tx),
            BufferedBearer::new(),
        );
        for key in subnets {
            layer.add_subnet(key);
        }

        let (command_tx, command_rx) = mpsc::channel(config.event_channel_capacity);
        let (event_tx, event_rx) = mpsc::channel(config.event_channel_capacity);

        let service = MeshNetworkService {
            layer,
            bearer,
            commands: command_rx,
            crypto_results: result_rx,
            events: event_tx,
            backlog: VecDeque::new(),
        };
        tokio::spawn(service.run());

        Ok((MeshNetworkHandle { commands: command_tx }, event_rx))
    }

    async fn run(mut self) {
        info!("Mesh network service started");
        let events = self.events.clone();
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("All handles dropped");
                        break;
                    }
                },
                Some(response) = self.crypto_results.recv() => {
                    self.layer.on_crypto_complete(response);
                }
                permit = events.reserve(), if !self.backlog.is_empty() => match permit {
                    Ok(permit) => {
                        if let Some(event) = self.backlog.pop_front() {
                            permit.send(event);
                        }
                    }
                    Err(closed) => {
                        debug!("Event consumer gone ({}), releasing backlog", closed);
                        while let Some(event) = self.backlog.pop_front() {
                            self.discard(event);
                        }
                    }
                },
            }

            self.transmit_ready().await;
            self.publish_events();
        }
        self.layer.reset();
        info!("Mesh network service stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Received {
                bytes,
                proxy,
                reply,
            } => {
                let result = if proxy {
                    self.layer.received_proxy_bytes(&bytes)
                } else {
                    self.layer.received_bytes(&bytes)
                };
                let _ = reply.send(result);
            }
            Command::Send {
                transport_pdu,
                netkey_index,
                header,
                proxy,
                reply,
            } => {
                let result = if proxy {
                    self.layer.send_proxy_pdu(&transport_pdu, netkey_index, header)
                } else {
                    self.layer.send_pdu(&transport_pdu, netkey_index, header)
                };
                let _ = reply.send(result);
            }
            Command::Processed { handle, reply } => {
                let _ = reply.send(self.layer.processed(handle));
            }
            Command::AddSubnet { key, reply } => {
                self.layer.add_subnet(key);
                let _ = reply.send(());
            }
            Command::SetIvIndex { iv_index, reply } => {
                self.layer.set_iv_index(iv_index);
                let _ = reply.send(());
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    /// Grant pending slot requests and put the PDUs on air
    async fn transmit_ready(&mut self) {
        self.layer.grant_send_slots();
        while let Some(frame) = self.layer.bearer_mut().pop_frame() {
            if let Err(e) = transmit_with_retry(self.bearer.as_ref(), &frame).await {
                warn!("Dropping network PDU after bearer failure: {}", e);
            }
        }
    }

    /// Hand layer events to the consumer without waiting for it
    fn publish_events(&mut self) {
        while let Some(event) = self.layer.poll_event() {
            let Some(event) = self.snapshot(event) else {
                continue;
            };
            if !self.backlog.is_empty() {
                self.backlog.push_back(event);
                continue;
            }
            match self.events.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(event)) => {
                    debug!("Event consumer is behind, backlogging {:?}", event);
                    self.backlog.push_back(event);
                }
                Err(TrySendError::Closed(event)) => self.discard(event),
            }
        }
    }

    /// Nobody will call processed() for a PDU in an undeliverable event
    fn discard(&mut self, event: ServiceEvent) {
        if let ServiceEvent::PduReceived(pdu) | ServiceEvent::ProxyPduReceived(pdu) = event {
            if let Err(e) = self.layer.processed(pdu.handle) {
                warn!("Releasing undelivered {} failed: {}", pdu.handle, e);
            }
        }
    }

    fn snapshot(&mut self, event: NetworkEvent) -> Option<ServiceEvent> {
        match event {
            NetworkEvent::PduReceived(handle) => {
                self.received(handle).map(ServiceEvent::PduReceived)
            }
            NetworkEvent::ProxyPduReceived(handle) => {
                self.received(handle).map(ServiceEvent::ProxyPduReceived)
            }
            NetworkEvent::ProxyPduEncrypted(handle) => {
                let pdu = self.layer.pdu(handle)?.as_bytes().to_vec();
                if let Err(e) = self.layer.processed(handle) {
                    error!("Releasing encrypted proxy {} failed: {}", handle, e);
                }
                Some(ServiceEvent::ProxyPduEncrypted { handle, pdu })
            }
            NetworkEvent::PduSent {
                handle,
                src,
                dst,
                seq,
            } => Some(ServiceEvent::PduSent {
                handle,
                src,
                dst,
                seq,
            }),
            NetworkEvent::SendFailed { handle, reason } => {
                Some(ServiceEvent::SendFailed { handle, reason })
            }
            NetworkEvent::Dropped { handle, reason } => {
                Some(ServiceEvent::Dropped { handle, reason })
            }
        }
    }

    fn received(&self, handle: PduHandle) -> Option<ReceivedPdu> {
        let pdu = self.layer.pdu(handle)?;
        Some(ReceivedPdu {
            handle,
            ctl: pdu.ctl(),
            ttl: pdu.ttl(),
            seq: pdu.seq(),
            src: pdu.src(),
            dst: pdu.dst(),
            netkey_index: pdu.netkey_index(),
            transport_pdu: pdu.transport_pdu().to_vec(),
        })
    }
}

/// Compute crypto requests until the engine side goes away
async fn crypto_worker(
    mut requests: mpsc::UnboundedReceiver<CryptoRequest>,
    results: mpsc::UnboundedSender<CryptoResponse>,
) {
    while let Some(request) = requests.recv().await {
        let response = SoftwareCrypto::process(&request);
        if results.send(response).is_err() {
            break;
        }
    }
    debug!("Crypto worker stopped");
}
