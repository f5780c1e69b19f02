//! Network layer: PDU queues, scheduler and public API
//!
//! Received PDUs wait in `inbound_to_validate`, locally originated and
//! relayed PDUs in `outbound_queued`. Whenever the crypto pipeline is idle
//! the scheduler starts the next job, inbound first. Encrypted PDUs wait in
//! `outbound_ready_to_transmit` until the bearer grants a slot.
//!
//! Nothing here blocks: every entry point enqueues, kicks the scheduler and
//! returns. Results are reported through [`NetworkLayer::poll_event`].

use crate::bearer::{Bearer, BufferedBearer};
use crate::cache::ReplayCache;
use crate::config::NetworkConfig;
use crate::crypto::{CryptoEngine, CryptoResponse, DeferredCryptoEngine};
use crate::error::{MeshError, MeshResult};
use crate::pdu::{
    Completion, NetworkHeader, NetworkPdu, MAX_NETWORK_PDU_LEN, MIN_NETWORK_PDU_LEN,
};
use crate::pipeline::{CryptoPipeline, PipelineEnv, PipelineOutcome};
use crate::pool::{PduHandle, PduPool};
use crate::relay::{self, RelayDecision};
use crate::subnet::{ProvisioningData, SubnetKey, SubnetKeyStore};
use std::collections::{HashSet, VecDeque};
use tracing::{debug, error, info, trace, warn};

/// Node-wide state shared by every network layer operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkContext {
    pub iv_index: u32,
    pub primary_address: u16,
    pub element_count: u16,
}

impl NetworkContext {
    /// IVI bit carried in the first PDU byte
    pub fn ivi(&self) -> u8 {
        (self.iv_index & 1) as u8
    }

    /// Whether `addr` belongs to one of our elements
    pub fn is_own_address(&self, addr: u16) -> bool {
        let first = self.primary_address as u32;
        let addr = addr as u32;
        addr >= first && addr < first + self.element_count as u32
    }
}

impl From<&NetworkConfig> for NetworkContext {
    fn from(config: &NetworkConfig) -> Self {
        Self {
            iv_index: config.iv_index,
            primary_address: config.primary_address,
            element_count: config.element_count,
        }
    }
}

/// Notifications for the higher layer and the host
#[derive(Debug)]
pub enum NetworkEvent {
    /// Validated, de-duplicated PDU; call `processed` when done
    PduReceived(PduHandle),
    /// Decrypted proxy PDU; call `processed` when done
    ProxyPduReceived(PduHandle),
    /// Proxy PDU from `send_proxy_pdu` is encrypted; call `processed` when done
    ProxyPduEncrypted(PduHandle),
    /// Locally originated PDU handed to the bearer and released
    PduSent {
        handle: PduHandle,
        src: u16,
        dst: u16,
        seq: u32,
    },
    /// Outgoing PDU could not be encrypted and was released
    SendFailed { handle: PduHandle, reason: MeshError },
    /// Received PDU rejected and released
    Dropped { handle: PduHandle, reason: MeshError },
}

/// Lengths of inbound, outbound and ready-to-transmit queues
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLengths {
    pub inbound_to_validate: usize,
    pub outbound_queued: usize,
    pub outbound_ready_to_transmit: usize,
}

pub struct NetworkLayer<E: CryptoEngine, B: Bearer> {
    context: NetworkContext,
    engine: E,
    bearer: B,
    subnets: SubnetKeyStore,
    pool: PduPool,
    cache: ReplayCache,
    pipeline: CryptoPipeline,
    inbound_to_validate: VecDeque<PduHandle>,
    outbound_queued: VecDeque<PduHandle>,
    outbound_ready_to_transmit: VecDeque<PduHandle>,
    /// PDUs owned by the higher layer until `processed`
    delivered: HashSet<PduHandle>,
    events: VecDeque<NetworkEvent>,
}

impl<E: CryptoEngine, B: Bearer> NetworkLayer<E, B> {
    pub fn new(config: &NetworkConfig, engine: E, bearer: B) -> Self {
        info!(
            "Initializing network layer: pool {}, cache {}, IV index {:08x}, primary {:04x}",
            config.pool_size, config.cache_size, config.iv_index, config.primary_address
        );
        Self {
            context: NetworkContext::from(config),
            engine,
            bearer,
            subnets: SubnetKeyStore::new(),
            pool: PduPool::new(config.pool_size),
            cache: ReplayCache::new(config.cache_size),
            pipeline: CryptoPipeline::new(),
            inbound_to_validate: VecDeque::new(),
            outbound_queued: VecDeque::new(),
            outbound_ready_to_transmit: VecDeque::new(),
            delivered: HashSet::new(),
            events: VecDeque::new(),
        }
    }

    pub fn add_subnet(&mut self, key: SubnetKey) {
        self.subnets.add(key);
    }

    pub fn add_from_provisioning_data(&mut self, data: &ProvisioningData) {
        self.subnets.add_from_provisioning_data(data);
    }

    pub fn subnets(&self) -> &SubnetKeyStore {
        &self.subnets
    }

    pub fn set_iv_index(&mut self, iv_index: u32) {
        info!("IV index {:08x} -> {:08x}", self.context.iv_index, iv_index);
        self.context.iv_index = iv_index;
    }

    pub fn iv_index(&self) -> u32 {
        self.context.iv_index
    }

    pub fn set_primary_element_address(&mut self, addr: u16) {
        self.context.primary_address = addr;
    }

    pub fn set_element_count(&mut self, count: u16) {
        self.context.element_count = count;
    }

    pub fn context(&self) -> &NetworkContext {
        &self.context
    }

    /// Queue a PDU received over the advertising bearer
    pub fn received_bytes(&mut self, raw: &[u8]) -> MeshResult<PduHandle> {
        if raw.len() < MIN_NETWORK_PDU_LEN || raw.len() > MAX_NETWORK_PDU_LEN {
            debug!("Ignoring network PDU of {} bytes", raw.len());
            return Err(MeshError::MalformedPdu(format!(
                "length {} outside {}..={}",
                raw.len(),
                MIN_NETWORK_PDU_LEN,
                MAX_NETWORK_PDU_LEN
            )));
        }
        self.enqueue_received(raw, false)
    }

    /// Queue a PDU received over the proxy (GATT) bearer
    pub fn received_proxy_bytes(&mut self, raw: &[u8]) -> MeshResult<PduHandle> {
        self.enqueue_received(raw, true)
    }

    fn enqueue_received(&mut self, raw: &[u8], is_proxy: bool) -> MeshResult<PduHandle> {
        let pdu = NetworkPdu::from_wire(raw, is_proxy)?;
        let handle = self.pool.allocate(pdu)?;
        trace!("Received {} ({} bytes, proxy {})", handle, raw.len(), is_proxy);
        self.inbound_to_validate.push_back(handle);
        self.run();
        Ok(handle)
    }

    /// Encrypt `transport_pdu` under subnet `netkey_index` and transmit it
    pub fn send_pdu(
        &mut self,
        transport_pdu: &[u8],
        netkey_index: u16,
        header: NetworkHeader,
    ) -> MeshResult<PduHandle> {
        self.enqueue_outgoing(transport_pdu, netkey_index, header, false, Completion::Transmit)
    }

    /// Encrypt `transport_pdu` with proxy framing and hand it back through
    /// [`NetworkEvent::ProxyPduEncrypted`]
    pub fn send_proxy_pdu(
        &mut self,
        transport_pdu: &[u8],
        netkey_index: u16,
        header: NetworkHeader,
    ) -> MeshResult<PduHandle> {
        self.enqueue_outgoing(transport_pdu, netkey_index, header, true, Completion::Deliver)
    }

    fn enqueue_outgoing(
        &mut self,
        transport_pdu: &[u8],
        netkey_index: u16,
        header: NetworkHeader,
        is_proxy: bool,
        completion: Completion,
    ) -> MeshResult<PduHandle> {
        let nid = self
            .subnets
            .find_by_index(netkey_index)
            .map(|subnet| subnet.nid)
            .ok_or(MeshError::UnknownNetKey(netkey_index))?;

        let mut pdu = NetworkPdu::setup(
            netkey_index,
            nid,
            self.context.ivi(),
            header,
            transport_pdu,
            is_proxy,
        )?;
        pdu.completion = Some(completion);

        let handle = self.pool.allocate(pdu)?;
        debug!(
            "Queued {} {:04x} -> {:04x} seq {:06x} ttl {} ctl {}",
            handle, header.src, header.dst, header.seq, header.ttl, header.ctl
        );
        self.outbound_queued.push_back(handle);
        self.run();
        Ok(handle)
    }

    /// Resume the crypto pipeline with the engine's result
    pub fn on_crypto_complete(&mut self, response: CryptoResponse) {
        if !self.pipeline.is_active() {
            error!("Crypto completion {:?} without active pipeline", response);
            return;
        }
        let outcome = {
            let (pipeline, mut env) = self.split();
            pipeline.advance(&mut env, response)
        };
        self.finish(outcome);
        self.run();
    }

    /// Bearer slot granted: transmit the oldest ready PDU
    pub fn on_can_send_now(&mut self) {
        let Some(handle) = self.outbound_ready_to_transmit.pop_front() else {
            trace!("Transmit slot without ready PDU");
            return;
        };
        let mut pdu = match self.pool.release(handle) {
            Ok(pdu) => pdu,
            Err(e) => {
                error!("Ready queue held {}: {}", handle, e);
                return;
            }
        };
        self.bearer.transmit(pdu.as_bytes());

        match pdu.completion.take() {
            Some(Completion::Transmit) => {
                debug!("Sent {} ({} bytes)", handle, pdu.len());
                // header bytes are obfuscated by now
                match pdu.origin() {
                    Some(origin) => self.events.push_back(NetworkEvent::PduSent {
                        handle,
                        src: origin.src,
                        dst: origin.dst,
                        seq: origin.seq,
                    }),
                    None => error!("Sent {} without its clear header", handle),
                }
            }
            Some(Completion::Relay) => {
                trace!("Relayed {} ({} bytes)", handle, pdu.len());
            }
            other => {
                error!("Transmitted {} with completion {:?}", handle, other);
            }
        }
    }

    /// Higher layer is done with a PDU it was handed.
    ///
    /// Received PDUs are relayed when allowed, everything else is released.
    pub fn processed(&mut self, handle: PduHandle) -> MeshResult<()> {
        if !self.delivered.remove(&handle) {
            error!("processed() for {} which the higher layer does not own", handle);
            return Err(MeshError::UnknownPdu(handle.to_string()));
        }

        let decision = match self.pool.get(handle) {
            Some(pdu) if pdu.is_proxy() || pdu.completion() == Some(Completion::Deliver) => {
                RelayDecision::Release
            }
            Some(pdu) => relay::relay_decision(pdu, &self.context),
            None => {
                error!("Delivered {} missing from pool", handle);
                return Err(MeshError::UnknownPdu(handle.to_string()));
            }
        };

        match decision {
            RelayDecision::Forward { ttl } => {
                if let Some(pdu) = self.pool.get_mut(handle) {
                    relay::prepare_for_relay(pdu, ttl);
                }
                self.outbound_queued.push_back(handle);
                self.run();
            }
            RelayDecision::Release => {
                self.pool.release(handle)?;
            }
        }
        Ok(())
    }

    pub fn poll_event(&mut self) -> Option<NetworkEvent> {
        self.events.pop_front()
    }

    pub fn pdu(&self, handle: PduHandle) -> Option<&NetworkPdu> {
        self.pool.get(handle)
    }

    pub fn is_crypto_active(&self) -> bool {
        self.pipeline.is_active()
    }

    pub fn queue_lengths(&self) -> QueueLengths {
        QueueLengths {
            inbound_to_validate: self.inbound_to_validate.len(),
            outbound_queued: self.outbound_queued.len(),
            outbound_ready_to_transmit: self.outbound_ready_to_transmit.len(),
        }
    }

    pub fn pool_available(&self) -> usize {
        self.pool.available()
    }

    /// Network cache of advertising PDUs seen so far
    pub fn replay_cache(&self) -> &ReplayCache {
        &self.cache
    }

    /// Release every queued PDU. A pipeline in flight runs to completion.
    pub fn reset(&mut self) {
        let queued = self
            .inbound_to_validate
            .drain(..)
            .chain(self.outbound_queued.drain(..))
            .chain(self.outbound_ready_to_transmit.drain(..))
            .collect::<Vec<_>>();
        info!("Network layer reset, releasing {} queued PDUs", queued.len());
        for handle in queued {
            if let Err(e) = self.pool.release(handle) {
                warn!("Reset could not release {}: {}", handle, e);
            }
        }
    }

    /// Log the content of all queues and the PDU being transformed
    pub fn dump(&self) {
        for (name, queue) in [
            ("inbound_to_validate", &self.inbound_to_validate),
            ("outbound_queued", &self.outbound_queued),
            ("outbound_ready_to_transmit", &self.outbound_ready_to_transmit),
        ] {
            debug!("Queue {}: {} PDUs", name, queue.len());
            for handle in queue {
                if let Some(pdu) = self.pool.get(*handle) {
                    debug!("- {}: {}", handle, hex::encode(pdu.as_bytes()));
                }
            }
        }
        match self.pipeline.current().and_then(|h| self.pool.get(h).map(|pdu| (h, pdu))) {
            Some((handle, pdu)) => {
                debug!("In pipeline: {}: {}", handle, hex::encode(pdu.as_bytes()))
            }
            None => debug!("In pipeline: none"),
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn bearer(&self) -> &B {
        &self.bearer
    }

    pub fn bearer_mut(&mut self) -> &mut B {
        &mut self.bearer
    }

    /// Scheduler step, repeated until a request is in flight or nothing is queued
    fn run(&mut self) {
        while !self.pipeline.is_active() {
            let outcome = if let Some(handle) = self.inbound_to_validate.pop_front() {
                let (pipeline, mut env) = self.split();
                pipeline.start_decrypt(&mut env, handle)
            } else if let Some(handle) = self.outbound_queued.pop_front() {
                let (pipeline, mut env) = self.split();
                pipeline.start_encrypt(&mut env, handle)
            } else {
                return;
            };
            self.finish(outcome);
        }
    }

    fn split(&mut self) -> (&mut CryptoPipeline, PipelineEnv<'_, E>) {
        (
            &mut self.pipeline,
            PipelineEnv {
                engine: &mut self.engine,
                subnets: &self.subnets,
                pool: &mut self.pool,
                cache: &mut self.cache,
                iv_index: self.context.iv_index,
            },
        )
    }

    /// Act on a terminal pipeline outcome
    fn finish(&mut self, outcome: PipelineOutcome) {
        match outcome {
            PipelineOutcome::Pending => {}
            PipelineOutcome::Received { handle, proxy } => {
                self.delivered.insert(handle);
                self.events.push_back(if proxy {
                    NetworkEvent::ProxyPduReceived(handle)
                } else {
                    NetworkEvent::PduReceived(handle)
                });
            }
            PipelineOutcome::Encrypted { handle } => self.dispatch(handle),
            PipelineOutcome::Dropped { handle, reason } => {
                debug!("Dropping {}: {}", handle, reason);
                self.release_quietly(handle);
                self.events.push_back(NetworkEvent::Dropped { handle, reason });
            }
            PipelineOutcome::SendFailed { handle, reason } => {
                warn!("Failed to send {}: {}", handle, reason);
                self.release_quietly(handle);
                self.events.push_back(NetworkEvent::SendFailed { handle, reason });
            }
        }
    }

    fn dispatch(&mut self, handle: PduHandle) {
        let completion = self.pool.get(handle).and_then(NetworkPdu::completion);
        match completion {
            Some(Completion::Transmit) | Some(Completion::Relay) => {
                self.outbound_ready_to_transmit.push_back(handle);
                self.bearer.request_can_send_now();
            }
            Some(Completion::Deliver) => {
                self.delivered.insert(handle);
                self.events.push_back(NetworkEvent::ProxyPduEncrypted(handle));
            }
            None => {
                error!("Encrypted {} has no completion", handle);
                self.release_quietly(handle);
            }
        }
    }

    fn release_quietly(&mut self, handle: PduHandle) {
        if self.pool.contains(handle) {
            let _ = self.pool.release(handle);
        }
    }
}

impl<B: Bearer> NetworkLayer<DeferredCryptoEngine, B> {
    /// Complete queued crypto requests until the pipeline goes idle.
    /// Returns the number of completions delivered.
    pub fn run_until_idle(&mut self) -> usize {
        let mut completed = 0;
        while let Some(response) = self.engine.complete_next() {
            completed += 1;
            self.on_crypto_complete(response);
        }
        completed
    }
}

impl<E: CryptoEngine> NetworkLayer<E, BufferedBearer> {
    /// Grant every outstanding slot request. Returns the number granted.
    pub fn grant_send_slots(&mut self) -> usize {
        let mut granted = 0;
        while self.bearer.take_slot_request() {
            granted += 1;
            self.on_can_send_now();
        }
        granted
    }
}
