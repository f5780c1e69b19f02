//! Crypto pipeline state machine
//!
//! Decrypt: select key -> PECB -> de-obfuscate -> nonce -> CCM decrypt ->
//! verify NetMIC (mismatch: next key) -> address check + network cache.
//!
//! Encrypt: nonce -> CCM encrypt + append NetMIC -> PECB -> obfuscate.
//!
//! Every engine request is a suspension point. The state stored between
//! them carries everything needed to resume, and [`CryptoPipeline::advance`]
//! is the only way forward. At most one pipeline runs at a time.

use crate::address;
use crate::cache::{self, ReplayCache};
use crate::crypto::{CryptoEngine, CryptoResponse};
use crate::error::{MeshError, MeshResult};
use crate::nonce::{build_nonce, pecb_input};
use crate::pdu::{
    NetworkPdu, ENCRYPTED_OFFSET, MAX_NETWORK_PDU_LEN, NETWORK_HEADER_LEN, OBFUSCATED_RANGE,
};
use crate::pool::{PduHandle, PduPool};
use crate::subnet::SubnetKeyStore;
use tracing::{debug, error, trace};

/// Borrowed view of the layer state a pipeline step may touch
pub struct PipelineEnv<'a, E: CryptoEngine> {
    pub engine: &'a mut E,
    pub subnets: &'a SubnetKeyStore,
    pub pool: &'a mut PduPool,
    pub cache: &'a mut ReplayCache,
    pub iv_index: u32,
}

/// Result of starting or advancing a pipeline
#[derive(Debug)]
pub enum PipelineOutcome {
    /// A crypto request is in flight
    Pending,
    /// Decrypted and validated, the PDU in the pool now holds the plaintext
    Received { handle: PduHandle, proxy: bool },
    /// Encrypted and obfuscated, ready for dispatch
    Encrypted { handle: PduHandle },
    /// Received PDU rejected, to be released
    Dropped { handle: PduHandle, reason: MeshError },
    /// Outgoing PDU could not be encrypted, to be released
    SendFailed { handle: PduHandle, reason: MeshError },
}

/// Decrypt attempt state that survives across key candidates
#[derive(Debug)]
pub struct DecryptJob {
    handle: PduHandle,
    /// Received wire image, never modified
    wire: NetworkPdu,
    /// Subnet slots whose NID matches
    candidates: Vec<usize>,
    cursor: usize,
}

#[derive(Debug, Default)]
pub enum PipelineState {
    #[default]
    Idle,
    /// Waiting for the PECB of candidate `slot`
    DeobfuscateHeader { job: DecryptJob, slot: usize },
    /// Waiting for CCM decryption under candidate `slot`
    VerifyPayload {
        job: DecryptJob,
        slot: usize,
        clear: NetworkPdu,
        mic_len: usize,
    },
    /// Waiting for CCM encryption
    AppendMic {
        handle: PduHandle,
        slot: usize,
        mic_len: usize,
    },
    /// Waiting for the PECB of the encrypted PDU
    ObfuscateHeader { handle: PduHandle },
}

#[derive(Debug, Default)]
pub struct CryptoPipeline {
    state: PipelineState,
}

impl CryptoPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while a crypto request is outstanding
    pub fn is_active(&self) -> bool {
        !matches!(self.state, PipelineState::Idle)
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    /// Handle of the PDU currently being transformed
    pub fn current(&self) -> Option<PduHandle> {
        match &self.state {
            PipelineState::Idle => None,
            PipelineState::DeobfuscateHeader { job, .. } => Some(job.handle),
            PipelineState::VerifyPayload { job, .. } => Some(job.handle),
            PipelineState::AppendMic { handle, .. } => Some(*handle),
            PipelineState::ObfuscateHeader { handle } => Some(*handle),
        }
    }

    /// Begin validating a received PDU
    pub fn start_decrypt<E: CryptoEngine>(
        &mut self,
        env: &mut PipelineEnv<'_, E>,
        handle: PduHandle,
    ) -> PipelineOutcome {
        debug_assert!(!self.is_active(), "decrypt started while crypto is active");
        let Some(wire) = env.pool.get(handle).cloned() else {
            error!("Received {} vanished before validation", handle);
            return PipelineOutcome::Dropped {
                handle,
                reason: MeshError::UnknownPdu(handle.to_string()),
            };
        };
        let candidates = env.subnets.candidates_for_nid(wire.nid());
        trace!(
            "Validating {} ({} candidate keys): {}",
            handle,
            candidates.len(),
            hex::encode(wire.as_bytes())
        );
        let job = DecryptJob {
            handle,
            wire,
            candidates,
            cursor: 0,
        };
        self.select_key(env, job)
    }

    /// Begin encrypting an outgoing PDU
    pub fn start_encrypt<E: CryptoEngine>(
        &mut self,
        env: &mut PipelineEnv<'_, E>,
        handle: PduHandle,
    ) -> PipelineOutcome {
        debug_assert!(!self.is_active(), "encrypt started while crypto is active");
        let Some(pdu) = env.pool.get(handle) else {
            error!("Queued {} vanished before encryption", handle);
            return PipelineOutcome::SendFailed {
                handle,
                reason: MeshError::UnknownPdu(handle.to_string()),
            };
        };

        let netkey_index = pdu.netkey_index();
        let Some(slot) = env.subnets.slot_for_index(netkey_index) else {
            debug!("No subnet for netkey_index {}, dropping {}", netkey_index, handle);
            return PipelineOutcome::SendFailed {
                handle,
                reason: MeshError::UnknownNetKey(netkey_index),
            };
        };

        let mic_len = pdu.net_mic_len();
        if pdu.len() < NETWORK_HEADER_LEN || pdu.len() + mic_len > MAX_NETWORK_PDU_LEN {
            return PipelineOutcome::SendFailed {
                handle,
                reason: MeshError::MalformedPdu(format!(
                    "{} bytes plus {} byte NetMIC",
                    pdu.len(),
                    mic_len
                )),
            };
        }

        let nonce = build_nonce(pdu, env.iv_index);
        let payload = pdu.data()[ENCRYPTED_OFFSET..pdu.len()].to_vec();
        trace!(
            "Encrypting {}: {} nonce {}",
            handle,
            hex::encode(pdu.as_bytes()),
            hex::encode(nonce)
        );

        let Some(subnet) = env.subnets.get(slot) else {
            return PipelineOutcome::SendFailed {
                handle,
                reason: MeshError::UnknownNetKey(netkey_index),
            };
        };
        self.state = PipelineState::AppendMic {
            handle,
            slot,
            mic_len,
        };
        let submitted = env
            .engine
            .ccm_encrypt(&subnet.encryption_key, &nonce, &payload, mic_len);
        self.issued(submitted)
    }

    /// Resume with the result of the outstanding crypto request
    pub fn advance<E: CryptoEngine>(
        &mut self,
        env: &mut PipelineEnv<'_, E>,
        response: CryptoResponse,
    ) -> PipelineOutcome {
        match (std::mem::take(&mut self.state), response) {
            (PipelineState::Idle, response) => {
                error!("Crypto result {:?} without active pipeline", response);
                PipelineOutcome::Pending
            }
            (PipelineState::DeobfuscateHeader { job, slot }, CryptoResponse::Aes128(pecb)) => {
                self.deobfuscate(env, job, slot, &pecb)
            }
            (
                PipelineState::VerifyPayload {
                    job,
                    slot,
                    clear,
                    mic_len,
                },
                CryptoResponse::Ccm { output, tag },
            ) => self.verify(env, job, slot, clear, mic_len, output, tag),
            (
                PipelineState::AppendMic {
                    handle,
                    slot,
                    mic_len,
                },
                CryptoResponse::Ccm { output, tag },
            ) => self.append_mic(env, handle, slot, mic_len, output, tag),
            (PipelineState::ObfuscateHeader { handle }, CryptoResponse::Aes128(pecb)) => {
                self.obfuscate(env, handle, &pecb)
            }
            (
                PipelineState::DeobfuscateHeader { job, .. }
                | PipelineState::VerifyPayload { job, .. },
                response,
            ) => {
                debug!("Candidate key failed for {}: {:?}", job.handle, response);
                self.select_key(env, job)
            }
            (
                PipelineState::AppendMic { handle, .. } | PipelineState::ObfuscateHeader { handle },
                response,
            ) => PipelineOutcome::SendFailed {
                handle,
                reason: MeshError::Crypto(format!("unexpected crypto result {:?}", response)),
            },
        }
    }

    /// Pending if the engine took the request, otherwise the PDU is given up
    fn issued(&mut self, submitted: MeshResult<()>) -> PipelineOutcome {
        let Err(reason) = submitted else {
            return PipelineOutcome::Pending;
        };
        match std::mem::take(&mut self.state) {
            PipelineState::DeobfuscateHeader { job, .. }
            | PipelineState::VerifyPayload { job, .. } => {
                error!("Crypto engine refused request for {}: {}", job.handle, reason);
                PipelineOutcome::Dropped {
                    handle: job.handle,
                    reason,
                }
            }
            PipelineState::AppendMic { handle, .. } | PipelineState::ObfuscateHeader { handle } => {
                error!("Crypto engine refused request for {}: {}", handle, reason);
                PipelineOutcome::SendFailed { handle, reason }
            }
            PipelineState::Idle => {
                error!("Crypto engine refused request without pipeline: {}", reason);
                PipelineOutcome::Pending
            }
        }
    }

    fn select_key<E: CryptoEngine>(
        &mut self,
        env: &mut PipelineEnv<'_, E>,
        mut job: DecryptJob,
    ) -> PipelineOutcome {
        while job.cursor < job.candidates.len() {
            let slot = job.candidates[job.cursor];
            job.cursor += 1;
            let Some(subnet) = env.subnets.get(slot) else {
                continue;
            };
            let block = pecb_input(env.iv_index, job.wire.as_bytes());
            self.state = PipelineState::DeobfuscateHeader { job, slot };
            let submitted = env.engine.aes128_encrypt(&subnet.privacy_key, &block);
            return self.issued(submitted);
        }

        debug!("No valid network key found for {}", job.handle);
        PipelineOutcome::Dropped {
            handle: job.handle,
            reason: MeshError::NoValidKey,
        }
    }

    fn deobfuscate<E: CryptoEngine>(
        &mut self,
        env: &mut PipelineEnv<'_, E>,
        job: DecryptJob,
        slot: usize,
        pecb: &[u8; 16],
    ) -> PipelineOutcome {
        let mut clear = job.wire.clone();
        xor_header(&mut clear, pecb);

        let mic_len = clear.net_mic_len();
        let len = job.wire.len();
        if len < NETWORK_HEADER_LEN + mic_len {
            // a wrong key may flip CTL and ask for a NetMIC the PDU cannot hold
            trace!("{} too short for {} byte NetMIC under slot {}", job.handle, mic_len, slot);
            return self.select_key(env, job);
        }

        let Some(subnet) = env.subnets.get(slot) else {
            return self.select_key(env, job);
        };
        let nonce = build_nonce(&clear, env.iv_index);
        trace!("Nonce {} for {}", hex::encode(nonce), job.handle);
        let payload = job.wire.data()[ENCRYPTED_OFFSET..len - mic_len].to_vec();

        self.state = PipelineState::VerifyPayload {
            job,
            slot,
            clear,
            mic_len,
        };
        let submitted = env
            .engine
            .ccm_decrypt(&subnet.encryption_key, &nonce, &payload, mic_len);
        self.issued(submitted)
    }

    #[allow(clippy::too_many_arguments)]
    fn verify<E: CryptoEngine>(
        &mut self,
        env: &mut PipelineEnv<'_, E>,
        job: DecryptJob,
        slot: usize,
        mut clear: NetworkPdu,
        mic_len: usize,
        plaintext: Vec<u8>,
        tag: Vec<u8>,
    ) -> PipelineOutcome {
        let len = job.wire.len();
        let received_mic = &job.wire.data()[len - mic_len..len];
        if tag.as_slice() != received_mic || plaintext.len() != len - mic_len - ENCRYPTED_OFFSET {
            trace!("NetMIC mismatch for {} under slot {}, trying next key", job.handle, slot);
            return self.select_key(env, job);
        }

        clear.data_mut()[ENCRYPTED_OFFSET..len - mic_len].copy_from_slice(&plaintext);
        clear.set_len(len - mic_len);
        if let Some(subnet) = env.subnets.get(slot) {
            clear.netkey_index = subnet.netkey_index;
        }
        trace!("Decrypted {}: {}", job.handle, hex::encode(clear.as_bytes()));

        let handle = job.handle;
        let proxy = clear.is_proxy();
        if !proxy {
            if let Err(reason) = address::check(clear.ctl(), clear.src(), clear.dst()) {
                return PipelineOutcome::Dropped { handle, reason };
            }
            let hash = cache::hash(&clear);
            if env.cache.contains(hash) {
                debug!("{} found in network cache ({:08x}), dropping", handle, hash);
                return PipelineOutcome::Dropped {
                    handle,
                    reason: MeshError::ReplayDetected(hash),
                };
            }
            env.cache.insert(hash);
        }

        match env.pool.get_mut(handle) {
            Some(pdu) => {
                *pdu = clear;
                PipelineOutcome::Received { handle, proxy }
            }
            None => {
                error!("Received {} released during validation", handle);
                PipelineOutcome::Dropped {
                    handle,
                    reason: MeshError::UnknownPdu(handle.to_string()),
                }
            }
        }
    }

    fn append_mic<E: CryptoEngine>(
        &mut self,
        env: &mut PipelineEnv<'_, E>,
        handle: PduHandle,
        slot: usize,
        mic_len: usize,
        ciphertext: Vec<u8>,
        tag: Vec<u8>,
    ) -> PipelineOutcome {
        let Some(pdu) = env.pool.get_mut(handle) else {
            error!("Queued {} released during encryption", handle);
            return PipelineOutcome::SendFailed {
                handle,
                reason: MeshError::UnknownPdu(handle.to_string()),
            };
        };
        let len = pdu.len();
        if ciphertext.len() != len - ENCRYPTED_OFFSET || tag.len() != mic_len {
            return PipelineOutcome::SendFailed {
                handle,
                reason: MeshError::Crypto(format!(
                    "CCM returned {} + {} bytes for {} + {}",
                    ciphertext.len(),
                    tag.len(),
                    len - ENCRYPTED_OFFSET,
                    mic_len
                )),
            };
        }

        let data = pdu.data_mut();
        data[ENCRYPTED_OFFSET..len].copy_from_slice(&ciphertext);
        data[len..len + mic_len].copy_from_slice(&tag);
        pdu.set_len(len + mic_len);

        let Some(subnet) = env.subnets.get(slot) else {
            return PipelineOutcome::SendFailed {
                handle,
                reason: MeshError::UnknownNetKey(pdu.netkey_index()),
            };
        };
        let block = pecb_input(env.iv_index, pdu.as_bytes());
        self.state = PipelineState::ObfuscateHeader { handle };
        let submitted = env.engine.aes128_encrypt(&subnet.privacy_key, &block);
        self.issued(submitted)
    }

    fn obfuscate<E: CryptoEngine>(
        &mut self,
        env: &mut PipelineEnv<'_, E>,
        handle: PduHandle,
        pecb: &[u8; 16],
    ) -> PipelineOutcome {
        match env.pool.get_mut(handle) {
            Some(pdu) => {
                xor_header(pdu, pecb);
                trace!("Encrypted {}: {}", handle, hex::encode(pdu.as_bytes()));
                PipelineOutcome::Encrypted { handle }
            }
            None => {
                error!("Queued {} released during obfuscation", handle);
                PipelineOutcome::SendFailed {
                    handle,
                    reason: MeshError::UnknownPdu(handle.to_string()),
                }
            }
        }
    }
}

/// XOR CTL/TTL, SEQ and SRC with the PECB
fn xor_header(pdu: &mut NetworkPdu, pecb: &[u8; 16]) {
    let data = pdu.data_mut();
    for (byte, mask) in data[OBFUSCATED_RANGE].iter_mut().zip(pecb.iter()) {
        *byte ^= mask;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::DeferredCryptoEngine;
    use crate::nonce::Nonce;
    use crate::pdu::NetworkHeader;
    use crate::subnet::{Key128, SubnetKey};

    const IV_INDEX: u32 = 0x1234_5678;

    struct Harness {
        engine: DeferredCryptoEngine,
        subnets: SubnetKeyStore,
        pool: PduPool,
        cache: ReplayCache,
        pipeline: CryptoPipeline,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                engine: DeferredCryptoEngine::new(),
                subnets: SubnetKeyStore::new(),
                pool: PduPool::new(4),
                cache: ReplayCache::new(4),
                pipeline: CryptoPipeline::new(),
            }
        }

        fn run(
            &mut self,
            start: impl FnOnce(
                &mut CryptoPipeline,
                &mut PipelineEnv<'_, DeferredCryptoEngine>,
            ) -> PipelineOutcome,
        ) -> PipelineOutcome {
            let mut env = PipelineEnv {
                engine: &mut self.engine,
                subnets: &self.subnets,
                pool: &mut self.pool,
                cache: &mut self.cache,
                iv_index: IV_INDEX,
            };
            let mut outcome = start(&mut self.pipeline, &mut env);
            while let PipelineOutcome::Pending = outcome {
                let response = env.engine.complete_next().expect("request pending");
                outcome = self.pipeline.advance(&mut env, response);
            }
            outcome
        }
    }

    fn nid_68() -> SubnetKey {
        SubnetKey::new(
            0,
            0x68,
            hex::decode("0953fa93e7caac9638f58820220a398e").unwrap().try_into().unwrap(),
            hex::decode("8b84eedec100067d670971dd2aa700cf").unwrap().try_into().unwrap(),
        )
    }

    const MESSAGE1: &str = "68eca487516765b5e5bfdacbaf6cb7fb6bff871f035444ce83a670df";

    #[test]
    fn test_decrypt_reference_message() {
        let mut h = Harness::new();
        h.subnets.add(nid_68());
        let wire = hex::decode(MESSAGE1).unwrap();
        let handle = h.pool.allocate(NetworkPdu::from_wire(&wire, false).unwrap()).unwrap();

        let outcome = h.run(|p, env| p.start_decrypt(env, handle));
        assert!(matches!(outcome, PipelineOutcome::Received { proxy: false, .. }));
        assert!(!h.pipeline.is_active());

        let pdu = h.pool.get(handle).unwrap();
        assert_eq!(hex::encode(pdu.transport_pdu()), "034b50057e400000010000");
        assert_eq!(pdu.src(), 0x1201);
        assert_eq!(pdu.dst(), 0xfffd);
        assert_eq!(pdu.seq(), 1);
        assert!(pdu.ctl());
        assert_eq!(h.cache.len(), 1);
    }

    #[test]
    fn test_encrypt_reference_message() {
        let mut h = Harness::new();
        h.subnets.add(nid_68());
        let header = NetworkHeader::new(true, 0, 1, 0x1201, 0xfffd);
        let transport = hex::decode("034b50057e400000010000").unwrap();
        let pdu = NetworkPdu::setup(0, 0x68, 0, header, &transport, false).unwrap();
        let handle = h.pool.allocate(pdu).unwrap();

        let outcome = h.run(|p, env| p.start_encrypt(env, handle));
        assert!(matches!(outcome, PipelineOutcome::Encrypted { .. }));
        assert_eq!(hex::encode(h.pool.get(handle).unwrap().as_bytes()), MESSAGE1);
    }

    #[test]
    fn test_no_candidate_key() {
        let mut h = Harness::new();
        let wire = hex::decode(MESSAGE1).unwrap();
        let handle = h.pool.allocate(NetworkPdu::from_wire(&wire, false).unwrap()).unwrap();

        let outcome = h.run(|p, env| p.start_decrypt(env, handle));
        assert!(matches!(
            outcome,
            PipelineOutcome::Dropped { reason: MeshError::NoValidKey, .. }
        ));
        assert_eq!(h.engine.stats().aes128, 0);
    }

    #[test]
    fn test_tampered_mic_exhausts_keys() {
        let mut h = Harness::new();
        h.subnets.add(nid_68());
        let mut wire = hex::decode(MESSAGE1).unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0x01;
        let handle = h.pool.allocate(NetworkPdu::from_wire(&wire, false).unwrap()).unwrap();

        let outcome = h.run(|p, env| p.start_decrypt(env, handle));
        assert!(matches!(
            outcome,
            PipelineOutcome::Dropped { reason: MeshError::NoValidKey, .. }
        ));
        assert_eq!(h.engine.stats().ccm_decrypt, 1);
        assert!(h.cache.is_empty());
    }

    #[test]
    fn test_encrypt_unknown_netkey() {
        let mut h = Harness::new();
        let header = NetworkHeader::new(false, 4, 1, 0x0001, 0x0002);
        let pdu = NetworkPdu::setup(9, 0x68, 0, header, &[1, 2, 3], false).unwrap();
        let handle = h.pool.allocate(pdu).unwrap();

        let outcome = h.run(|p, env| p.start_encrypt(env, handle));
        assert!(matches!(
            outcome,
            PipelineOutcome::SendFailed { reason: MeshError::UnknownNetKey(9), .. }
        ));
        assert!(!h.pipeline.is_active());
    }

    #[test]
    fn test_active_while_request_outstanding() {
        let mut h = Harness::new();
        h.subnets.add(nid_68());
        let wire = hex::decode(MESSAGE1).unwrap();
        let handle = h.pool.allocate(NetworkPdu::from_wire(&wire, false).unwrap()).unwrap();

        let mut env = PipelineEnv {
            engine: &mut h.engine,
            subnets: &h.subnets,
            pool: &mut h.pool,
            cache: &mut h.cache,
            iv_index: IV_INDEX,
        };
        let outcome = h.pipeline.start_decrypt(&mut env, handle);
        assert!(matches!(outcome, PipelineOutcome::Pending));
        assert!(h.pipeline.is_active());
        assert_eq!(h.pipeline.current(), Some(handle));
        assert!(matches!(
            h.pipeline.state(),
            PipelineState::DeobfuscateHeader { .. }
        ));
    }

    /// Engine whose worker has gone away
    struct StoppedEngine;

    impl CryptoEngine for StoppedEngine {
        fn aes128_encrypt(&mut self, _: &Key128, _: &[u8; 16]) -> MeshResult<()> {
            Err(MeshError::Crypto("stopped".into()))
        }

        fn ccm_encrypt(&mut self, _: &Key128, _: &Nonce, _: &[u8], _: usize) -> MeshResult<()> {
            Err(MeshError::Crypto("stopped".into()))
        }

        fn ccm_decrypt(&mut self, _: &Key128, _: &Nonce, _: &[u8], _: usize) -> MeshResult<()> {
            Err(MeshError::Crypto("stopped".into()))
        }
    }

    #[test]
    fn test_refused_request_ends_pipeline() {
        let mut subnets = SubnetKeyStore::new();
        subnets.add(nid_68());
        let mut pool = PduPool::new(4);
        let mut cache = ReplayCache::new(4);
        let mut engine = StoppedEngine;
        let mut pipeline = CryptoPipeline::new();
        let mut env = PipelineEnv {
            engine: &mut engine,
            subnets: &subnets,
            pool: &mut pool,
            cache: &mut cache,
            iv_index: IV_INDEX,
        };

        let wire = hex::decode(MESSAGE1).unwrap();
        let received = env
            .pool
            .allocate(NetworkPdu::from_wire(&wire, false).unwrap())
            .unwrap();
        assert!(matches!(
            pipeline.start_decrypt(&mut env, received),
            PipelineOutcome::Dropped {
                reason: MeshError::Crypto(_),
                handle,
            } if handle == received
        ));
        assert!(!pipeline.is_active());

        let header = NetworkHeader::new(false, 4, 1, 0x0001, 0x0002);
        let pdu = NetworkPdu::setup(0, 0x68, 0, header, &[1, 2, 3], false).unwrap();
        let outgoing = env.pool.allocate(pdu).unwrap();
        assert!(matches!(
            pipeline.start_encrypt(&mut env, outgoing),
            PipelineOutcome::SendFailed {
                reason: MeshError::Crypto(_),
                handle,
            } if handle == outgoing
        ));
        assert!(!pipeline.is_active());
    }
}
