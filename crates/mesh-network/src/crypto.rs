//! Asynchronous crypto engine port
//!
//! The network layer never computes AES itself. It issues one request at a
//! time through [`CryptoEngine`] and resumes when the host hands the result
//! back via `NetworkLayer::on_crypto_complete`. Engines must not complete a
//! request from inside the submitting call.

use crate::error::{MeshError, MeshResult};
use crate::nonce::Nonce;
use crate::subnet::Key128;
use aes::cipher::BlockEncrypt;
use aes::Aes128;
use ccm::aead::generic_array::GenericArray;
use ccm::aead::{AeadInPlace, KeyInit};
use ccm::consts::{U13, U4, U8};
use ccm::Ccm;
use std::collections::VecDeque;
use std::fmt;
use tokio::sync::mpsc;
use tracing::{trace, warn};

type NetCcm32 = Ccm<Aes128, U4, U13>;
type NetCcm64 = Ccm<Aes128, U8, U13>;

/// Non-blocking AES primitives used by the network layer.
///
/// `Err` means the request was not accepted and no completion will follow.
pub trait CryptoEngine {
    /// AES-128 encrypt a single block
    fn aes128_encrypt(&mut self, key: &Key128, block: &[u8; 16]) -> MeshResult<()>;

    /// CCM encrypt `payload`, producing ciphertext and a `tag_len` byte MIC
    fn ccm_encrypt(
        &mut self,
        key: &Key128,
        nonce: &Nonce,
        payload: &[u8],
        tag_len: usize,
    ) -> MeshResult<()>;

    /// CCM decrypt `payload`, producing plaintext and the MIC computed over it
    fn ccm_decrypt(
        &mut self,
        key: &Key128,
        nonce: &Nonce,
        payload: &[u8],
        tag_len: usize,
    ) -> MeshResult<()>;
}

#[derive(Clone)]
pub enum CryptoRequest {
    Aes128 {
        key: Key128,
        block: [u8; 16],
    },
    CcmEncrypt {
        key: Key128,
        nonce: Nonce,
        payload: Vec<u8>,
        tag_len: usize,
    },
    CcmDecrypt {
        key: Key128,
        nonce: Nonce,
        payload: Vec<u8>,
        tag_len: usize,
    },
}

impl fmt::Debug for CryptoRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CryptoRequest::Aes128 { .. } => write!(f, "Aes128"),
            CryptoRequest::CcmEncrypt { payload, tag_len, .. } => {
                write!(f, "CcmEncrypt({} bytes, mic {})", payload.len(), tag_len)
            }
            CryptoRequest::CcmDecrypt { payload, tag_len, .. } => {
                write!(f, "CcmDecrypt({} bytes, mic {})", payload.len(), tag_len)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CryptoResponse {
    Aes128([u8; 16]),
    Ccm { output: Vec<u8>, tag: Vec<u8> },
    Failed(String),
}

/// Synchronous RustCrypto implementation of the engine primitives
pub struct SoftwareCrypto;

impl SoftwareCrypto {
    pub fn aes128(key: &Key128, block: &[u8; 16]) -> [u8; 16] {
        let cipher = Aes128::new(GenericArray::from_slice(key));
        let mut out = GenericArray::clone_from_slice(block);
        cipher.encrypt_block(&mut out);
        let mut result = [0u8; 16];
        result.copy_from_slice(&out);
        result
    }

    pub fn ccm_encrypt(
        key: &Key128,
        nonce: &Nonce,
        payload: &[u8],
        tag_len: usize,
    ) -> MeshResult<(Vec<u8>, Vec<u8>)> {
        let mut buffer = payload.to_vec();
        let tag = ccm_seal(key, nonce, &mut buffer, tag_len)?;
        Ok((buffer, tag))
    }

    /// Decrypt without verifying, returning the plaintext and the expected MIC.
    pub fn ccm_decrypt(
        key: &Key128,
        nonce: &Nonce,
        payload: &[u8],
        tag_len: usize,
    ) -> MeshResult<(Vec<u8>, Vec<u8>)> {
        // CTR keystream is data independent, sealing the ciphertext yields the plaintext
        let mut plaintext = payload.to_vec();
        ccm_seal(key, nonce, &mut plaintext, tag_len)?;
        let mut scratch = plaintext.clone();
        let tag = ccm_seal(key, nonce, &mut scratch, tag_len)?;
        Ok((plaintext, tag))
    }

    pub fn process(request: &CryptoRequest) -> CryptoResponse {
        let result = match request {
            CryptoRequest::Aes128 { key, block } => {
                return CryptoResponse::Aes128(Self::aes128(key, block))
            }
            CryptoRequest::CcmEncrypt {
                key,
                nonce,
                payload,
                tag_len,
            } => Self::ccm_encrypt(key, nonce, payload, *tag_len),
            CryptoRequest::CcmDecrypt {
                key,
                nonce,
                payload,
                tag_len,
            } => Self::ccm_decrypt(key, nonce, payload, *tag_len),
        };
        match result {
            Ok((output, tag)) => CryptoResponse::Ccm { output, tag },
            Err(e) => {
                warn!("Crypto request {:?} failed: {}", request, e);
                CryptoResponse::Failed(e.to_string())
            }
        }
    }
}

fn ccm_seal(
    key: &Key128,
    nonce: &Nonce,
    buffer: &mut [u8],
    tag_len: usize,
) -> MeshResult<Vec<u8>> {
    let key = GenericArray::from_slice(key);
    let nonce = GenericArray::from_slice(nonce);
    let tag = match tag_len {
        4 => NetCcm32::new(key)
            .encrypt_in_place_detached(nonce, &[], buffer)?
            .to_vec(),
        8 => NetCcm64::new(key)
            .encrypt_in_place_detached(nonce, &[], buffer)?
            .to_vec(),
        other => {
            return Err(MeshError::Crypto(format!(
                "unsupported NetMIC length {}",
                other
            )))
        }
    };
    Ok(tag)
}

/// Number of primitive calls issued to an engine
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CryptoStats {
    pub aes128: usize,
    pub ccm_encrypt: usize,
    pub ccm_decrypt: usize,
}

/// Engine that queues requests until the host completes them.
///
/// Mirrors a hardware controller: nothing happens until
/// [`DeferredCryptoEngine::complete_next`] is called.
#[derive(Default)]
pub struct DeferredCryptoEngine {
    pending: VecDeque<CryptoRequest>,
    stats: CryptoStats,
}

impl DeferredCryptoEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> CryptoStats {
        self.stats
    }

    /// Compute the oldest queued request
    pub fn complete_next(&mut self) -> Option<CryptoResponse> {
        let request = self.pending.pop_front()?;
        trace!("Completing {:?}", request);
        Some(SoftwareCrypto::process(&request))
    }

    fn submit(&mut self, request: CryptoRequest) -> MeshResult<()> {
        debug_assert!(
            self.pending.is_empty(),
            "network layer issued a second crypto request while one is pending"
        );
        self.pending.push_back(request);
        Ok(())
    }
}

impl CryptoEngine for DeferredCryptoEngine {
    fn aes128_encrypt(&mut self, key: &Key128, block: &[u8; 16]) -> MeshResult<()> {
        self.stats.aes128 += 1;
        self.submit(CryptoRequest::Aes128 {
            key: *key,
            block: *block,
        })
    }

    fn ccm_encrypt(
        &mut self,
        key: &Key128,
        nonce: &Nonce,
        payload: &[u8],
        tag_len: usize,
    ) -> MeshResult<()> {
        self.stats.ccm_encrypt += 1;
        self.submit(CryptoRequest::CcmEncrypt {
            key: *key,
            nonce: *nonce,
            payload: payload.to_vec(),
            tag_len,
        })
    }

    fn ccm_decrypt(
        &mut self,
        key: &Key128,
        nonce: &Nonce,
        payload: &[u8],
        tag_len: usize,
    ) -> MeshResult<()> {
        self.stats.ccm_decrypt += 1;
        self.submit(CryptoRequest::CcmDecrypt {
            key: *key,
            nonce: *nonce,
            payload: payload.to_vec(),
            tag_len,
        })
    }
}

/// Engine that forwards requests to a worker task over a channel
pub struct ChannelCryptoEngine {
    requests: mpsc::UnboundedSender<CryptoRequest>,
}

impl ChannelCryptoEngine {
    pub fn new(requests: mpsc::UnboundedSender<CryptoRequest>) -> Self {
        Self { requests }
    }

    fn submit(&mut self, request: CryptoRequest) -> MeshResult<()> {
        self.requests.send(request).map_err(|e| {
            warn!("Crypto worker stopped, {:?} not computed", e.0);
            MeshError::Crypto("crypto worker stopped".to_string())
        })
    }
}

impl CryptoEngine for ChannelCryptoEngine {
    fn aes128_encrypt(&mut self, key: &Key128, block: &[u8; 16]) -> MeshResult<()> {
        self.submit(CryptoRequest::Aes128 {
            key: *key,
            block: *block,
        })
    }

    fn ccm_encrypt(
        &mut self,
        key: &Key128,
        nonce: &Nonce,
        payload: &[u8],
        tag_len: usize,
    ) -> MeshResult<()> {
        self.submit(CryptoRequest::CcmEncrypt {
            key: *key,
            nonce: *nonce,
            payload: payload.to_vec(),
            tag_len,
        })
    }

    fn ccm_decrypt(
        &mut self,
        key: &Key128,
        nonce: &Nonce,
        payload: &[u8],
        tag_len: usize,
    ) -> MeshResult<()> {
        self.submit(CryptoRequest::CcmDecrypt {
            key: *key,
            nonce: *nonce,
            payload: payload.to_vec(),
            tag_len,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key16(hex_str: &str) -> Key128 {
        hex::decode(hex_str).unwrap().try_into().unwrap()
    }

    fn nonce13(hex_str: &str) -> Nonce {
        hex::decode(hex_str).unwrap().try_into().unwrap()
    }

    #[test]
    fn test_aes128_fips197_vector() {
        let key = key16("000102030405060708090a0b0c0d0e0f");
        let block: [u8; 16] = hex::decode("00112233445566778899aabbccddeeff")
            .unwrap()
            .try_into()
            .unwrap();
        assert_eq!(
            hex::encode(SoftwareCrypto::aes128(&key, &block)),
            "69c4e0d86a7b0430d8cdb78070b4c55a"
        );
    }

    #[test]
    fn test_ccm_decrypt_inverts_encrypt() {
        let key = key16("0953fa93e7caac9638f58820220a398e");
        let nonce = nonce13("00800000011201000012345678");
        let plaintext = hex::decode("fffd034b50057e400000010000").unwrap();

        for tag_len in [4, 8] {
            let (ciphertext, tag) =
                SoftwareCrypto::ccm_encrypt(&key, &nonce, &plaintext, tag_len).unwrap();
            assert_eq!(tag.len(), tag_len);
            assert_ne!(ciphertext, plaintext);

            let (decrypted, computed) =
                SoftwareCrypto::ccm_decrypt(&key, &nonce, &ciphertext, tag_len).unwrap();
            assert_eq!(decrypted, plaintext);
            assert_eq!(computed, tag);
        }
    }

    #[test]
    fn test_ccm_rejects_odd_mic_length() {
        let key = [0u8; 16];
        let nonce = [0u8; 13];
        assert!(matches!(
            SoftwareCrypto::ccm_encrypt(&key, &nonce, &[1, 2, 3], 5),
            Err(MeshError::Crypto(_))
        ));
        let request = CryptoRequest::CcmDecrypt {
            key,
            nonce,
            payload: vec![1, 2, 3],
            tag_len: 5,
        };
        assert!(matches!(
            SoftwareCrypto::process(&request),
            CryptoResponse::Failed(_)
        ));
    }

    #[test]
    fn test_deferred_engine_completes_only_when_pumped() {
        let mut engine = DeferredCryptoEngine::new();
        engine.aes128_encrypt(&[0u8; 16], &[0u8; 16]).unwrap();
        assert_eq!(engine.pending(), 1);
        assert_eq!(engine.stats().aes128, 1);

        assert!(matches!(
            engine.complete_next(),
            Some(CryptoResponse::Aes128(_))
        ));
        assert_eq!(engine.pending(), 0);
        assert!(engine.complete_next().is_none());
    }

    #[tokio::test]
    async fn test_channel_engine_forwards_requests() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut engine = ChannelCryptoEngine::new(tx);
        engine.ccm_decrypt(&[1u8; 16], &[2u8; 13], &[3, 4, 5], 4).unwrap();

        match rx.recv().await {
            Some(CryptoRequest::CcmDecrypt { payload, tag_len, .. }) => {
                assert_eq!(payload, vec![3, 4, 5]);
                assert_eq!(tag_len, 4);
            }
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[test]
    fn test_channel_engine_reports_stopped_worker() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut engine = ChannelCryptoEngine::new(tx);
        drop(rx);

        assert!(matches!(
            engine.aes128_encrypt(&[0u8; 16], &[0u8; 16]),
            Err(MeshError::Crypto(_))
        ));
    }
}
