//! Network and proxy nonces, PECB input block

use crate::pdu::{NetworkPdu, ENCRYPTED_OFFSET};

pub const NONCE_LEN: usize = 13;

const NETWORK_NONCE_TYPE: u8 = 0x00;
const PROXY_NONCE_TYPE: u8 = 0x03;

pub type Nonce = [u8; NONCE_LEN];

/// `[0x00, CTL|TTL, SEQ, SRC, 0x0000, IV Index]`
pub fn network_nonce(pdu: &NetworkPdu, iv_index: u32) -> Nonce {
    let data = pdu.data();
    let mut nonce = [0u8; NONCE_LEN];
    nonce[0] = NETWORK_NONCE_TYPE;
    nonce[1..7].copy_from_slice(&data[1..7]);
    nonce[9..13].copy_from_slice(&iv_index.to_be_bytes());
    nonce
}

/// `[0x03, 0x00, SEQ, SRC, 0x0000, IV Index]`
pub fn proxy_nonce(pdu: &NetworkPdu, iv_index: u32) -> Nonce {
    let data = pdu.data();
    let mut nonce = [0u8; NONCE_LEN];
    nonce[0] = PROXY_NONCE_TYPE;
    nonce[2..7].copy_from_slice(&data[2..7]);
    nonce[9..13].copy_from_slice(&iv_index.to_be_bytes());
    nonce
}

/// Nonce matching the framing of `pdu`. Expects a clear header.
pub fn build_nonce(pdu: &NetworkPdu, iv_index: u32) -> Nonce {
    if pdu.is_proxy() {
        proxy_nonce(pdu, iv_index)
    } else {
        network_nonce(pdu, iv_index)
    }
}

/// Privacy plaintext: `0x0000000000 || IV Index || first 7 encrypted bytes`
pub fn pecb_input(iv_index: u32, wire: &[u8]) -> [u8; 16] {
    let mut block = [0u8; 16];
    block[5..9].copy_from_slice(&iv_index.to_be_bytes());
    let available = wire.len().saturating_sub(ENCRYPTED_OFFSET).min(7);
    block[9..9 + available].copy_from_slice(&wire[ENCRYPTED_OFFSET..ENCRYPTED_OFFSET + available]);
    block
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::NetworkHeader;

    fn message1() -> NetworkPdu {
        let header = NetworkHeader::new(true, 0, 1, 0x1201, 0xfffd);
        NetworkPdu::setup(0, 0x68, 0, header, &[0x03, 0x4b], false).unwrap()
    }

    #[test]
    fn test_network_nonce() {
        let nonce = network_nonce(&message1(), 0x1234_5678);
        assert_eq!(hex::encode(nonce), "00800000011201000012345678");
    }

    #[test]
    fn test_proxy_nonce() {
        let header = NetworkHeader::new(true, 0, 1, 0x0001, 0x0000);
        let pdu = NetworkPdu::setup(0, 0x10, 0, header, &[0, 0], true).unwrap();
        let nonce = build_nonce(&pdu, 0x1234_5678);
        assert_eq!(hex::encode(nonce), "03000000010001000012345678");
    }

    #[test]
    fn test_build_nonce_selects_network_framing() {
        let pdu = message1();
        assert_eq!(build_nonce(&pdu, 7), network_nonce(&pdu, 7));
    }

    #[test]
    fn test_pecb_input() {
        let wire = hex::decode("68eca487516765b5e5bfdacbaf6cb7fb6bff871f035444ce83a670df").unwrap();
        let block = pecb_input(0x1234_5678, &wire);
        assert_eq!(hex::encode(block), "000000000012345678b5e5bfdacbaf6c");
    }

    #[test]
    fn test_pecb_input_short_pdu() {
        let block = pecb_input(1, &[0u8; 10]);
        assert_eq!(&block[5..9], &[0, 0, 0, 1]);
        assert_eq!(&block[12..], &[0u8; 4]);
    }
}
