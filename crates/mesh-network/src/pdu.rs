//! Network PDU wire model
//!
//! Layout of a network PDU on the wire:
//!
//! ```text
//! | IVI:1 NID:7 | CTL:1 TTL:7 | SEQ:24 | SRC:16 | DST:16 | TransportPDU | NetMIC:32/64 |
//! |   clear     |<------- obfuscated ------->|<------------ encrypted ------>|
//! ```
//!
//! The same buffer holds the plaintext form (before encryption, or after
//! successful decryption with the NetMIC stripped) and the wire form.

use crate::error::{MeshError, MeshResult};
use std::fmt;

/// Largest network PDU carried by an advertising or proxy bearer
pub const MAX_NETWORK_PDU_LEN: usize = 29;

/// IVI/NID, CTL/TTL, SEQ, SRC and DST
pub const NETWORK_HEADER_LEN: usize = 9;

/// Smallest advertising PDU: header without DST plus the shortest NetMIC
pub const MIN_NETWORK_PDU_LEN: usize = 13;

/// First byte of the encrypted part (DST)
pub const ENCRYPTED_OFFSET: usize = 7;

/// Header bytes covered by obfuscation (CTL/TTL, SEQ, SRC)
pub const OBFUSCATED_RANGE: std::ops::Range<usize> = 1..7;

pub const NET_MIC_LEN_ACCESS: usize = 4;
pub const NET_MIC_LEN_CONTROL: usize = 8;

pub const MAX_TTL: u8 = 0x7f;

/// What happens to a PDU once its encryption pipeline completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Queue for the bearer, report `PduSent` after transmission
    Transmit,
    /// Queue for the bearer, release silently after transmission
    Relay,
    /// Hand the encrypted PDU back to the caller (proxy framing)
    Deliver,
}

/// Routing fields of a network PDU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkHeader {
    pub ctl: bool,
    pub ttl: u8,
    pub seq: u32,
    pub src: u16,
    pub dst: u16,
}

impl NetworkHeader {
    pub fn new(ctl: bool, ttl: u8, seq: u32, src: u16, dst: u16) -> Self {
        Self {
            ctl,
            ttl,
            seq,
            src,
            dst,
        }
    }

    /// Packed CTL/TTL byte
    pub fn ctl_ttl(&self) -> u8 {
        ((self.ctl as u8) << 7) | (self.ttl & MAX_TTL)
    }
}

/// NetMIC length selected by the CTL bit of the CTL/TTL byte
pub fn net_mic_len_for(ctl_ttl: u8) -> usize {
    if ctl_ttl & 0x80 != 0 {
        NET_MIC_LEN_CONTROL
    } else {
        NET_MIC_LEN_ACCESS
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct NetworkPdu {
    data: [u8; MAX_NETWORK_PDU_LEN],
    len: usize,
    pub(crate) netkey_index: u16,
    is_proxy: bool,
    pub(crate) completion: Option<Completion>,
    /// Clear header of a locally built PDU, kept across obfuscation
    origin: Option<NetworkHeader>,
}

impl NetworkPdu {
    /// Wrap received wire bytes
    pub fn from_wire(bytes: &[u8], is_proxy: bool) -> MeshResult<Self> {
        if bytes.is_empty() || bytes.len() > MAX_NETWORK_PDU_LEN {
            return Err(MeshError::MalformedPdu(format!(
                "length {} outside 1..={}",
                bytes.len(),
                MAX_NETWORK_PDU_LEN
            )));
        }
        let mut data = [0u8; MAX_NETWORK_PDU_LEN];
        data[..bytes.len()].copy_from_slice(bytes);
        Ok(Self {
            data,
            len: bytes.len(),
            netkey_index: 0,
            is_proxy,
            completion: None,
            origin: None,
        })
    }

    /// Build a plaintext PDU ready for encryption.
    ///
    /// `ivi` is the low bit of the current IV index. The transport PDU must
    /// leave room for the NetMIC selected by `header.ctl`.
    pub fn setup(
        netkey_index: u16,
        nid: u8,
        ivi: u8,
        header: NetworkHeader,
        transport_pdu: &[u8],
        is_proxy: bool,
    ) -> MeshResult<Self> {
        let mic_len = net_mic_len_for(header.ctl_ttl());
        let total = NETWORK_HEADER_LEN + transport_pdu.len() + mic_len;
        if total > MAX_NETWORK_PDU_LEN {
            return Err(MeshError::MalformedPdu(format!(
                "transport PDU of {} bytes does not fit ({} > {})",
                transport_pdu.len(),
                total,
                MAX_NETWORK_PDU_LEN
            )));
        }

        let mut data = [0u8; MAX_NETWORK_PDU_LEN];
        data[0] = ((ivi & 1) << 7) | (nid & 0x7f);
        data[1] = header.ctl_ttl();
        data[2..5].copy_from_slice(&header.seq.to_be_bytes()[1..]);
        data[5..7].copy_from_slice(&header.src.to_be_bytes());
        data[7..9].copy_from_slice(&header.dst.to_be_bytes());
        data[NETWORK_HEADER_LEN..NETWORK_HEADER_LEN + transport_pdu.len()]
            .copy_from_slice(transport_pdu);

        let mut pdu = Self {
            data,
            len: NETWORK_HEADER_LEN + transport_pdu.len(),
            netkey_index,
            is_proxy,
            completion: None,
            origin: None,
        };
        pdu.origin = Some(pdu.header());
        Ok(pdu)
    }

    pub fn ivi(&self) -> u8 {
        self.data[0] >> 7
    }

    pub fn nid(&self) -> u8 {
        self.data[0] & 0x7f
    }

    pub fn ctl_ttl(&self) -> u8 {
        self.data[1]
    }

    pub fn ctl(&self) -> bool {
        self.data[1] & 0x80 != 0
    }

    pub fn ttl(&self) -> u8 {
        self.data[1] & MAX_TTL
    }

    pub fn seq(&self) -> u32 {
        u32::from_be_bytes([0, self.data[2], self.data[3], self.data[4]])
    }

    pub fn src(&self) -> u16 {
        u16::from_be_bytes([self.data[5], self.data[6]])
    }

    pub fn dst(&self) -> u16 {
        u16::from_be_bytes([self.data[7], self.data[8]])
    }

    pub fn header(&self) -> NetworkHeader {
        NetworkHeader::new(self.ctl(), self.ttl(), self.seq(), self.src(), self.dst())
    }

    /// NetMIC length implied by the (clear) CTL bit
    pub fn net_mic_len(&self) -> usize {
        net_mic_len_for(self.data[1])
    }

    /// SEG bit of the lower transport header
    pub fn is_segmented(&self) -> bool {
        self.len > NETWORK_HEADER_LEN && self.data[NETWORK_HEADER_LEN] & 0x80 != 0
    }

    /// Lower transport PDU of a plaintext PDU
    pub fn transport_pdu(&self) -> &[u8] {
        if self.len <= NETWORK_HEADER_LEN {
            return &[];
        }
        &self.data[NETWORK_HEADER_LEN..self.len]
    }

    pub fn transport_pdu_len(&self) -> usize {
        self.len.saturating_sub(NETWORK_HEADER_LEN)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn netkey_index(&self) -> u16 {
        self.netkey_index
    }

    pub fn is_proxy(&self) -> bool {
        self.is_proxy
    }

    pub fn completion(&self) -> Option<Completion> {
        self.completion
    }

    /// Header as passed to [`NetworkPdu::setup`]. `None` for received PDUs.
    ///
    /// Unlike [`NetworkPdu::header`] this stays readable once the PDU has
    /// been encrypted and obfuscated.
    pub fn origin(&self) -> Option<NetworkHeader> {
        self.origin
    }

    pub(crate) fn data(&self) -> &[u8; MAX_NETWORK_PDU_LEN] {
        &self.data
    }

    pub(crate) fn data_mut(&mut self) -> &mut [u8; MAX_NETWORK_PDU_LEN] {
        &mut self.data
    }

    pub(crate) fn set_len(&mut self, len: usize) {
        debug_assert!(len <= MAX_NETWORK_PDU_LEN);
        self.len = len.min(MAX_NETWORK_PDU_LEN);
    }

    pub(crate) fn set_ctl_ttl(&mut self, ctl: bool, ttl: u8) {
        self.data[1] = ((ctl as u8) << 7) | (ttl & MAX_TTL);
    }
}

impl fmt::Debug for NetworkPdu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkPdu")
            .field("data", &hex::encode(self.as_bytes()))
            .field("netkey_index", &self.netkey_index)
            .field("is_proxy", &self.is_proxy)
            .field("completion", &self.completion)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_header_fields() {
        let header = NetworkHeader::new(true, 0, 1, 0x1201, 0xfffd);
        let transport = hex::decode("034b50057e400000010000").unwrap();
        let pdu = NetworkPdu::setup(0, 0x68, 0, header, &transport, false).unwrap();

        assert_eq!(
            hex::encode(pdu.as_bytes()),
            "68800000011201fffd034b50057e400000010000"
        );
        assert_eq!(pdu.nid(), 0x68);
        assert_eq!(pdu.ivi(), 0);
        assert!(pdu.ctl());
        assert_eq!(pdu.ttl(), 0);
        assert_eq!(pdu.seq(), 1);
        assert_eq!(pdu.src(), 0x1201);
        assert_eq!(pdu.dst(), 0xfffd);
        assert_eq!(pdu.net_mic_len(), NET_MIC_LEN_CONTROL);
        assert_eq!(pdu.transport_pdu(), transport.as_slice());
        assert_eq!(pdu.header(), header);
        assert_eq!(pdu.origin(), Some(header));
    }

    #[test]
    fn test_setup_masks_fields() {
        let header = NetworkHeader::new(false, 0xff, 0x0abc_def0, 0x0001, 0x0002);
        let pdu = NetworkPdu::setup(3, 0xff, 3, header, &[0x80], false).unwrap();

        assert_eq!(pdu.nid(), 0x7f);
        assert_eq!(pdu.ivi(), 1);
        assert_eq!(pdu.ttl(), 0x7f);
        assert_eq!(pdu.seq(), 0x00bc_def0);
        assert_eq!(pdu.netkey_index(), 3);
        assert!(pdu.is_segmented());
        assert_eq!(pdu.net_mic_len(), NET_MIC_LEN_ACCESS);
        assert_eq!(
            pdu.origin(),
            Some(NetworkHeader::new(false, 0x7f, 0x00bc_def0, 0x0001, 0x0002))
        );
    }

    #[test]
    fn test_setup_rejects_oversized_transport_pdu() {
        let access = NetworkHeader::new(false, 4, 1, 0x0001, 0x0002);
        assert!(NetworkPdu::setup(0, 1, 0, access, &[0u8; 16], false).is_ok());
        assert!(matches!(
            NetworkPdu::setup(0, 1, 0, access, &[0u8; 17], false),
            Err(MeshError::MalformedPdu(_))
        ));

        let control = NetworkHeader::new(true, 4, 1, 0x0001, 0x0002);
        assert!(NetworkPdu::setup(0, 1, 0, control, &[0u8; 12], false).is_ok());
        assert!(NetworkPdu::setup(0, 1, 0, control, &[0u8; 13], false).is_err());
    }

    #[test]
    fn test_from_wire_length_bounds() {
        assert!(NetworkPdu::from_wire(&[], false).is_err());
        assert!(NetworkPdu::from_wire(&[0u8; 30], false).is_err());

        let pdu = NetworkPdu::from_wire(&[0u8; 29], true).unwrap();
        assert_eq!(pdu.len(), 29);
        assert!(pdu.is_proxy());
        assert_eq!(pdu.completion(), None);
        assert_eq!(pdu.origin(), None);
    }

    #[test]
    fn test_set_ctl_ttl() {
        let header = NetworkHeader::new(true, 5, 1, 0x0001, 0x0002);
        let mut pdu = NetworkPdu::setup(0, 1, 0, header, &[1, 2], false).unwrap();
        pdu.set_ctl_ttl(true, 4);
        assert!(pdu.ctl());
        assert_eq!(pdu.ttl(), 4);
    }
}
