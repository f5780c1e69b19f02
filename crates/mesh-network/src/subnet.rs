//! Subnet key storage
//!
//! Every subnet carries its own key material derived during provisioning. On
//! receive the NID only narrows down the candidates, several subnets may
//! share one, so the decrypt pipeline tries each candidate in insertion order.

use std::fmt;
use tracing::info;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub type Key128 = [u8; 16];

/// Key material of a single subnet
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SubnetKey {
    pub netkey_index: u16,
    pub nid: u8,
    pub encryption_key: Key128,
    pub privacy_key: Key128,
    pub beacon_key: Key128,
    pub network_id: [u8; 8],
}

impl SubnetKey {
    pub fn new(netkey_index: u16, nid: u8, encryption_key: Key128, privacy_key: Key128) -> Self {
        Self {
            netkey_index,
            nid: nid & 0x7f,
            encryption_key,
            privacy_key,
            beacon_key: [0; 16],
            network_id: [0; 8],
        }
    }

    pub fn with_beacon_material(mut self, beacon_key: Key128, network_id: [u8; 8]) -> Self {
        self.beacon_key = beacon_key;
        self.network_id = network_id;
        self
    }
}

impl fmt::Debug for SubnetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // keys stay out of logs
        f.debug_struct("SubnetKey")
            .field("netkey_index", &self.netkey_index)
            .field("nid", &format_args!("{:02x}", self.nid))
            .field("network_id", &hex::encode(self.network_id))
            .finish_non_exhaustive()
    }
}

/// Network key material as handed over by provisioning
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ProvisioningData {
    pub netkey_index: u16,
    pub nid: u8,
    pub encryption_key: Key128,
    pub privacy_key: Key128,
    pub beacon_key: Key128,
    pub network_id: [u8; 8],
}

impl From<&ProvisioningData> for SubnetKey {
    fn from(data: &ProvisioningData) -> Self {
        SubnetKey::new(
            data.netkey_index,
            data.nid,
            data.encryption_key,
            data.privacy_key,
        )
        .with_beacon_material(data.beacon_key, data.network_id)
    }
}

/// Append-only list of subnet keys.
///
/// Keys are never removed while the layer runs, so a slot index stays valid
/// across the suspension points of a decrypt pipeline.
#[derive(Default)]
pub struct SubnetKeyStore {
    keys: Vec<SubnetKey>,
}

impl SubnetKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subnet. A key with an already known netkey index replaces the
    /// outbound lookup for that index but stays a decrypt candidate.
    pub fn add(&mut self, key: SubnetKey) {
        info!(
            "Adding subnet netkey_index={} nid={:02x}",
            key.netkey_index, key.nid
        );
        self.keys.push(key);
    }

    pub fn add_from_provisioning_data(&mut self, data: &ProvisioningData) {
        self.add(SubnetKey::from(data));
    }

    /// Subnets whose NID matches, in insertion order
    pub fn find_by_nid(&self, nid: u8) -> impl Iterator<Item = &SubnetKey> + '_ {
        let nid = nid & 0x7f;
        self.keys.iter().filter(move |key| key.nid == nid)
    }

    /// Slot indices of the subnets matching `nid`, used as decrypt cursor
    pub fn candidates_for_nid(&self, nid: u8) -> Vec<usize> {
        let nid = nid & 0x7f;
        self.keys
            .iter()
            .enumerate()
            .filter(|(_, key)| key.nid == nid)
            .map(|(slot, _)| slot)
            .collect()
    }

    /// Subnet used for sending with `netkey_index` (latest one wins)
    pub fn find_by_index(&self, netkey_index: u16) -> Option<&SubnetKey> {
        self.keys
            .iter()
            .rev()
            .find(|key| key.netkey_index == netkey_index)
    }

    /// Slot of the subnet [`find_by_index`](Self::find_by_index) returns
    pub fn slot_for_index(&self, netkey_index: u16) -> Option<usize> {
        self.keys
            .iter()
            .rposition(|key| key.netkey_index == netkey_index)
    }

    pub fn get(&self, slot: usize) -> Option<&SubnetKey> {
        self.keys.get(slot)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(netkey_index: u16, nid: u8, fill: u8) -> SubnetKey {
        SubnetKey::new(netkey_index, nid, [fill; 16], [fill; 16])
    }

    #[test]
    fn test_find_by_nid_in_insertion_order() {
        let mut store = SubnetKeyStore::new();
        store.add(key(0, 0x68, 1));
        store.add(key(1, 0x5e, 2));
        store.add(key(2, 0x68, 3));

        let found: Vec<u16> = store.find_by_nid(0x68).map(|k| k.netkey_index).collect();
        assert_eq!(found, vec![0, 2]);
        assert_eq!(store.candidates_for_nid(0x68), vec![0, 2]);
        assert_eq!(store.candidates_for_nid(0x10), Vec::<usize>::new());
    }

    #[test]
    fn test_nid_is_seven_bits() {
        let mut store = SubnetKeyStore::new();
        store.add(key(0, 0xe8, 1));
        assert_eq!(store.get(0).unwrap().nid, 0x68);
        // IVI bit of the first PDU byte does not disturb matching
        assert_eq!(store.find_by_nid(0xe8).count(), 1);
    }

    #[test]
    fn test_find_by_index() {
        let mut store = SubnetKeyStore::new();
        assert!(store.is_empty());
        store.add(key(0, 0x68, 1));
        store.add(key(7, 0x10, 2));

        assert_eq!(store.find_by_index(7).unwrap().nid, 0x10);
        assert!(store.find_by_index(3).is_none());
        assert_eq!(store.slot_for_index(7), Some(1));

        store.add(key(0, 0x22, 3));
        assert_eq!(store.slot_for_index(0), Some(2));
        assert_eq!(store.find_by_index(0).unwrap().nid, 0x22);
        // the replaced key still decrypts
        assert_eq!(store.len(), 3);
        assert_eq!(store.candidates_for_nid(0x68), vec![0]);
    }

    #[test]
    fn test_from_provisioning_data() {
        let data = ProvisioningData {
            netkey_index: 4,
            nid: 0x10,
            encryption_key: [1; 16],
            privacy_key: [2; 16],
            beacon_key: [3; 16],
            network_id: [4; 8],
        };
        let mut store = SubnetKeyStore::new();
        store.add_from_provisioning_data(&data);

        let subnet = store.find_by_index(4).unwrap();
        assert_eq!(subnet.privacy_key, [2; 16]);
        assert_eq!(subnet.beacon_key, [3; 16]);
        assert_eq!(subnet.network_id, [4; 8]);
    }

    #[test]
    fn test_debug_hides_keys() {
        let rendered = format!("{:?}", key(0, 0x68, 0xab));
        assert!(!rendered.contains("abab"));
        assert!(rendered.contains("68"));
    }
}
