//! Reverse index from client MAC to logical-port key.
//!
//! This mapping is the single authority for roaming detection: a MAC
//! maps to at most one logical port system-wide. It carries its own
//! lock; readers hold it across a single lookup only.

use std::collections::BTreeMap;
use std::sync::RwLock;

use pac_common::{LPortKey, MacAddr, PacError, PacResult};

/// Ordered MAC → logical-port-key map.
#[derive(Debug, Default)]
pub struct MacIndex {
    map: RwLock<BTreeMap<MacAddr, LPortKey>>,
}

impl MacIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `mac` to `key`. The zero MAC is rejected. Inserting a MAC
    /// that already maps overwrites the old mapping (roaming).
    pub fn insert(&self, mac: MacAddr, key: LPortKey) -> PacResult<()> {
        if mac.is_zero() {
            return Err(PacError::invalid("zero MAC"));
        }
        self.map.write().expect("mac index poisoned").insert(mac, key);
        Ok(())
    }

    pub fn find(&self, mac: MacAddr) -> Option<LPortKey> {
        self.map.read().expect("mac index poisoned").get(&mac).copied()
    }

    /// Next mapping after `mac` in ascending MAC order.
    pub fn find_next(&self, mac: MacAddr) -> Option<(MacAddr, LPortKey)> {
        use std::ops::Bound;
        self.map
            .read()
            .expect("mac index poisoned")
            .range((Bound::Excluded(mac), Bound::Unbounded))
            .next()
            .map(|(m, k)| (*m, *k))
    }

    /// Removes a mapping; unknown MACs are a no-op.
    pub fn remove(&self, mac: MacAddr) {
        self.map.write().expect("mac index poisoned").remove(&mac);
    }

    pub fn len(&self) -> usize {
        self.map.read().expect("mac index poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pac_common::LPortKind;

    fn mac(last: u8) -> MacAddr {
        MacAddr([0, 0x11, 0x22, 0x33, 0x44, last])
    }

    fn key(port: u32) -> LPortKey {
        LPortKey::pack(port, 0, LPortKind::Logical)
    }

    #[test]
    fn test_insert_find_remove() {
        let idx = MacIndex::new();
        idx.insert(mac(1), key(4)).unwrap();
        assert_eq!(idx.find(mac(1)), Some(key(4)));
        idx.remove(mac(1));
        assert_eq!(idx.find(mac(1)), None);
        idx.remove(mac(1));
    }

    #[test]
    fn test_zero_mac_rejected() {
        let idx = MacIndex::new();
        assert!(idx.insert(MacAddr::ZERO, key(1)).is_err());
        assert!(idx.is_empty());
    }

    #[test]
    fn test_roaming_overwrites() {
        let idx = MacIndex::new();
        idx.insert(mac(1), key(4)).unwrap();
        idx.insert(mac(1), key(5)).unwrap();
        assert_eq!(idx.find(mac(1)), Some(key(5)));
        assert_eq!(idx.len(), 1);
    }

    #[test]
    fn test_find_next_ascending() {
        let idx = MacIndex::new();
        idx.insert(mac(3), key(1)).unwrap();
        idx.insert(mac(1), key(2)).unwrap();
        idx.insert(mac(2), key(3)).unwrap();

        let mut cur = MacAddr::ZERO;
        let mut seen = Vec::new();
        while let Some((m, _)) = idx.find_next(cur) {
            seen.push(m);
            cur = m;
        }
        assert_eq!(seen, vec![mac(1), mac(2), mac(3)]);
    }
}
