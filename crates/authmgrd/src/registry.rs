//! Logical-port registry: the keyed store of per-client entries.
//!
//! Keys pack the physical port into the high bits, so a `BTreeMap`
//! gives stable slot-ordered iteration within a port and cheap
//! cross-port walks. Entries are owned exclusively by the registry;
//! everything else holds plain key values.

use std::collections::BTreeMap;

use pac_common::{HostMode, LPortKey, LPortKind, PacError, PacResult};

use crate::types::{LogicalPort, MAX_USERS_PER_PORT};

/// Keyed map of logical ports.
#[derive(Debug, Default)]
pub struct LogicalPortRegistry {
    nodes: BTreeMap<u32, LogicalPort>,
}

impl LogicalPortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the first free slot on `phys_port`. The fresh entry
    /// is blank apart from its key. Fails with `CapacityExceeded`
    /// when the port is full or its host mode does not allow dynamic
    /// allocation.
    pub fn alloc(
        &mut self,
        phys_port: u32,
        max_users: u32,
        host_mode: HostMode,
    ) -> PacResult<&mut LogicalPort> {
        if !host_mode.allows_dynamic_alloc() {
            return Err(PacError::CapacityExceeded { port: phys_port });
        }
        self.alloc_slot(phys_port, max_users.min(MAX_USERS_PER_PORT))
    }

    /// Allocates the synthetic entry used by the force-authorized and
    /// force-unauthorized port modes; bypasses the host-mode gate.
    pub fn alloc_synthetic(&mut self, phys_port: u32) -> PacResult<&mut LogicalPort> {
        self.alloc_slot(phys_port, 1)
    }

    fn alloc_slot(&mut self, phys_port: u32, slots: u32) -> PacResult<&mut LogicalPort> {
        for slot in 0..slots {
            let key = LPortKey::pack(phys_port, slot, LPortKind::Logical);
            if !self.nodes.contains_key(&key.0) {
                let entry = self.nodes.entry(key.0).or_insert_with(|| LogicalPort::new(key));
                return Ok(entry);
            }
        }
        Err(PacError::CapacityExceeded { port: phys_port })
    }

    pub fn get(&self, key: LPortKey) -> Option<&LogicalPort> {
        self.nodes.get(&key.0)
    }

    pub fn get_mut(&mut self, key: LPortKey) -> Option<&mut LogicalPort> {
        self.nodes.get_mut(&key.0)
    }

    /// Iterates entries of one physical port in slot order. Pass
    /// `LPortKey::ITERATE` in `cursor` to (re)start; the cursor is
    /// advanced to the returned entry's key.
    pub fn next_on_port(&self, phys_port: u32, cursor: &mut u32) -> Option<&LogicalPort> {
        let start = if *cursor == LPortKey::ITERATE {
            LPortKey::pack(phys_port, 0, LPortKind::Logical).0
        } else {
            *cursor + 1
        };
        let end = LPortKey::pack(phys_port, MAX_USERS_PER_PORT, LPortKind::Logical).0;
        let (key, node) = self.nodes.range(start..end).next()?;
        *cursor = *key;
        Some(node)
    }

    /// Iterates the whole registry in key order, advancing across
    /// ports. Pass `LPortKey::ITERATE` to start.
    pub fn next_global(&self, cursor: &mut u32) -> Option<&LogicalPort> {
        let start = if *cursor == LPortKey::ITERATE {
            0
        } else {
            cursor.checked_add(1)?
        };
        let (key, node) = self.nodes.range(start..).next()?;
        *cursor = *key;
        Some(node)
    }

    /// Removes an entry. Freeing an already-free key is a no-op.
    pub fn free(&mut self, key: LPortKey) {
        self.nodes.remove(&key.0);
    }

    /// Number of entries on one physical port.
    pub fn count_on_port(&self, phys_port: u32) -> u32 {
        let start = LPortKey::pack(phys_port, 0, LPortKind::Logical).0;
        let end = LPortKey::pack(phys_port, MAX_USERS_PER_PORT, LPortKind::Logical).0;
        self.nodes.range(start..end).count() as u32
    }

    /// Total number of entries.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Keys of every entry on `phys_port`, slot order. Used by
    /// handlers that mutate entries while iterating.
    pub fn keys_on_port(&self, phys_port: u32) -> Vec<LPortKey> {
        let start = LPortKey::pack(phys_port, 0, LPortKind::Logical).0;
        let end = LPortKey::pack(phys_port, MAX_USERS_PER_PORT, LPortKind::Logical).0;
        self.nodes.range(start..end).map(|(k, _)| LPortKey(*k)).collect()
    }

    /// Keys of every entry in the registry.
    pub fn all_keys(&self) -> Vec<LPortKey> {
        self.nodes.keys().map(|k| LPortKey(*k)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pac_common::MacAddr;

    #[test]
    fn test_alloc_assigns_slots_in_order() {
        let mut reg = LogicalPortRegistry::new();
        let k0 = reg.alloc(4, 8, HostMode::MultiAuth).unwrap().key;
        let k1 = reg.alloc(4, 8, HostMode::MultiAuth).unwrap().key;
        assert_eq!(k0.slot(), 0);
        assert_eq!(k1.slot(), 1);
        assert_eq!(k0.phys_port(), 4);
        assert_eq!(reg.count_on_port(4), 2);
    }

    #[test]
    fn test_alloc_reuses_freed_slot() {
        let mut reg = LogicalPortRegistry::new();
        let k0 = reg.alloc(1, 4, HostMode::MultiAuth).unwrap().key;
        let _k1 = reg.alloc(1, 4, HostMode::MultiAuth).unwrap().key;
        reg.free(k0);
        let k2 = reg.alloc(1, 4, HostMode::MultiAuth).unwrap().key;
        assert_eq!(k2.slot(), 0);
    }

    #[test]
    fn test_capacity_exceeded_leaves_registry_unchanged() {
        let mut reg = LogicalPortRegistry::new();
        reg.alloc(6, 2, HostMode::MultiAuth).unwrap();
        reg.alloc(6, 2, HostMode::MultiAuth).unwrap();
        let err = reg.alloc(6, 2, HostMode::MultiAuth).unwrap_err();
        assert_eq!(err, PacError::CapacityExceeded { port: 6 });
        assert_eq!(reg.count_on_port(6), 2);
    }

    #[test]
    fn test_host_mode_gate() {
        let mut reg = LogicalPortRegistry::new();
        assert!(reg.alloc(1, 4, HostMode::Invalid).is_err());
        assert!(reg.alloc_synthetic(1).is_ok());
    }

    #[test]
    fn test_fresh_entry_is_blank() {
        let mut reg = LogicalPortRegistry::new();
        let lp = reg.alloc(2, 4, HostMode::SingleAuth).unwrap();
        assert!(lp.client.mac.is_zero());
        assert!(lp.client.executed_methods.is_empty());
        assert_eq!(lp.key.phys_port(), 2);
    }

    #[test]
    fn test_per_port_iteration() {
        let mut reg = LogicalPortRegistry::new();
        for port in [1u32, 2, 2, 3] {
            reg.alloc(port, 8, HostMode::MultiAuth).unwrap();
        }
        let mut cursor = LPortKey::ITERATE;
        let mut slots = Vec::new();
        while let Some(lp) = reg.next_on_port(2, &mut cursor) {
            slots.push(lp.key.slot());
        }
        assert_eq!(slots, vec![0, 1]);

        // restart
        cursor = LPortKey::ITERATE;
        assert!(reg.next_on_port(2, &mut cursor).is_some());
    }

    #[test]
    fn test_iteration_stable_across_resume() {
        let mut reg = LogicalPortRegistry::new();
        for _ in 0..3 {
            reg.alloc(5, 8, HostMode::MultiAuth).unwrap();
        }
        let mut cursor = LPortKey::ITERATE;
        let first = reg.next_on_port(5, &mut cursor).unwrap().key;
        // resuming with the same cursor skips the entry already seen
        let second = reg.next_on_port(5, &mut cursor).unwrap().key;
        assert!(second.slot() > first.slot());
    }

    #[test]
    fn test_global_iteration_crosses_ports() {
        let mut reg = LogicalPortRegistry::new();
        reg.alloc(1, 4, HostMode::MultiAuth).unwrap();
        reg.alloc(3, 4, HostMode::MultiAuth).unwrap();
        reg.alloc(7, 4, HostMode::MultiAuth).unwrap();

        let mut cursor = LPortKey::ITERATE;
        let mut ports = Vec::new();
        while let Some(lp) = reg.next_global(&mut cursor) {
            ports.push(lp.phys_port());
        }
        assert_eq!(ports, vec![1, 3, 7]);
    }

    #[test]
    fn test_free_is_idempotent() {
        let mut reg = LogicalPortRegistry::new();
        let key = reg.alloc(1, 4, HostMode::MultiAuth).unwrap().key;
        reg.free(key);
        reg.free(key);
        assert!(reg.is_empty());
    }

    #[test]
    fn test_get_mut_updates_entry() {
        let mut reg = LogicalPortRegistry::new();
        let key = reg.alloc(1, 4, HostMode::MultiAuth).unwrap().key;
        let mac = MacAddr([0xde, 0xad, 0xbe, 0xef, 0, 1]);
        reg.get_mut(key).unwrap().client.mac = mac;
        assert_eq!(reg.get(key).unwrap().client.mac, mac);
    }
}
