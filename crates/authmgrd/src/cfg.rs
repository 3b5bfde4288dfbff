//! Collaborator contracts: Platform Configuration and the Network
//! Interface Manager.
//!
//! Both are synchronous in-process surfaces; the daemon releases its
//! write lock around every call so a collaborator that posts back
//! onto the event bus cannot deadlock the worker. The recording
//! doubles here back the test suites, capturing calls in order and
//! optionally failing a named step.

use std::collections::BTreeMap;
use std::sync::Mutex;

use pac_common::{MacAddr, PacError, PacResult};

pub use pac_common::{NimApi, StaticNim};

/// MAC learning behaviour on an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LearningMode {
    Disable,
    Enable,
    CpuControlled,
}

/// VLAN-config notification kind used during port acquire/release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VlanCfgNotify {
    /// Strip user VLAN configuration from the port.
    Remove,
    /// Replay the saved configuration back onto the port.
    Revert,
}

/// Saved per-port VLAN configuration, replayed on release.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortVlanSnapshot {
    /// `(vlan, tagged)` memberships.
    pub members: Vec<(u16, bool)>,
    pub pvid: u16,
}

/// Platform Configuration surface programming the dataplane.
pub trait PacCfg: Send + Sync {
    /// Installs the static FDB entry admitting an authorized station.
    fn client_add(&self, ifname: &str, mac: MacAddr, vlan: u16) -> PacResult<()>;
    /// Removes the static FDB entry.
    fn client_remove(&self, ifname: &str, mac: MacAddr, vlan: u16) -> PacResult<()>;
    /// Installs the authenticating-phase drop rule.
    fn client_block(&self, ifname: &str, mac: MacAddr, vlan: u16) -> PacResult<()>;
    /// Reverses [`PacCfg::client_block`].
    fn client_unblock(&self, ifname: &str, mac: MacAddr, vlan: u16) -> PacResult<()>;
    fn port_pvid_set(&self, ifname: &str, pvid: u16) -> PacResult<()>;
    fn port_pvid_get(&self, ifname: &str) -> PacResult<u16>;
    fn vlan_member_add(&self, vlan: u16, ifname: &str, tagged: bool) -> PacResult<()>;
    fn vlan_member_remove(&self, vlan: u16, ifname: &str) -> PacResult<()>;
    /// Creates a VLAN assigned by RADIUS but absent from the switch.
    fn vlan_add(&self, vlan: u16) -> PacResult<()>;
    fn vlan_remove(&self, vlan: u16) -> PacResult<()>;
    fn intf_learning_mode_set(&self, ifname: &str, mode: LearningMode) -> PacResult<()>;
    fn intf_violation_policy_set(&self, ifname: &str, enabled: bool) -> PacResult<()>;
    /// Port acquire/release plumbing for the VLAN cache.
    fn vlan_cfg_notify(
        &self,
        kind: VlanCfgNotify,
        ifname: &str,
        snapshot: &PortVlanSnapshot,
    ) -> PacResult<()>;
    fn intf_acquire_set(&self, ifname: &str, acquired: bool) -> PacResult<()>;
}

/// One captured Platform Configuration call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CfgCall {
    ClientAdd(String, MacAddr, u16),
    ClientRemove(String, MacAddr, u16),
    ClientBlock(String, MacAddr, u16),
    ClientUnblock(String, MacAddr, u16),
    PortPvidSet(String, u16),
    VlanMemberAdd(u16, String, bool),
    VlanMemberRemove(u16, String),
    VlanAdd(u16),
    VlanRemove(u16),
    LearningModeSet(String, LearningMode),
    ViolationPolicySet(String, bool),
    VlanCfgNotify(VlanCfgNotify, String),
    AcquireSet(String, bool),
}

/// Recording test double for [`PacCfg`]. Captures every call; a
/// single named operation can be programmed to fail.
#[derive(Default)]
pub struct RecordingPacCfg {
    calls: Mutex<Vec<CfgCall>>,
    fail_op: Mutex<Option<&'static str>>,
    pvids: Mutex<BTreeMap<String, u16>>,
}

impl RecordingPacCfg {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the named operation (e.g. `"client_add"`) fail until
    /// cleared.
    pub fn fail_on(&self, op: &'static str) {
        *self.fail_op.lock().unwrap() = Some(op);
    }

    pub fn clear_failure(&self) {
        *self.fail_op.lock().unwrap() = None;
    }

    /// All calls captured so far, in order.
    pub fn calls(&self) -> Vec<CfgCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Drains the captured calls.
    pub fn take_calls(&self) -> Vec<CfgCall> {
        std::mem::take(&mut *self.calls.lock().unwrap())
    }

    fn record(&self, op: &'static str, call: CfgCall) -> PacResult<()> {
        if *self.fail_op.lock().unwrap() == Some(op) {
            return Err(PacError::failure(op));
        }
        self.calls.lock().unwrap().push(call);
        Ok(())
    }
}

impl PacCfg for RecordingPacCfg {
    fn client_add(&self, ifname: &str, mac: MacAddr, vlan: u16) -> PacResult<()> {
        self.record("client_add", CfgCall::ClientAdd(ifname.into(), mac, vlan))
    }

    fn client_remove(&self, ifname: &str, mac: MacAddr, vlan: u16) -> PacResult<()> {
        self.record(
            "client_remove",
            CfgCall::ClientRemove(ifname.into(), mac, vlan),
        )
    }

    fn client_block(&self, ifname: &str, mac: MacAddr, vlan: u16) -> PacResult<()> {
        self.record(
            "client_block",
            CfgCall::ClientBlock(ifname.into(), mac, vlan),
        )
    }

    fn client_unblock(&self, ifname: &str, mac: MacAddr, vlan: u16) -> PacResult<()> {
        self.record(
            "client_unblock",
            CfgCall::ClientUnblock(ifname.into(), mac, vlan),
        )
    }

    fn port_pvid_set(&self, ifname: &str, pvid: u16) -> PacResult<()> {
        self.pvids.lock().unwrap().insert(ifname.into(), pvid);
        self.record("port_pvid_set", CfgCall::PortPvidSet(ifname.into(), pvid))
    }

    fn port_pvid_get(&self, ifname: &str) -> PacResult<u16> {
        Ok(self.pvids.lock().unwrap().get(ifname).copied().unwrap_or(1))
    }

    fn vlan_member_add(&self, vlan: u16, ifname: &str, tagged: bool) -> PacResult<()> {
        self.record(
            "vlan_member_add",
            CfgCall::VlanMemberAdd(vlan, ifname.into(), tagged),
        )
    }

    fn vlan_member_remove(&self, vlan: u16, ifname: &str) -> PacResult<()> {
        self.record(
            "vlan_member_remove",
            CfgCall::VlanMemberRemove(vlan, ifname.into()),
        )
    }

    fn vlan_add(&self, vlan: u16) -> PacResult<()> {
        self.record("vlan_add", CfgCall::VlanAdd(vlan))
    }

    fn vlan_remove(&self, vlan: u16) -> PacResult<()> {
        self.record("vlan_remove", CfgCall::VlanRemove(vlan))
    }

    fn intf_learning_mode_set(&self, ifname: &str, mode: LearningMode) -> PacResult<()> {
        self.record(
            "intf_learning_mode_set",
            CfgCall::LearningModeSet(ifname.into(), mode),
        )
    }

    fn intf_violation_policy_set(&self, ifname: &str, enabled: bool) -> PacResult<()> {
        self.record(
            "intf_violation_policy_set",
            CfgCall::ViolationPolicySet(ifname.into(), enabled),
        )
    }

    fn vlan_cfg_notify(
        &self,
        kind: VlanCfgNotify,
        ifname: &str,
        _snapshot: &PortVlanSnapshot,
    ) -> PacResult<()> {
        self.record("vlan_cfg_notify", CfgCall::VlanCfgNotify(kind, ifname.into()))
    }

    fn intf_acquire_set(&self, ifname: &str, acquired: bool) -> PacResult<()> {
        self.record(
            "intf_acquire_set",
            CfgCall::AcquireSet(ifname.into(), acquired),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_cfg_captures_in_order() {
        let cfg = RecordingPacCfg::new();
        let mac = MacAddr([0, 0x11, 0x22, 0x33, 0x44, 0x55]);
        cfg.client_add("Ethernet1", mac, 10).unwrap();
        cfg.port_pvid_set("Ethernet1", 10).unwrap();
        assert_eq!(
            cfg.calls(),
            vec![
                CfgCall::ClientAdd("Ethernet1".into(), mac, 10),
                CfgCall::PortPvidSet("Ethernet1".into(), 10),
            ]
        );
    }

    #[test]
    fn test_programmed_failure() {
        let cfg = RecordingPacCfg::new();
        cfg.fail_on("vlan_add");
        assert!(cfg.vlan_add(99).is_err());
        assert!(cfg.calls().is_empty());
        cfg.clear_failure();
        assert!(cfg.vlan_add(99).is_ok());
    }

}
