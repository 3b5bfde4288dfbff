//! Mirror of external switch VLAN state.
//!
//! Two parallel databases: *operational* (what the switch is running,
//! including VLANs this daemon created dynamically) and *configured*
//! (what the user provisioned). Each tracks which VLANs exist and,
//! per port, membership, tagging and PVID. The cache also arbitrates
//! port acquisition: on acquire the user VLAN configuration of a port
//! is snapshotted and stripped through the Platform Configuration
//! collaborator; on release the snapshot is replayed.

use std::collections::BTreeMap;

use pac_common::{IntfMask, PacError, PacResult, VlanMask};

use crate::cfg::{PacCfg, PortVlanSnapshot, VlanCfgNotify};

/// Outcome of a VLAN existence check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VlanStatus {
    Present,
    NotExist,
    /// Outside [1, 4094].
    Invalid,
}

/// Which database an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VlanDbKind {
    Operational,
    Configured,
}

#[derive(Debug, Clone, Default)]
struct PortVlans {
    member: VlanMask,
    tagging: VlanMask,
    pvid: u16,
}

#[derive(Debug, Default)]
struct VlanDb {
    vlans: VlanMask,
    ports: BTreeMap<u32, PortVlans>,
}

fn vlan_in_range(vlan: u16) -> bool {
    (1..=4094).contains(&vlan)
}

/// Operational + configured VLAN membership mirror.
#[derive(Debug, Default)]
pub struct VlanCache {
    operational: VlanDb,
    configured: VlanDb,
    /// VLANs this daemon created on behalf of RADIUS assignments.
    dynamic: VlanMask,
    acquired: IntfMask,
    saved: BTreeMap<u32, PortVlanSnapshot>,
}

impl VlanCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn db(&self, kind: VlanDbKind) -> &VlanDb {
        match kind {
            VlanDbKind::Operational => &self.operational,
            VlanDbKind::Configured => &self.configured,
        }
    }

    fn db_mut(&mut self, kind: VlanDbKind) -> &mut VlanDb {
        match kind {
            VlanDbKind::Operational => &mut self.operational,
            VlanDbKind::Configured => &mut self.configured,
        }
    }

    /// Records a VLAN's existence.
    pub fn vlan_add(&mut self, kind: VlanDbKind, vlan: u16) -> PacResult<()> {
        if !vlan_in_range(vlan) {
            return Err(PacError::invalid(format!("VLAN {}", vlan)));
        }
        self.db_mut(kind).vlans.set(vlan as u32);
        Ok(())
    }

    /// Forgets a VLAN and every port's membership of it.
    pub fn vlan_delete(&mut self, kind: VlanDbKind, vlan: u16) -> PacResult<()> {
        if !vlan_in_range(vlan) {
            return Err(PacError::invalid(format!("VLAN {}", vlan)));
        }
        let db = self.db_mut(kind);
        db.vlans.clear(vlan as u32);
        for pv in db.ports.values_mut() {
            pv.member.clear(vlan as u32);
            pv.tagging.clear(vlan as u32);
        }
        if kind == VlanDbKind::Operational {
            self.dynamic.clear(vlan as u32);
        }
        Ok(())
    }

    /// Records port membership in a VLAN.
    pub fn port_vlan_add(
        &mut self,
        kind: VlanDbKind,
        vlan: u16,
        port: u32,
        tagged: bool,
    ) -> PacResult<()> {
        if !vlan_in_range(vlan) {
            return Err(PacError::invalid(format!("VLAN {}", vlan)));
        }
        let pv = self.db_mut(kind).ports.entry(port).or_default();
        pv.member.set(vlan as u32);
        if tagged {
            pv.tagging.set(vlan as u32);
        } else {
            pv.tagging.clear(vlan as u32);
        }
        Ok(())
    }

    /// Clears port membership of a VLAN.
    pub fn port_vlan_delete(&mut self, kind: VlanDbKind, vlan: u16, port: u32) -> PacResult<()> {
        if !vlan_in_range(vlan) {
            return Err(PacError::invalid(format!("VLAN {}", vlan)));
        }
        if let Some(pv) = self.db_mut(kind).ports.get_mut(&port) {
            pv.member.clear(vlan as u32);
            pv.tagging.clear(vlan as u32);
        }
        Ok(())
    }

    /// Records a port's PVID.
    pub fn port_pvid_set(&mut self, kind: VlanDbKind, port: u32, pvid: u16) {
        self.db_mut(kind).ports.entry(port).or_default().pvid = pvid;
    }

    pub fn port_pvid(&self, kind: VlanDbKind, port: u32) -> u16 {
        self.db(kind).ports.get(&port).map(|p| p.pvid).unwrap_or(0)
    }

    /// Existence check against the operational DB.
    pub fn vlan_valid(&self, vlan: u16) -> VlanStatus {
        if !vlan_in_range(vlan) {
            return VlanStatus::Invalid;
        }
        if self.operational.vlans.test(vlan as u32) {
            VlanStatus::Present
        } else {
            VlanStatus::NotExist
        }
    }

    /// Existence check against the configured DB.
    pub fn vlan_configured(&self, vlan: u16) -> bool {
        vlan_in_range(vlan) && self.configured.vlans.test(vlan as u32)
    }

    /// Whether a port is an untagged or tagged member in the
    /// operational DB.
    pub fn port_in_vlan(&self, vlan: u16, port: u32) -> bool {
        self.operational
            .ports
            .get(&port)
            .map(|pv| pv.member.test(vlan as u32))
            .unwrap_or(false)
    }

    /// Whether the port's membership of `vlan` was user-provisioned.
    pub fn port_configured_member(&self, vlan: u16, port: u32) -> bool {
        self.configured
            .ports
            .get(&port)
            .map(|pv| pv.member.test(vlan as u32))
            .unwrap_or(false)
    }

    /// Lowest configured VLAN the port belongs to untagged that also
    /// exists in the configured DB; the fallback when RADIUS assigns
    /// no VLAN.
    pub fn port_default_vlan(&self, port: u32) -> Option<u16> {
        let pv = self.configured.ports.get(&port)?;
        let mut vlan = pv.member.first_set();
        while vlan != 0 {
            if !pv.tagging.test(vlan) && self.configured.vlans.test(vlan) {
                return Some(vlan as u16);
            }
            vlan = pv.member.next_set(vlan);
        }
        None
    }

    /// Marks a VLAN as created dynamically for a RADIUS assignment.
    pub fn dynamic_vlan_add(&mut self, vlan: u16) {
        if vlan_in_range(vlan) {
            self.dynamic.set(vlan as u32);
            self.operational.vlans.set(vlan as u32);
        }
    }

    /// Whether the VLAN was created dynamically and no port remains
    /// an untagged operational member, i.e. it may be deleted.
    pub fn dynamic_vlan_removable(&self, vlan: u16) -> bool {
        if !self.dynamic.test(vlan as u32) {
            return false;
        }
        !self
            .operational
            .ports
            .values()
            .any(|pv| pv.member.test(vlan as u32) && !pv.tagging.test(vlan as u32))
    }

    /// Whether the port has been acquired by the authentication core.
    pub fn port_acquired(&self, port: u32) -> bool {
        self.acquired.test(port)
    }

    /// Strips user VLAN configuration from the port via the Platform
    /// Configuration collaborator and marks the port acquired.
    /// Idempotent for an already-acquired port.
    pub fn acquire_port(&mut self, cfg: &dyn PacCfg, ifname: &str, port: u32) -> PacResult<()> {
        if self.acquired.test(port) {
            return Ok(());
        }
        let snapshot = self.snapshot_port(port);
        cfg.vlan_cfg_notify(VlanCfgNotify::Remove, ifname, &snapshot)?;
        cfg.intf_acquire_set(ifname, true)?;
        self.saved.insert(port, snapshot);
        self.acquired.set(port);
        Ok(())
    }

    /// Replays the saved configuration back through the collaborator
    /// and marks the port released. Idempotent for a released port.
    pub fn release_port(&mut self, cfg: &dyn PacCfg, ifname: &str, port: u32) -> PacResult<()> {
        if !self.acquired.test(port) {
            return Ok(());
        }
        let snapshot = self.saved.remove(&port).unwrap_or_default();
        cfg.vlan_cfg_notify(VlanCfgNotify::Revert, ifname, &snapshot)?;
        cfg.intf_acquire_set(ifname, false)?;
        self.acquired.clear(port);
        Ok(())
    }

    fn snapshot_port(&self, port: u32) -> PortVlanSnapshot {
        let mut snapshot = PortVlanSnapshot::default();
        if let Some(pv) = self.configured.ports.get(&port) {
            let mut vlan = pv.member.first_set();
            while vlan != 0 {
                snapshot.members.push((vlan as u16, pv.tagging.test(vlan)));
                vlan = pv.member.next_set(vlan);
            }
            snapshot.pvid = pv.pvid;
        }
        snapshot
    }
}
