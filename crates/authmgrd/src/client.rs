//! Dataplane installation and removal for authorized clients.
//!
//! Installation is a fan-out of Platform Configuration calls; each
//! successful step records a bit in the client's `attr_create_mask`.
//! On partial failure the bits drive a cleanup dispatch that undoes
//! the completed steps in reverse order, keeping add and remove
//! symmetric.

use tracing::{debug, warn};

use pac_common::{LPortKey, MacAddr, PacResult, PortControlMode, PortStatus, VlanType};

use crate::control::{port_info, port_info_mut, AuthMgr};
use crate::types::{AttrBit, AttrCreateMask, ClientInfo};
use crate::vlan_cache::{VlanDbKind, VlanStatus};

/// True when a fresh result changes nothing the dataplane cares
/// about: the client is already Authorized on the same VLAN. Callers
/// read a true result as "no cleanup needed"; the sense is inverted
/// relative to what a cleanup predicate usually means.
pub(crate) fn cleanup_not_needed(client: &ClientInfo, new_vlan: u16) -> bool {
    client.vlan_id == new_vlan && client.logical_port_status == Some(PortStatus::Authorized)
}

struct HwAddPlan {
    mac: MacAddr,
    vlan: u16,
    block_vlan: u16,
    data_blocked: bool,
    mask: AttrCreateMask,
    first_authorized: bool,
    vlan_missing: bool,
    port_in_vlan: bool,
}

impl AuthMgr {
    /// Maintains `logical_port_status` and the port's count of
    /// authorized clients.
    pub(crate) fn client_status_set(&self, key: LPortKey, status: PortStatus) -> PacResult<()> {
        let port = key.phys_port();
        let mut st = self.wr()?;
        let Some(lp) = st.registry.get_mut(key) else {
            return Ok(());
        };
        let old = lp.client.logical_port_status;
        if old == Some(status) {
            return Ok(());
        }
        lp.client.logical_port_status = Some(status);
        let pi = port_info_mut(&mut st, port)?;
        match status {
            PortStatus::Authorized => pi.auth_count += 1,
            PortStatus::Unauthorized => {
                if old == Some(PortStatus::Authorized) {
                    pi.auth_count = pi.auth_count.saturating_sub(1);
                }
            }
        }
        Ok(())
    }

    /// Installs an authorized client: static FDB entry, removal of
    /// the authenticating-phase block, VLAN membership, and PVID when
    /// this is the port's first authorized client. Rolls back on
    /// partial failure and returns the original error.
    pub(crate) fn client_hw_info_add(&self, key: LPortKey) -> PacResult<()> {
        let port = key.phys_port();
        let plan = {
            let st = self.rd()?;
            let pi = port_info(&st, port)?;
            if pi.port_control_mode != PortControlMode::Auto {
                return Ok(());
            }
            let Some(lp) = st.registry.get(key) else {
                return Ok(());
            };
            let vlan = lp.client.vlan_id;
            HwAddPlan {
                mac: lp.client.mac,
                vlan,
                block_vlan: lp.client.block_vlan_id,
                data_blocked: lp.client.data_blocked,
                mask: lp.client.attr_create_mask,
                first_authorized: pi.auth_count == 0,
                vlan_missing: st.vlans.vlan_valid(vlan) == VlanStatus::NotExist,
                port_in_vlan: st.vlans.port_in_vlan(vlan, port),
            }
        };
        let ifname = self.nim.intf_name(port)?;
        let mut added = AttrCreateMask::default();

        // a RADIUS-assigned VLAN the switch has never seen is created
        // on demand
        if plan.vlan_missing {
            self.cfg.vlan_add(plan.vlan)?;
            let mut st = self.wr()?;
            st.vlans.dynamic_vlan_add(plan.vlan);
        }

        if !plan.mask.test(AttrBit::StaticFdb) {
            if let Err(e) = self.cfg.client_add(&ifname, plan.mac, plan.vlan) {
                self.hw_add_fail_cleanup(port, &ifname, &plan, added);
                return Err(e);
            }
            added.set(AttrBit::StaticFdb);
        }

        if plan.data_blocked && plan.block_vlan != 0 && plan.block_vlan != plan.vlan {
            if let Err(e) = self.cfg.client_unblock(&ifname, plan.mac, plan.block_vlan) {
                self.hw_add_fail_cleanup(port, &ifname, &plan, added);
                return Err(e);
            }
        }

        if !plan.port_in_vlan {
            if let Err(e) = self.cfg.vlan_member_add(plan.vlan, &ifname, false) {
                self.hw_add_fail_cleanup(port, &ifname, &plan, added);
                return Err(e);
            }
        }

        if plan.first_authorized {
            if let Err(e) = self.cfg.port_pvid_set(&ifname, plan.vlan) {
                self.hw_add_fail_cleanup(port, &ifname, &plan, added);
                return Err(e);
            }
            added.set(AttrBit::Pvid);
        }

        // commit
        let mut st = self.wr()?;
        if !plan.port_in_vlan {
            st.vlans
                .port_vlan_add(VlanDbKind::Operational, plan.vlan, port, false)?;
        }
        if plan.first_authorized {
            st.vlans
                .port_pvid_set(VlanDbKind::Operational, port, plan.vlan);
        }
        if let Some(lp) = st.registry.get_mut(key) {
            if added.test(AttrBit::StaticFdb) {
                lp.client.attr_create_mask.set(AttrBit::StaticFdb);
            }
            if added.test(AttrBit::Pvid) {
                lp.client.attr_create_mask.set(AttrBit::Pvid);
            }
            // a block on the same VLAN is superseded by the FDB entry
            if plan.data_blocked {
                lp.client.data_blocked = false;
                lp.client.attr_create_mask.clear(AttrBit::BlockFdb);
                lp.client.block_vlan_id = 0;
            }
        }
        Ok(())
    }

    /// Cleanup dispatch after a partial install, keyed by the bits
    /// recorded so far and run in reverse installation order.
    fn hw_add_fail_cleanup(&self, port: u32, ifname: &str, plan: &HwAddPlan, added: AttrCreateMask) {
        if added.test(AttrBit::Pvid) {
            let restore = self
                .rd()
                .map(|st| st.vlans.port_pvid(VlanDbKind::Configured, port))
                .unwrap_or(0);
            if let Err(e) = self.cfg.port_pvid_set(ifname, restore) {
                warn!(%ifname, error = %e, "pvid restore failed during rollback");
            }
        }
        if added.test(AttrBit::StaticFdb) {
            if let Err(e) = self.cfg.client_remove(ifname, plan.mac, plan.vlan) {
                warn!(%ifname, error = %e, "fdb removal failed during rollback");
            }
        }
    }

    /// Removes a client's dataplane state: the static FDB entry,
    /// then the VLAN membership and PVID once no other client on the
    /// port still references the VLAN.
    ///
    /// The client's `vlan_id`/`vlan_type` are zeroed before the
    /// participation check (so the entry does not count itself) and
    /// restored only if resetting the VLAN state fails.
    pub(crate) fn client_hw_info_cleanup(&self, key: LPortKey) -> PacResult<()> {
        let port = key.phys_port();
        {
            let st = self.rd()?;
            let pi = port_info(&st, port)?;
            if pi.port_control_mode != PortControlMode::Auto {
                return Ok(());
            }
        }
        let ifname = self.nim.intf_name(port)?;

        let (mac, vlan_id, vlan_type, had_fdb) = {
            let mut st = self.wr()?;
            let Some(lp) = st.registry.get_mut(key) else {
                return Ok(());
            };
            let vlan_id = lp.client.vlan_id;
            let vlan_type = lp.client.vlan_type;
            let had_fdb = lp.client.attr_create_mask.test(AttrBit::StaticFdb);
            // back up, then clear so the participation check below
            // does not see this client
            lp.client.vlan_id = 0;
            lp.client.vlan_type = Some(VlanType::Unassigned);
            (lp.client.mac, vlan_id, vlan_type, had_fdb)
        };

        if had_fdb {
            let rc = self.cfg.client_remove(&ifname, mac, vlan_id);
            {
                let mut st = self.wr()?;
                if let Some(lp) = st.registry.get_mut(key) {
                    lp.client.attr_create_mask.clear(AttrBit::StaticFdb);
                }
            }
            if let Err(e) = rc {
                warn!(?key, error = %e, "static fdb removal failed");
                return Err(e);
            }
        }

        if !self.vlan_port_deletion_validate(port, vlan_id)? {
            debug!(?key, vlan_id, "other clients still on vlan; membership kept");
            return Ok(());
        }

        if let Err(e) = self.client_vlan_info_reset(key, port, &ifname, vlan_id) {
            // put the backed-up info back
            let mut st = self.wr()?;
            if let Some(lp) = st.registry.get_mut(key) {
                lp.client.vlan_id = vlan_id;
                lp.client.vlan_type = vlan_type;
            }
            return Err(e);
        }
        Ok(())
    }

    /// True when the port's membership of `vlan` may be dropped: no
    /// other client on the port references it and the membership was
    /// not statically configured.
    fn vlan_port_deletion_validate(&self, port: u32, vlan: u16) -> PacResult<bool> {
        if vlan == 0 {
            return Ok(false);
        }
        let st = self.rd()?;
        let mut cursor = LPortKey::ITERATE;
        while let Some(lp) = st.registry.next_on_port(port, &mut cursor) {
            if lp.client.vlan_id == vlan {
                return Ok(false);
            }
        }
        // statically configured membership is never ours to remove
        Ok(!st.vlans.port_configured_member(vlan, port))
    }

    /// Drops the port's dynamic membership of `vlan`, restores the
    /// PVID if this client had set it, and deletes a dynamically
    /// created VLAN once nothing references it.
    fn client_vlan_info_reset(
        &self,
        key: LPortKey,
        port: u32,
        ifname: &str,
        vlan: u16,
    ) -> PacResult<()> {
        let (had_pvid, port_member) = {
            let st = self.rd()?;
            let had_pvid = st
                .registry
                .get(key)
                .map(|lp| lp.client.attr_create_mask.test(AttrBit::Pvid))
                .unwrap_or(false);
            (had_pvid, st.vlans.port_in_vlan(vlan, port))
        };

        if port_member {
            self.cfg.vlan_member_remove(vlan, ifname)?;
            let mut st = self.wr()?;
            st.vlans
                .port_vlan_delete(VlanDbKind::Operational, vlan, port)?;
        }

        if had_pvid {
            let restore = {
                let st = self.rd()?;
                st.vlans.port_pvid(VlanDbKind::Configured, port)
            };
            self.cfg.port_pvid_set(ifname, restore)?;
            let mut st = self.wr()?;
            st.vlans
                .port_pvid_set(VlanDbKind::Operational, port, restore);
            if let Some(lp) = st.registry.get_mut(key) {
                lp.client.attr_create_mask.clear(AttrBit::Pvid);
            }
        }

        let removable = {
            let st = self.rd()?;
            st.vlans.dynamic_vlan_removable(vlan)
        };
        if removable {
            self.cfg.vlan_remove(vlan)?;
            let mut st = self.wr()?;
            st.vlans.vlan_delete(VlanDbKind::Operational, vlan)?;
        }
        Ok(())
    }

    /// Removes a still-armed authenticating-phase block rule.
    pub(crate) fn client_block_cleanup(&self, key: LPortKey) -> PacResult<()> {
        let port = key.phys_port();
        let pending = {
            let st = self.rd()?;
            st.registry.get(key).and_then(|lp| {
                (lp.client.data_blocked && lp.client.block_vlan_id != 0)
                    .then(|| (lp.client.mac, lp.client.block_vlan_id))
            })
        };
        let Some((mac, block_vlan)) = pending else {
            return Ok(());
        };
        let ifname = self.nim.intf_name(port)?;
        self.cfg.client_unblock(&ifname, mac, block_vlan)?;
        let mut st = self.wr()?;
        if let Some(lp) = st.registry.get_mut(key) {
            lp.client.data_blocked = false;
            lp.client.block_vlan_id = 0;
            lp.client.attr_create_mask.clear(AttrBit::BlockFdb);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cleanup_not_needed_inversion() {
        let mut client = ClientInfo {
            vlan_id: 10,
            logical_port_status: Some(PortStatus::Authorized),
            ..Default::default()
        };
        // same VLAN and authorized: nothing to clean up
        assert!(cleanup_not_needed(&client, 10));
        // different VLAN: cleanup required
        assert!(!cleanup_not_needed(&client, 20));
        // unauthorized: cleanup path owns the decision
        client.logical_port_status = Some(PortStatus::Unauthorized);
        assert!(!cleanup_not_needed(&client, 10));
    }
}
