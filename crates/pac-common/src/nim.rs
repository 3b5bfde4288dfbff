//! Network Interface Manager contract.
//!
//! Both daemons consume interface numbering, names, link state and
//! addresses from NIM; its change callbacks arrive as events on each
//! daemon's bus. The static double below backs tests and stand-alone
//! runs.

use std::sync::Mutex;

use crate::error::{PacError, PacResult};
use crate::types::MacAddr;

/// Interface enumeration and attribute surface.
pub trait NimApi: Send + Sync {
    fn first_valid_intf(&self) -> Option<u32>;
    fn next_valid_intf(&self, intf: u32) -> Option<u32>;
    /// Interface alias name, e.g. `Ethernet4`.
    fn intf_name(&self, intf: u32) -> PacResult<String>;
    /// External ifindex for the interface.
    fn intf_ifindex(&self, intf: u32) -> PacResult<u32>;
    fn intf_link_up(&self, intf: u32) -> bool;
    fn intf_admin_up(&self, intf: u32) -> bool;
    /// Burned-in MAC of the interface (the NAS Called-Station-Id).
    fn intf_mac(&self, intf: u32) -> PacResult<MacAddr>;
}

/// Static interface table double: interfaces `1..=count`, alias
/// `Ethernet<n>`, ifindex `1000 + n`, all links up unless told
/// otherwise.
pub struct StaticNim {
    count: u32,
    switch_mac: MacAddr,
    down: Mutex<Vec<u32>>,
}

impl StaticNim {
    pub fn new(count: u32) -> Self {
        Self {
            count,
            switch_mac: MacAddr([0x00, 0xa0, 0xc8, 0x00, 0x00, 0x01]),
            down: Mutex::new(Vec::new()),
        }
    }

    /// Marks an interface link-down.
    pub fn set_link_down(&self, intf: u32) {
        self.down.lock().unwrap().push(intf);
    }

    pub fn set_link_up(&self, intf: u32) {
        self.down.lock().unwrap().retain(|&i| i != intf);
    }
}

impl NimApi for StaticNim {
    fn first_valid_intf(&self) -> Option<u32> {
        (self.count > 0).then_some(1)
    }

    fn next_valid_intf(&self, intf: u32) -> Option<u32> {
        (intf < self.count).then_some(intf + 1)
    }

    fn intf_name(&self, intf: u32) -> PacResult<String> {
        if intf >= 1 && intf <= self.count {
            Ok(format!("Ethernet{}", intf))
        } else {
            Err(PacError::not_exist(format!("interface {}", intf)))
        }
    }

    fn intf_ifindex(&self, intf: u32) -> PacResult<u32> {
        if intf >= 1 && intf <= self.count {
            Ok(1000 + intf)
        } else {
            Err(PacError::not_exist(format!("interface {}", intf)))
        }
    }

    fn intf_link_up(&self, intf: u32) -> bool {
        intf >= 1 && intf <= self.count && !self.down.lock().unwrap().contains(&intf)
    }

    fn intf_admin_up(&self, intf: u32) -> bool {
        intf >= 1 && intf <= self.count
    }

    fn intf_mac(&self, _intf: u32) -> PacResult<MacAddr> {
        Ok(self.switch_mac)
    }
}
