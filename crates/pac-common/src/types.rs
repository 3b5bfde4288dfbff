//! Shared identifiers and enums used across the PAC daemons.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Six-byte Ethernet MAC address.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    /// The all-zero address; never a valid client.
    pub const ZERO: MacAddr = MacAddr([0; 6]);

    /// Returns true for the all-zero address.
    pub fn is_zero(&self) -> bool {
        self.0 == [0; 6]
    }

    /// Colon-separated lowercase hex, `aa:bb:cc:dd:ee:ff`.
    pub fn to_colon_string(&self) -> String {
        let b = &self.0;
        format!(
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }

    /// Colon-separated uppercase hex; Called-Station-Id format.
    pub fn to_colon_string_upper(&self) -> String {
        let b = &self.0;
        format!(
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }

    /// Dash-separated uppercase hex; Calling-Station-Id format.
    pub fn to_dashed_string(&self) -> String {
        let b = &self.0;
        format!(
            "{:02X}-{:02X}-{:02X}-{:02X}-{:02X}-{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }

    /// Twelve uppercase hex digits with no separators; the MAB
    /// User-Name format.
    pub fn to_bare_string(&self) -> String {
        let b = &self.0;
        format!(
            "{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_colon_string())
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_colon_string())
    }
}

/// What a logical-port key refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum LPortKind {
    /// Dynamically allocated per-client entry.
    Logical = 1,
}

/// Packed logical-port identifier: physical port in the high 16
/// bits, client slot in the next 12, kind in the low 4. Plain-value
/// keys let iteration cursors and timer contexts outlive any
/// reference into the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LPortKey(pub u32);

impl LPortKey {
    /// Cursor sentinel that restarts per-port iteration.
    pub const ITERATE: u32 = u32::MAX;

    /// Packs `(phys_port, slot, kind)`.
    pub fn pack(phys_port: u32, slot: u32, kind: LPortKind) -> Self {
        LPortKey(((phys_port & 0xffff) << 16) | ((slot & 0x0fff) << 4) | (kind as u32 & 0xf))
    }

    /// Physical port number.
    pub fn phys_port(&self) -> u32 {
        (self.0 >> 16) & 0xffff
    }

    /// Client slot on the physical port.
    pub fn slot(&self) -> u32 {
        (self.0 >> 4) & 0x0fff
    }

    /// Key kind nibble.
    pub fn kind(&self) -> u32 {
        self.0 & 0xf
    }

    /// Returns true when the kind nibble marks a logical entry.
    pub fn is_logical(&self) -> bool {
        self.kind() == LPortKind::Logical as u32
    }
}

/// Authentication methods in arbitration order terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Method {
    /// IEEE 802.1X, driven by the external supplicant-facing plugin.
    Dot1x,
    /// MAC Authentication Bypass, driven by mabd.
    Mab,
}

impl Method {
    /// Display name used in logs and the status surface.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Dot1x => "802.1x",
            Method::Mab => "mab",
        }
    }
}

/// Per-port administrative control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortControlMode {
    /// Every client unauthorized regardless of authentication.
    ForceUnauth,
    /// Every client authorized without authentication.
    ForceAuth,
    /// Clients authenticate individually.
    Auto,
    /// Not configured.
    Invalid,
}

/// How many clients a port admits and how they authenticate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostMode {
    /// Exactly one authenticated client.
    SingleAuth,
    /// One client authenticates; all forward.
    MultiHost,
    /// Every client authenticates independently.
    MultiAuth,
    /// Meaningless outside Auto control mode.
    Invalid,
}

impl HostMode {
    /// Whether logical ports are allocated dynamically per client in
    /// this mode.
    pub fn allows_dynamic_alloc(&self) -> bool {
        matches!(
            self,
            HostMode::SingleAuth | HostMode::MultiHost | HostMode::MultiAuth
        )
    }
}

/// Port Access Entity capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaeCapability {
    /// Port does not run authentication.
    None,
    /// Port runs the authenticator machinery.
    AuthCapable,
}

/// Authorization status of a logical port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortStatus {
    /// Traffic admitted.
    Authorized,
    /// Traffic blocked or not yet admitted.
    Unauthorized,
}

/// Where an authorized client's VLAN came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VlanType {
    /// No VLAN assigned yet.
    Unassigned,
    /// Port default VLAN.
    Default,
    /// RADIUS-assigned via Tunnel-Private-Group-ID.
    Radius,
    /// Guest VLAN.
    Guest,
    /// Unauthenticated VLAN.
    Unauth,
    /// VLAN on which the client's traffic is blocked.
    Blocked,
}

/// Session termination behaviour from the RADIUS Termination-Action
/// attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminationAction {
    /// Tear the session down at expiry.
    Default,
    /// Reauthenticate at expiry.
    Reauthenticate,
}

/// Attributes accompanying a successful method result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientAttrs {
    /// Authenticated user name (the formatted MAC for MAB).
    pub user_name: String,
    /// RADIUS Session-Timeout, seconds.
    pub session_timeout: Option<u32>,
    /// RADIUS Termination-Action.
    pub termination_action: Option<TerminationAction>,
    /// Opaque RADIUS State attribute, echoed on subsequent rounds.
    pub server_state: Vec<u8>,
    /// Opaque RADIUS Class attribute.
    pub server_class: Vec<u8>,
    /// Assigned VLAN, if the server supplied the tunnel trio.
    pub vlan_id: Option<u16>,
    /// RADIUS Filter-Id attribute.
    pub filter_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_formats() {
        let mac = MacAddr([0x00, 0x11, 0x22, 0xaa, 0xbb, 0xcc]);
        assert_eq!(mac.to_colon_string(), "00:11:22:aa:bb:cc");
        assert_eq!(mac.to_colon_string_upper(), "00:11:22:AA:BB:CC");
        assert_eq!(mac.to_dashed_string(), "00-11-22-AA-BB-CC");
        assert_eq!(mac.to_bare_string(), "001122AABBCC");
        assert_eq!(mac.to_string(), "00:11:22:aa:bb:cc");
    }

    #[test]
    fn test_zero_mac() {
        assert!(MacAddr::ZERO.is_zero());
        assert!(!MacAddr([0, 0, 0, 0, 0, 1]).is_zero());
    }

    #[test]
    fn test_key_pack_unpack() {
        let key = LPortKey::pack(513, 47, LPortKind::Logical);
        assert_eq!(key.phys_port(), 513);
        assert_eq!(key.slot(), 47);
        assert!(key.is_logical());
    }

    #[test]
    fn test_key_field_truncation() {
        let key = LPortKey::pack(0x1_0001, 0x1001, LPortKind::Logical);
        assert_eq!(key.phys_port(), 1);
        assert_eq!(key.slot(), 1);
    }

    #[test]
    fn test_key_ordering_groups_by_port() {
        let a = LPortKey::pack(1, 5, LPortKind::Logical);
        let b = LPortKey::pack(2, 0, LPortKind::Logical);
        assert!(a < b);
    }

    #[test]
    fn test_host_mode_alloc_policy() {
        assert!(HostMode::MultiAuth.allows_dynamic_alloc());
        assert!(HostMode::SingleAuth.allows_dynamic_alloc());
        assert!(!HostMode::Invalid.allows_dynamic_alloc());
    }
}
