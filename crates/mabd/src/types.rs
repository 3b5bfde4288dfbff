//! MAB client and per-port configuration types.

use pac_common::{HostMode, LPortKey, MacAddr, PortControlMode, TimerHandle};

/// How MAB presents the MAC-derived credential to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MabAuthType {
    /// EAP-Message with a constructed Response/Identity, MD5 rounds
    /// driven by server challenges.
    EapMd5,
    /// CHAP-Password + CHAP-Challenge computed locally.
    Chap,
    /// User-Password obfuscated with the shared secret.
    Pap,
}

/// Where a MAB client stands in its RADIUS transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MabClientState {
    /// No transaction outstanding.
    Idle,
    /// Access-Request sent; awaiting the server.
    Authenticating,
    /// Last transaction ended in Accept.
    Authenticated,
}

/// Per-port MAB configuration.
#[derive(Debug, Clone)]
pub struct MabPortCfg {
    pub enabled: bool,
    pub auth_type: MabAuthType,
    pub port_control_mode: PortControlMode,
    pub host_mode: HostMode,
}

impl Default for MabPortCfg {
    fn default() -> Self {
        Self {
            enabled: false,
            auth_type: MabAuthType::EapMd5,
            port_control_mode: PortControlMode::Invalid,
            host_mode: HostMode::Invalid,
        }
    }
}

/// Seconds MAB waits for the RADIUS server before reporting a
/// timeout.
pub const SERVER_AWHILE_PERIOD: u32 = 30;

/// One client MAB is authenticating or has authenticated.
#[derive(Debug, Clone)]
pub struct MabClient {
    pub key: LPortKey,
    pub mac: MacAddr,
    pub user_name: String,
    pub auth_type: MabAuthType,
    pub state: MabClientState,
    /// EAP / CHAP identifier for the current round.
    pub current_id: u8,
    /// Locally generated challenge for the CHAP variant.
    pub challenge: Vec<u8>,
    /// RADIUS State attribute echoed across challenge rounds.
    pub server_state: Vec<u8>,
    /// VLAN the server granted the current session, if any; a delete
    /// notification for it invalidates the session.
    pub assigned_vlan: Option<u16>,
    /// Armed server-wait timer.
    pub server_timer: Option<TimerHandle>,
}

impl MabClient {
    pub fn new(key: LPortKey, mac: MacAddr, auth_type: MabAuthType) -> Self {
        Self {
            key,
            mac,
            user_name: mac.to_bare_string(),
            auth_type,
            state: MabClientState::Idle,
            current_id: 0,
            challenge: Vec::new(),
            server_state: Vec::new(),
            assigned_vlan: None,
            server_timer: None,
        }
    }
}
