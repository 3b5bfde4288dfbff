//! Per-client and per-port data structures.

use pac_common::{
    HostMode, LPortKey, MacAddr, Method, PaeCapability, PortControlMode, PortStatus,
    TerminationAction, TimerHandle, VlanType,
};

/// Hard cap on clients per physical port; slot numbers stay below it.
pub const MAX_USERS_PER_PORT: u32 = 48;

/// Client-side FSM states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// Fresh entry; executed-method history cleared.
    Initialize,
    /// A method is driving an authentication exchange.
    Authenticating,
    /// The client is authorized and installed in the dataplane.
    Authenticated,
    /// Quiet period after a failure; attempts from this MAC ignored.
    Held,
    /// No authentication in progress.
    Unauthenticated,
}

/// Events consumed by the client state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmEvent {
    Initialize,
    StartAuthenticate,
    AuthSuccess,
    NotSuccessNoNextMethod,
    NotSuccessNextMethod,
    HeldTimerExpired,
    StopAuthenticate,
    HigherMethodAdded,
    Reauthenticate,
    AuthenticatedRxStart,
    AuthFail,
    AbortAndRestart,
}

/// Timer slots a logical port can arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerType {
    /// Quiet period while Held.
    QuietWhile,
    /// Periodic reauthentication while Authenticated.
    ReauthWhen,
    /// Bounds the wait for the current method to respond.
    MethodNoResp,
}

/// Dataplane installation steps recorded for rollback. Bit positions
/// index the cleanup dispatch table; cleanup runs highest bit first
/// so installation and removal stay symmetric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AttrBit {
    /// Static FDB entry installed.
    StaticFdb = 0,
    /// Authenticating-phase block rule installed.
    BlockFdb = 1,
    /// Port PVID set to the client's VLAN.
    Pvid = 2,
}

/// Bitmask over [`AttrBit`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttrCreateMask(pub u8);

impl AttrCreateMask {
    pub fn set(&mut self, bit: AttrBit) {
        self.0 |= 1 << (bit as u8);
    }

    pub fn clear(&mut self, bit: AttrBit) {
        self.0 &= !(1 << (bit as u8));
    }

    pub fn test(&self, bit: AttrBit) -> bool {
        self.0 & (1 << (bit as u8)) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

/// Protocol flags and FSM state for one client.
#[derive(Debug, Clone)]
pub struct ProtocolInfo {
    pub auth_state: AuthState,
    pub auth_success: bool,
    pub auth_fail: bool,
    pub auth_timeout: bool,
    pub unauthenticate: bool,
    pub authenticate: bool,
    pub reauth: bool,
    pub held_expired: bool,
    pub authenticated_rcvd_start: bool,
}

impl Default for ProtocolInfo {
    fn default() -> Self {
        Self {
            auth_state: AuthState::Initialize,
            auth_success: false,
            auth_fail: false,
            auth_timeout: false,
            unauthenticate: false,
            authenticate: false,
            reauth: false,
            held_expired: false,
            authenticated_rcvd_start: false,
        }
    }
}

/// Everything known about the station behind a logical port.
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub mac: MacAddr,
    pub current_method: Option<Method>,
    pub authenticated_method: Option<Method>,
    pub executed_methods: Vec<Method>,
    pub logical_port_status: Option<PortStatus>,
    pub vlan_id: u16,
    pub vlan_type: Option<VlanType>,
    pub block_vlan_id: u16,
    pub data_blocked: bool,
    pub user_name: String,
    pub session_timeout: u32,
    pub termination_action: Option<TerminationAction>,
    pub server_state: Vec<u8>,
    pub server_class: Vec<u8>,
    pub filter_id: Option<String>,
    pub reauth_count: u32,
    /// Tick-counter value when the last authentication concluded.
    pub last_auth_time: u64,
    /// Tick-counter value when the session was first authorized.
    pub session_start_time: u64,
    pub attr_create_mask: AttrCreateMask,
}

impl ClientInfo {
    pub fn is_authorized(&self) -> bool {
        self.logical_port_status == Some(PortStatus::Authorized)
    }
}

/// Armed timers for one logical port: one general slot plus the
/// independent method-no-response slot.
#[derive(Debug, Clone, Default)]
pub struct TimerSlots {
    pub general: Option<(TimerType, TimerHandle)>,
    pub method_no_resp: Option<TimerHandle>,
}

/// One authenticating or authenticated client.
#[derive(Debug, Clone)]
pub struct LogicalPort {
    pub key: LPortKey,
    pub protocol: ProtocolInfo,
    pub client: ClientInfo,
    pub timers: TimerSlots,
}

impl LogicalPort {
    pub fn new(key: LPortKey) -> Self {
        Self {
            key,
            protocol: ProtocolInfo::default(),
            client: ClientInfo::default(),
            timers: TimerSlots::default(),
        }
    }

    pub fn phys_port(&self) -> u32 {
        self.key.phys_port()
    }
}

/// Per-physical-port configuration and operational state.
#[derive(Debug, Clone)]
pub struct PortInfo {
    pub max_users: u32,
    pub num_users: u32,
    /// Count of clients currently Authorized.
    pub auth_count: u32,
    pub port_control_mode: PortControlMode,
    pub host_mode: HostMode,
    pub port_enabled: bool,
    pub pae_capabilities: PaeCapability,
    pub quiet_period: u32,
    pub reauth_period: u32,
    pub reauth_period_from_server: bool,
    pub reauth_enabled: bool,
    pub method_no_resp_period: u32,
    /// Configured method order; `enabled_methods` is this list
    /// filtered by each plugin's live enable status.
    pub method_list: Vec<Method>,
    pub priority_list: Vec<Method>,
    pub enabled_methods: Vec<Method>,
    pub enabled_priority: Vec<Method>,
    pub violation_policy: bool,
    pub unlearn_mac_policy: bool,
    /// PVID snapshot taken when the port was initialised.
    pub pvid: u16,
    pub auth_vlan: u16,
}

/// Default quiet period, seconds.
pub const DEFAULT_QUIET_PERIOD: u32 = 60;
/// Default reauthentication period, seconds.
pub const DEFAULT_REAUTH_PERIOD: u32 = 3600;
/// Default bound on a method's silence, seconds.
pub const DEFAULT_METHOD_NO_RESP_PERIOD: u32 = 30;

impl Default for PortInfo {
    fn default() -> Self {
        Self {
            max_users: MAX_USERS_PER_PORT,
            num_users: 0,
            auth_count: 0,
            port_control_mode: PortControlMode::Invalid,
            host_mode: HostMode::Invalid,
            port_enabled: false,
            pae_capabilities: PaeCapability::AuthCapable,
            quiet_period: DEFAULT_QUIET_PERIOD,
            reauth_period: DEFAULT_REAUTH_PERIOD,
            reauth_period_from_server: false,
            reauth_enabled: false,
            method_no_resp_period: DEFAULT_METHOD_NO_RESP_PERIOD,
            method_list: vec![Method::Dot1x, Method::Mab],
            priority_list: vec![Method::Dot1x, Method::Mab],
            enabled_methods: Vec::new(),
            enabled_priority: Vec::new(),
            violation_policy: false,
            unlearn_mac_policy: false,
            pvid: 0,
            auth_vlan: 0,
        }
    }
}

/// Per-port, per-method authentication counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MethodStats {
    pub attempts: u32,
    pub successes: u32,
    pub failures: u32,
    pub timeouts: u32,
}

/// Counters for every method on one port.
#[derive(Debug, Clone, Default)]
pub struct PortStats {
    pub dot1x: MethodStats,
    pub mab: MethodStats,
}

impl PortStats {
    pub fn for_method(&mut self, method: Method) -> &mut MethodStats {
        match method {
            Method::Dot1x => &mut self.dot1x,
            Method::Mab => &mut self.mab,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attr_mask() {
        let mut m = AttrCreateMask::default();
        assert!(m.is_empty());
        m.set(AttrBit::StaticFdb);
        m.set(AttrBit::Pvid);
        assert!(m.test(AttrBit::StaticFdb));
        assert!(!m.test(AttrBit::BlockFdb));
        m.clear(AttrBit::StaticFdb);
        assert!(!m.test(AttrBit::StaticFdb));
        assert!(m.test(AttrBit::Pvid));
    }

    #[test]
    fn test_port_defaults() {
        let p = PortInfo::default();
        assert_eq!(p.quiet_period, 60);
        assert_eq!(p.reauth_period, 3600);
        assert_eq!(p.port_control_mode, PortControlMode::Invalid);
        assert_eq!(p.host_mode, HostMode::Invalid);
        assert_eq!(p.method_list, vec![Method::Dot1x, Method::Mab]);
        assert!(p.enabled_methods.is_empty());
    }

    #[test]
    fn test_logical_port_new_is_blank() {
        let key = LPortKey::pack(3, 0, pac_common::LPortKind::Logical);
        let lp = LogicalPort::new(key);
        assert_eq!(lp.protocol.auth_state, AuthState::Initialize);
        assert!(lp.client.mac.is_zero());
        assert!(lp.client.attr_create_mask.is_empty());
        assert!(lp.timers.general.is_none());
    }
}
