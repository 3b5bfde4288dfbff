//! End-to-end scenarios: the orchestrator and the MAB daemon wired
//! together over their buses, a recording Platform Configuration
//! double underneath and canned RADIUS responses behind the mock
//! transport. Tests drive both workers to quiescence after each
//! stimulus, so every assertion sees a settled system.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use authmgrd::cfg::{CfgCall, RecordingPacCfg};
use authmgrd::event::AuthmgrEvent;
use authmgrd::{AuthMgr, AuthState, TimerType};
use mabd::radius::test_support::{CannedResponse, MockRadius};
use mabd::{MabDaemon, MabEvent};
use pac_common::{
    BusReceiver, HostMode, MacAddr, Method, MethodEvent, MethodPlugin, MethodStatus, PacError,
    PacResult, PortControlMode, StaticNim,
};

/// 802.1X stands in as a plugin stub: it records start requests and
/// answers nothing on its own.
struct StubDot1x {
    enabled: AtomicBool,
    starts: Mutex<Vec<(u32, MacAddr)>>,
}

impl StubDot1x {
    fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            starts: Mutex::new(Vec::new()),
        }
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn starts(&self) -> Vec<(u32, MacAddr)> {
        self.starts.lock().unwrap().clone()
    }
}

impl MethodPlugin for StubDot1x {
    fn method(&self) -> Method {
        Method::Dot1x
    }

    fn event_notify(&self, port: u32, event: MethodEvent, mac: MacAddr) -> PacResult<()> {
        if event == MethodEvent::AuthStart {
            self.starts.lock().unwrap().push((port, mac));
        }
        Ok(())
    }

    fn enable_get(&self, _port: u32) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn port_ctrl(&self, _port: u32, _mode: PortControlMode) {}

    fn host_ctrl(&self, _port: u32, _host_mode: HostMode) {}
}

struct World {
    mgr: Arc<AuthMgr>,
    arx: BusReceiver<AuthmgrEvent>,
    mab: Arc<MabDaemon>,
    mrx: BusReceiver<MabEvent>,
    cfg: Arc<RecordingPacCfg>,
    radius: Arc<MockRadius>,
    dot1x: Arc<StubDot1x>,
    errors: Vec<PacError>,
}

fn world() -> World {
    let cfg = Arc::new(RecordingPacCfg::new());
    let nim = Arc::new(StaticNim::new(8));
    let (mgr, arx) = AuthMgr::new(cfg.clone(), nim.clone());

    let radius = Arc::new(MockRadius::new());
    let (mab, mrx) = MabDaemon::new(nim, radius.clone(), mgr.sink());
    radius.attach(mab.sender());

    let dot1x = Arc::new(StubDot1x::new());
    mgr.register_plugin(mab.plugin());
    mgr.register_plugin(dot1x.clone());

    World {
        mgr,
        arx,
        mab,
        mrx,
        cfg,
        radius,
        dot1x,
        errors: Vec::new(),
    }
}

impl World {
    /// Drains both workers until neither queue has messages.
    fn run_until_idle(&mut self) {
        loop {
            let mut progressed = false;
            while let Some(ev) = self.arx.try_next() {
                progressed = true;
                if let Err(e) = self.mgr.dispatch(ev) {
                    self.errors.push(e);
                }
            }
            while let Some(ev) = self.mrx.try_next() {
                progressed = true;
                if let Err(e) = self.mab.dispatch(ev) {
                    self.errors.push(e);
                }
            }
            if !progressed {
                break;
            }
        }
    }

    /// Common preamble: admin up, MAB enabled on `ports`.
    fn bring_up(&mut self, ports: &[u32]) {
        self.mgr.admin_mode_set(true).unwrap();
        self.run_until_idle();
        for &p in ports {
            self.mab.port_enable_set(p, true).unwrap();
        }
        self.mgr.method_enable_notify(Method::Mab).unwrap();
        self.run_until_idle();
    }

    /// Provisions a VLAN with the port as untagged member.
    fn vlan_with_member(&mut self, vlan: u16, port: u32) {
        self.mgr
            .vlan_event_issue(AuthmgrEvent::VlanAdd { vlan })
            .unwrap();
        self.mgr
            .vlan_event_issue(AuthmgrEvent::VlanPortAdd {
                vlan,
                port,
                tagged: false,
            })
            .unwrap();
        self.run_until_idle();
    }

    fn auto_port(&mut self, port: u32, host_mode: HostMode) {
        self.mgr
            .port_control_mode_set(port, PortControlMode::Auto)
            .unwrap();
        self.run_until_idle();
        self.mgr.host_mode_set(port, host_mode).unwrap();
        self.run_until_idle();
    }

    fn mac_seen(&mut self, port: u32, mac: MacAddr) {
        self.mgr.sink().client_seen(port, mac, Method::Mab, None);
        self.run_until_idle();
    }

    fn tick(&mut self, seconds: u32) {
        for _ in 0..seconds {
            self.mgr.dispatch(AuthmgrEvent::TimeTick).unwrap();
            self.run_until_idle();
        }
    }
}

fn mac(bytes: [u8; 6]) -> MacAddr {
    MacAddr(bytes)
}

#[test]
fn scenario_happy_path_mab_auth_default_vlan() {
    let mut w = world();
    w.bring_up(&[1]);
    w.vlan_with_member(10, 1);
    w.auto_port(1, HostMode::MultiAuth);

    let m = mac([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
    w.radius
        .push_response(CannedResponse::accept_call_check(None, None));
    w.mac_seen(1, m);

    let lp = w.mgr.client_snapshot(m).expect("client exists");
    assert_eq!(lp.protocol.auth_state, AuthState::Authenticated);
    assert_eq!(lp.client.vlan_id, 10);
    assert_eq!(lp.client.authenticated_method, Some(Method::Mab));
    assert_eq!(lp.client.user_name, "001122334455");

    let calls = w.cfg.calls();
    assert!(calls.contains(&CfgCall::ClientAdd("Ethernet1".into(), m, 10)));
    assert!(!calls
        .iter()
        .any(|c| matches!(c, CfgCall::VlanMemberAdd(..))));

    w.mgr.check_invariants().unwrap();
    assert!(w.errors.is_empty());
}

#[test]
fn scenario_radius_vlan_assignment_creates_vlan() {
    let mut w = world();
    w.bring_up(&[2]);
    w.auto_port(2, HostMode::SingleAuth);
    w.mgr.reauth_enabled_set(2, true).unwrap();
    w.mgr.reauth_period_set(2, 600, true).unwrap();
    w.run_until_idle();

    let m = mac([0xaa, 0xbb, 0xcc, 0x00, 0x00, 0x01]);
    w.radius
        .push_response(CannedResponse::accept_call_check(Some(99), Some(3600)));
    w.mac_seen(2, m);

    let lp = w.mgr.client_snapshot(m).expect("client exists");
    assert_eq!(lp.protocol.auth_state, AuthState::Authenticated);
    assert_eq!(lp.client.vlan_id, 99);
    assert_eq!(lp.client.session_timeout, 3600);

    let calls = w.cfg.calls();
    let pos = |needle: &CfgCall| calls.iter().position(|c| c == needle);
    let vlan_add = pos(&CfgCall::VlanAdd(99)).expect("vlan created");
    let member_add =
        pos(&CfgCall::VlanMemberAdd(99, "Ethernet2".into(), false)).expect("membership added");
    assert!(vlan_add < member_add);
    assert!(calls.contains(&CfgCall::PortPvidSet("Ethernet2".into(), 99)));
    assert!(calls.contains(&CfgCall::ClientAdd("Ethernet2".into(), m, 99)));

    // reauthentication timer runs on the server-supplied interval
    assert!(matches!(
        lp.timers.general,
        Some((TimerType::ReauthWhen, _))
    ));
    w.radius
        .push_response(CannedResponse::accept_call_check(Some(99), Some(3600)));
    w.tick(3599);
    assert_eq!(w.radius.requests().len(), 1);
    w.tick(1);
    assert_eq!(w.radius.requests().len(), 2);
    let lp = w.mgr.client_snapshot(m).unwrap();
    assert_eq!(lp.protocol.auth_state, AuthState::Authenticated);
    assert_eq!(lp.client.reauth_count, 1);

    w.mgr.check_invariants().unwrap();
    assert!(w.errors.is_empty());
}

#[test]
fn scenario_vlan_delete_drops_both_sides() {
    let mut w = world();
    w.bring_up(&[2]);
    w.auto_port(2, HostMode::SingleAuth);

    let m = mac([0xaa, 0xbb, 0xcc, 0x00, 0x00, 0x02]);
    w.radius
        .push_response(CannedResponse::accept_call_check(Some(99), None));
    w.mac_seen(2, m);
    assert_eq!(
        w.mgr.client_snapshot(m).unwrap().protocol.auth_state,
        AuthState::Authenticated
    );
    assert_eq!(w.mab.client_snapshot(m).unwrap().assigned_vlan, Some(99));

    // the switch loses VLAN 99; both daemons get the notification
    w.mgr
        .vlan_event_issue(AuthmgrEvent::VlanDelete { vlan: 99 })
        .unwrap();
    w.mab.vlan_delete_issue(99).unwrap();
    w.run_until_idle();

    assert!(w.mgr.client_snapshot(m).is_none());
    assert!(w.mab.client_snapshot(m).is_none());
    assert_eq!(w.mgr.port_snapshot(2).unwrap().num_users, 0);
    w.mgr.check_invariants().unwrap();
    assert!(w.errors.is_empty());
}

#[test]
fn scenario_reject_enters_quiet_period() {
    let mut w = world();
    w.bring_up(&[3]);
    w.vlan_with_member(10, 3);
    w.auto_port(3, HostMode::MultiAuth);
    w.mgr.quiet_period_set(3, 60).unwrap();
    w.run_until_idle();

    let m = mac([0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]);
    w.radius.push_response(CannedResponse::reject());
    w.mac_seen(3, m);

    let lp = w.mgr.client_snapshot(m).expect("client exists");
    assert_eq!(lp.protocol.auth_state, AuthState::Held);
    assert!(matches!(
        lp.timers.general,
        Some((TimerType::QuietWhile, _))
    ));
    assert_eq!(w.radius.requests().len(), 1);

    // a second sighting during the quiet period is ignored
    w.mac_seen(3, m);
    assert_eq!(w.radius.requests().len(), 1);
    let lp = w.mgr.client_snapshot(m).unwrap();
    assert_eq!(lp.protocol.auth_state, AuthState::Held);

    // quiet period expiry releases the entry for the next cycle
    w.tick(60);
    assert!(w.mgr.client_snapshot(m).is_none());

    w.mgr.check_invariants().unwrap();
    assert!(w.errors.is_empty());
}

#[test]
fn scenario_mac_roaming_tears_down_old_port() {
    let mut w = world();
    w.bring_up(&[4, 5]);
    w.vlan_with_member(20, 4);
    w.auto_port(4, HostMode::MultiAuth);
    w.auto_port(5, HostMode::MultiAuth);

    let m = mac([0x02, 0x00, 0x00, 0x00, 0x00, 0x0a]);
    w.radius
        .push_response(CannedResponse::accept_call_check(None, None));
    w.mac_seen(4, m);
    let lp = w.mgr.client_snapshot(m).unwrap();
    assert_eq!(lp.key.phys_port(), 4);
    assert_eq!(lp.protocol.auth_state, AuthState::Authenticated);

    // same MAC appears on another port; no response queued, so the
    // new session stays in authenticating
    w.mac_seen(5, m);
    let lp = w.mgr.client_snapshot(m).unwrap();
    assert_eq!(lp.key.phys_port(), 5);
    assert_eq!(lp.protocol.auth_state, AuthState::Authenticating);

    let calls = w.cfg.calls();
    assert!(calls.contains(&CfgCall::ClientRemove("Ethernet4".into(), m, 20)));
    assert_eq!(w.mgr.port_snapshot(4).unwrap().num_users, 0);
    assert_eq!(w.mgr.port_snapshot(5).unwrap().num_users, 1);

    w.mgr.check_invariants().unwrap();
    assert!(w.errors.is_empty());
}

#[test]
fn scenario_max_users_enforced() {
    let mut w = world();
    w.bring_up(&[6]);
    w.vlan_with_member(10, 6);
    w.auto_port(6, HostMode::MultiAuth);
    w.mgr.max_users_set(6, 2).unwrap();
    w.run_until_idle();

    let m1 = mac([0x02, 0, 0, 0, 0, 1]);
    let m2 = mac([0x02, 0, 0, 0, 0, 2]);
    let m3 = mac([0x02, 0, 0, 0, 0, 3]);
    w.mac_seen(6, m1);
    w.mac_seen(6, m2);
    assert!(w.mgr.client_snapshot(m1).is_some());
    assert!(w.mgr.client_snapshot(m2).is_some());

    w.mac_seen(6, m3);
    assert!(w.mgr.client_snapshot(m3).is_none());
    assert_eq!(w.mgr.port_snapshot(6).unwrap().num_users, 2);
    assert!(w
        .errors
        .iter()
        .any(|e| matches!(e, PacError::CapacityExceeded { port: 6 })));

    w.mgr.check_invariants().unwrap();
}

#[test]
fn scenario_higher_priority_method_preempts() {
    let mut w = world();
    w.bring_up(&[7]);
    w.vlan_with_member(30, 7);
    w.auto_port(7, HostMode::MultiAuth);

    // authenticated via MAB while 802.1X is operationally down
    let m = mac([0x02, 0x11, 0, 0, 0, 0x07]);
    w.radius
        .push_response(CannedResponse::accept_call_check(None, None));
    w.mac_seen(7, m);
    let lp = w.mgr.client_snapshot(m).unwrap();
    assert_eq!(lp.client.authenticated_method, Some(Method::Mab));

    // 802.1X comes up with higher priority and sees the same client
    w.dot1x.set_enabled(true);
    w.mgr.method_enable_notify(Method::Dot1x).unwrap();
    w.run_until_idle();

    w.mgr.sink().client_seen(7, m, Method::Dot1x, None);
    w.run_until_idle();

    let lp = w.mgr.client_snapshot(m).unwrap();
    assert_eq!(lp.protocol.auth_state, AuthState::Authenticating);
    assert_eq!(lp.client.current_method, Some(Method::Dot1x));
    assert_eq!(w.dot1x.starts(), vec![(7, m)]);

    // on success the client is authenticated by 802.1X
    w.mgr.sink().method_result(
        7,
        m,
        Method::Dot1x,
        MethodStatus::Success(pac_common::ClientAttrs {
            user_name: "station-7".into(),
            ..Default::default()
        }),
    );
    w.run_until_idle();

    let lp = w.mgr.client_snapshot(m).unwrap();
    assert_eq!(lp.protocol.auth_state, AuthState::Authenticated);
    assert_eq!(lp.client.authenticated_method, Some(Method::Dot1x));
    assert_eq!(lp.client.vlan_id, 30);

    w.mgr.check_invariants().unwrap();
    assert!(w.errors.is_empty());
}

#[test]
fn scenario_radius_timeout_holds_then_releases() {
    let mut w = world();
    w.bring_up(&[1]);
    w.vlan_with_member(10, 1);
    w.auto_port(1, HostMode::MultiAuth);
    w.mgr.quiet_period_set(1, 5).unwrap();
    w.run_until_idle();

    let m = mac([0x02, 0x22, 0, 0, 0, 1]);
    w.radius.push_response(CannedResponse::timeout());
    w.mac_seen(1, m);

    let lp = w.mgr.client_snapshot(m).unwrap();
    assert_eq!(lp.protocol.auth_state, AuthState::Held);

    w.tick(5);
    assert!(w.mgr.client_snapshot(m).is_none());
    w.mgr.check_invariants().unwrap();
}

#[test]
fn scenario_link_down_drops_clients() {
    let mut w = world();
    w.bring_up(&[2]);
    w.vlan_with_member(10, 2);
    w.auto_port(2, HostMode::MultiAuth);

    let m = mac([0x02, 0x33, 0, 0, 0, 1]);
    w.radius
        .push_response(CannedResponse::accept_call_check(None, None));
    w.mac_seen(2, m);
    assert_eq!(
        w.mgr.client_snapshot(m).unwrap().protocol.auth_state,
        AuthState::Authenticated
    );

    w.mgr
        .dispatch(AuthmgrEvent::IntfChange {
            port: 2,
            event: authmgrd::IntfEvent::Down,
        })
        .unwrap();
    w.run_until_idle();

    assert!(w.mgr.client_snapshot(m).is_none());
    let calls = w.cfg.calls();
    assert!(calls.contains(&CfgCall::ClientRemove("Ethernet2".into(), m, 10)));
    assert_eq!(w.mgr.port_snapshot(2).unwrap().auth_count, 0);
    w.mgr.check_invariants().unwrap();
}

#[test]
fn scenario_port_mode_round_trip_and_force_modes() {
    let mut w = world();
    w.bring_up(&[3]);
    w.auto_port(3, HostMode::MultiAuth);
    assert_eq!(
        w.mgr.port_snapshot(3).unwrap().port_control_mode,
        PortControlMode::Auto
    );
    assert_eq!(w.mgr.port_snapshot(3).unwrap().host_mode, HostMode::MultiAuth);

    // force-authorized: one synthetic client, authorized, host mode
    // meaningless
    w.mgr
        .port_control_mode_set(3, PortControlMode::ForceAuth)
        .unwrap();
    w.run_until_idle();
    let pi = w.mgr.port_snapshot(3).unwrap();
    assert_eq!(pi.port_control_mode, PortControlMode::ForceAuth);
    assert_eq!(pi.host_mode, HostMode::Invalid);
    assert_eq!(pi.num_users, 1);
    assert_eq!(pi.auth_count, 1);
    assert!(w.cfg.calls().contains(&CfgCall::PortPvidSet("Ethernet3".into(), 0)));

    // force-unauthorized: synthetic client, unauthorized
    w.mgr
        .port_control_mode_set(3, PortControlMode::ForceUnauth)
        .unwrap();
    w.run_until_idle();
    let pi = w.mgr.port_snapshot(3).unwrap();
    assert_eq!(pi.port_control_mode, PortControlMode::ForceUnauth);
    assert_eq!(pi.num_users, 1);
    assert_eq!(pi.auth_count, 0);

    w.mgr.check_invariants().unwrap();
    assert!(w.errors.is_empty());
}

#[test]
fn client_purge_removes_all_trace() {
    let mut w = world();
    w.bring_up(&[1]);
    w.vlan_with_member(10, 1);
    w.auto_port(1, HostMode::MultiAuth);

    let m = mac([0x02, 0x55, 0, 0, 0, 1]);
    w.radius
        .push_response(CannedResponse::accept_call_check(None, None));
    w.mac_seen(1, m);
    assert!(w.mgr.client_snapshot(m).is_some());

    w.mgr.client_purge(m).unwrap();
    w.run_until_idle();
    assert!(w.mgr.client_snapshot(m).is_none());
    assert_eq!(w.mgr.port_snapshot(1).unwrap().num_users, 0);
    assert!(matches!(
        w.mgr.client_purge(m),
        Err(PacError::NotExist { .. })
    ));
    w.mgr.check_invariants().unwrap();
}

#[test]
fn setter_validation_maps_to_errors() {
    let mut w = world();
    w.bring_up(&[4]);

    // host mode only under auto
    assert!(matches!(
        w.mgr.host_mode_set(4, HostMode::MultiAuth),
        Err(PacError::RequestDenied { .. })
    ));

    // max users only in multi-auth
    w.auto_port(4, HostMode::SingleAuth);
    assert!(matches!(
        w.mgr.max_users_set(4, 2),
        Err(PacError::RequestDenied { .. })
    ));
    assert!(matches!(
        w.mgr.max_users_set(4, 0),
        Err(PacError::InvalidParameter { .. })
    ));

    // unknown interface
    assert!(matches!(
        w.mgr.quiet_period_set(99, 10),
        Err(PacError::NotExist { .. })
    ));
}

#[test]
fn priority_precedence_contract() {
    let mut w = world();
    w.bring_up(&[5]);
    w.dot1x.set_enabled(true);
    w.mgr.method_enable_notify(Method::Dot1x).unwrap();
    w.run_until_idle();

    // dot1x outranks mab
    assert!(w.mgr.priority_precedence(5, Method::Mab, Method::Dot1x).is_ok());
    assert!(w.mgr.priority_precedence(5, Method::Dot1x, Method::Mab).is_err());
    // equal priority is not a precedence
    assert!(w.mgr.priority_precedence(5, Method::Mab, Method::Mab).is_err());
}

#[test]
fn method_disable_tears_down_its_clients_only() {
    let mut w = world();
    w.bring_up(&[6, 7]);
    w.vlan_with_member(10, 6);
    w.vlan_with_member(10, 7);
    w.auto_port(6, HostMode::MultiAuth);
    w.auto_port(7, HostMode::MultiAuth);
    w.dot1x.set_enabled(true);
    w.mgr.method_enable_notify(Method::Dot1x).unwrap();
    w.run_until_idle();

    // one client authenticated via 802.1X on port 6
    let m1 = mac([0x02, 0x44, 0, 0, 0, 1]);
    w.mgr.sink().client_seen(6, m1, Method::Dot1x, None);
    w.run_until_idle();
    w.mgr.sink().method_result(
        6,
        m1,
        Method::Dot1x,
        MethodStatus::Success(pac_common::ClientAttrs::default()),
    );
    w.run_until_idle();
    assert_eq!(
        w.mgr.client_snapshot(m1).unwrap().client.authenticated_method,
        Some(Method::Dot1x)
    );

    // one client authenticated via MAB on port 7; dot1x must answer
    // first on port 7, so fail it over to MAB
    let m2 = mac([0x02, 0x44, 0, 0, 0, 2]);
    w.radius
        .push_response(CannedResponse::accept_call_check(None, None));
    w.mac_seen(7, m2);
    w.mgr.sink().method_result(7, m2, Method::Dot1x, MethodStatus::Timeout);
    w.run_until_idle();
    assert_eq!(
        w.mgr.client_snapshot(m2).unwrap().client.authenticated_method,
        Some(Method::Mab)
    );

    // disabling 802.1X drops its client, leaves the MAB client alone
    w.dot1x.set_enabled(false);
    w.mgr.method_enable_notify(Method::Dot1x).unwrap();
    w.run_until_idle();

    assert!(w.mgr.client_snapshot(m1).is_none());
    assert!(w.mgr.client_snapshot(m2).is_some());
    w.mgr.check_invariants().unwrap();
}
