//! The Authentication Manager orchestrator.
//!
//! One worker drains the event bus and dispatches each message under
//! the state write lock. Every callout to a collaborator (Platform
//! Configuration, NIM, method plugins) happens with the lock
//! released; handlers retake it afterwards and tolerate the state
//! having changed. The administrative surface validates synchronously
//! and then issues events so all mutation serializes through the
//! worker.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, info, instrument, warn};

use pac_common::{
    AppTimer, AuthEventSink, BusReceiver, BusSender, HostMode, LPortKey, MacAddr, Method,
    MethodEvent, MethodPlugin, MethodStatus, PacError, PacRwLock, PacResult, PaeCapability,
    PortControlMode, PortStatus, Timeout,
};

use crate::cfg::{LearningMode, NimApi, PacCfg};
use crate::event::{AuthmgrEvent, IntfEvent};
use crate::mac_index::MacIndex;
use crate::registry::LogicalPortRegistry;
use crate::types::{
    AuthState, LogicalPort, PortInfo, PortStats, SmEvent, TimerType, MAX_USERS_PER_PORT,
};
use crate::vlan_cache::{VlanCache, VlanDbKind};

/// Milliseconds a handler waits for the state write lock before
/// surfacing `Busy`.
pub const WRITE_LOCK_TIMEOUT_MS: u64 = 5000;

/// Timer-wheel capacity: two slots per possible client.
const TIMER_POOL_SIZE: usize = 64 * 1024;

/// Mutable orchestrator state, guarded by the writer-preferring lock.
#[derive(Default)]
pub struct MgrState {
    pub admin_mode: bool,
    /// Monotonic seconds since start, advanced by time ticks.
    pub tick: u64,
    pub ports: BTreeMap<u32, PortInfo>,
    pub registry: LogicalPortRegistry,
    pub vlans: VlanCache,
    pub stats: BTreeMap<u32, PortStats>,
}

/// The Authentication Manager.
pub struct AuthMgr {
    pub(crate) state: PacRwLock<MgrState>,
    pub(crate) mac_index: MacIndex,
    pub(crate) cfg: Arc<dyn PacCfg>,
    pub(crate) nim: Arc<dyn NimApi>,
    plugins: RwLock<BTreeMap<Method, Arc<dyn MethodPlugin>>>,
    pub(crate) tx: BusSender<AuthmgrEvent>,
    pub(crate) timer: Arc<AppTimer>,
}

/// Event-bus shim handed to method plugins; results become events.
struct MgrSink {
    tx: BusSender<AuthmgrEvent>,
}

impl AuthEventSink for MgrSink {
    fn method_result(&self, port: u32, mac: MacAddr, method: Method, status: MethodStatus) {
        let ev = AuthmgrEvent::MethodResult {
            port,
            mac,
            method,
            status,
        };
        let class = ev.queue_class();
        let _ = self.tx.issue(class, ev);
    }

    fn client_seen(&self, port: u32, mac: MacAddr, method: Method, vlan: Option<u16>) {
        let ev = AuthmgrEvent::ClientSeen {
            port,
            mac,
            method,
            vlan,
        };
        let class = ev.queue_class();
        let _ = self.tx.issue(class, ev);
    }
}

impl AuthMgr {
    /// Creates the orchestrator and the receiving end of its bus.
    pub fn new(
        cfg: Arc<dyn PacCfg>,
        nim: Arc<dyn NimApi>,
    ) -> (Arc<AuthMgr>, BusReceiver<AuthmgrEvent>) {
        let (tx, rx) = pac_common::event_bus();
        let mgr = Arc::new(AuthMgr {
            state: PacRwLock::new(MgrState::default()),
            mac_index: MacIndex::new(),
            cfg,
            nim,
            plugins: RwLock::new(BTreeMap::new()),
            tx,
            timer: Arc::new(AppTimer::new(TIMER_POOL_SIZE)),
        });
        (mgr, rx)
    }

    /// Registers a method plugin. Later registrations for the same
    /// method replace the earlier one.
    pub fn register_plugin(&self, plugin: Arc<dyn MethodPlugin>) {
        let method = plugin.method();
        self.plugins
            .write()
            .expect("plugin table poisoned")
            .insert(method, plugin);
        let _ = self.issue(AuthmgrEvent::MethodEnableChange { method });
    }

    /// The sink method plugins deliver results through.
    pub fn sink(&self) -> Arc<dyn AuthEventSink> {
        Arc::new(MgrSink {
            tx: self.tx.clone(),
        })
    }

    pub(crate) fn plugin(&self, method: Method) -> Option<Arc<dyn MethodPlugin>> {
        self.plugins
            .read()
            .expect("plugin table poisoned")
            .get(&method)
            .cloned()
    }

    pub(crate) fn wr(&self) -> PacResult<pac_common::rwlock::PacWriteGuard<'_, MgrState>> {
        self.state.write(Timeout::Millis(WRITE_LOCK_TIMEOUT_MS))
    }

    pub(crate) fn rd(&self) -> PacResult<pac_common::rwlock::PacReadGuard<'_, MgrState>> {
        self.state.read(Timeout::Millis(WRITE_LOCK_TIMEOUT_MS))
    }

    fn issue(&self, ev: AuthmgrEvent) -> PacResult<()> {
        let class = ev.queue_class();
        self.tx.issue(class, ev)
    }

    /// Posts the one-second tick; called from the tick task.
    pub fn time_tick_issue(&self) -> PacResult<()> {
        self.issue(AuthmgrEvent::TimeTick)
    }

    /// Posts an interface change notification; the NIM change
    /// callback lands here.
    pub fn intf_change_issue(&self, port: u32, event: IntfEvent) -> PacResult<()> {
        self.issue(AuthmgrEvent::IntfChange { port, event })
    }

    /// Posts an interface startup-phase notification.
    pub fn intf_startup_issue(&self, port: u32, phase: crate::event::StartupPhase) -> PacResult<()> {
        self.issue(AuthmgrEvent::IntfStartup { port, phase })
    }

    /// Posts a VLAN collaborator notification onto the VLAN queue.
    pub fn vlan_event_issue(&self, ev: AuthmgrEvent) -> PacResult<()> {
        self.issue(ev)
    }

    /// A method plugin's operational enable status changed; the
    /// enabled arrays are rebuilt on the worker.
    pub fn method_enable_notify(&self, method: Method) -> PacResult<()> {
        self.issue(AuthmgrEvent::MethodEnableChange { method })
    }

    // ------------------------------------------------------------------
    // Administrative surface. Each setter validates synchronously and
    // issues an event; the worker applies it.
    // ------------------------------------------------------------------

    pub fn admin_mode_set(&self, enable: bool) -> PacResult<()> {
        self.issue(AuthmgrEvent::AdminModeSet { enable })
    }

    pub fn port_control_mode_set(&self, port: u32, mode: PortControlMode) -> PacResult<()> {
        if mode == PortControlMode::Invalid {
            return Err(PacError::invalid("port control mode"));
        }
        self.port_exists(port)?;
        self.issue(AuthmgrEvent::PortControlModeSet { port, mode })
    }

    pub fn host_mode_set(&self, port: u32, mode: HostMode) -> PacResult<()> {
        if mode == HostMode::Invalid {
            return Err(PacError::invalid("host mode"));
        }
        {
            let st = self.rd()?;
            let pi = port_info(&st, port)?;
            if pi.port_control_mode != PortControlMode::Auto {
                return Err(PacError::denied("host mode valid only under auto"));
            }
        }
        self.issue(AuthmgrEvent::HostModeSet { port, mode })
    }

    pub fn port_initialize_set(&self, port: u32, initialize: bool) -> PacResult<()> {
        self.port_exists(port)?;
        if !initialize {
            return Ok(());
        }
        self.issue(AuthmgrEvent::PortInitialize { port })
    }

    pub fn port_reauthenticate_set(&self, port: u32, reauth: bool) -> PacResult<()> {
        self.port_exists(port)?;
        if !reauth {
            return Ok(());
        }
        self.issue(AuthmgrEvent::PortReauthenticate { port })
    }

    pub fn quiet_period_set(&self, port: u32, secs: u32) -> PacResult<()> {
        self.port_exists(port)?;
        self.issue(AuthmgrEvent::QuietPeriodSet { port, secs })
    }

    pub fn reauth_period_set(&self, port: u32, secs: u32, from_server: bool) -> PacResult<()> {
        self.port_exists(port)?;
        self.issue(AuthmgrEvent::ReauthPeriodSet {
            port,
            secs,
            from_server,
        })
    }

    pub fn reauth_enabled_set(&self, port: u32, enabled: bool) -> PacResult<()> {
        self.port_exists(port)?;
        self.issue(AuthmgrEvent::ReauthEnabledSet { port, enabled })
    }

    pub fn max_users_set(&self, port: u32, count: u32) -> PacResult<()> {
        if count == 0 || count > MAX_USERS_PER_PORT {
            return Err(PacError::invalid(format!("max users {}", count)));
        }
        {
            let st = self.rd()?;
            let pi = port_info(&st, port)?;
            if pi.host_mode != HostMode::MultiAuth {
                return Err(PacError::denied("max users valid only in multi-auth"));
            }
        }
        self.issue(AuthmgrEvent::MaxUsersSet { port, count })
    }

    pub fn pae_capabilities_set(&self, port: u32, cap: PaeCapability) -> PacResult<()> {
        self.port_exists(port)?;
        self.issue(AuthmgrEvent::PaeCapabilitiesSet { port, cap })
    }

    pub fn violation_mode_set(&self, port: u32, enabled: bool) -> PacResult<()> {
        self.port_exists(port)?;
        self.issue(AuthmgrEvent::ViolationModeSet { port, enabled })
    }

    /// Requests teardown of one client, e.g. when the dataplane ages
    /// the address out.
    pub fn client_purge(&self, mac: MacAddr) -> PacResult<()> {
        let key = self
            .mac_index
            .find(mac)
            .ok_or_else(|| PacError::not_exist(format!("client {}", mac)))?;
        self.issue(AuthmgrEvent::ClientCleanup { key })
    }

    /// Replaces the configured method order and recomputes the
    /// operationally enabled array.
    pub fn method_order_set(&self, port: u32, list: Vec<Method>) -> PacResult<()> {
        self.port_exists(port)?;
        {
            let mut st = self.wr()?;
            port_info_mut(&mut st, port)?.method_list = list;
        }
        self.issue(AuthmgrEvent::MethodEnableChange {
            method: Method::Dot1x,
        })
    }

    /// Replaces the configured method priority and recomputes the
    /// enabled priority array.
    pub fn method_priority_set(&self, port: u32, list: Vec<Method>) -> PacResult<()> {
        self.port_exists(port)?;
        {
            let mut st = self.wr()?;
            port_info_mut(&mut st, port)?.priority_list = list;
        }
        self.issue(AuthmgrEvent::MethodEnableChange {
            method: Method::Dot1x,
        })
    }

    fn port_exists(&self, port: u32) -> PacResult<()> {
        let st = self.rd()?;
        port_info(&st, port).map(|_| ())
    }

    // ------------------------------------------------------------------
    // Read-only query surface (status servers, tests).
    // ------------------------------------------------------------------

    pub fn port_snapshot(&self, port: u32) -> Option<PortInfo> {
        self.rd().ok()?.ports.get(&port).cloned()
    }

    pub fn client_snapshot(&self, mac: MacAddr) -> Option<LogicalPort> {
        let key = self.mac_index.find(mac)?;
        self.rd().ok()?.registry.get(key).cloned()
    }

    pub fn clients_on_port(&self, port: u32) -> Vec<LogicalPort> {
        let Ok(st) = self.rd() else {
            return Vec::new();
        };
        let mut out = Vec::new();
        let mut cursor = LPortKey::ITERATE;
        while let Some(lp) = st.registry.next_on_port(port, &mut cursor) {
            out.push(lp.clone());
        }
        out
    }

    pub fn port_stats(&self, port: u32) -> Option<PortStats> {
        self.rd().ok()?.stats.get(&port).cloned()
    }

    /// Verifies the structural invariants; test hook.
    pub fn check_invariants(&self) -> PacResult<()> {
        let st = self.rd()?;
        for (port, pi) in st.ports.iter() {
            let count = st.registry.count_on_port(*port);
            if pi.num_users != count {
                return Err(PacError::failure(format!(
                    "port {}: num_users {} != registry {}",
                    port, pi.num_users, count
                )));
            }
            let mut authorized = 0;
            let mut cursor = LPortKey::ITERATE;
            while let Some(lp) = st.registry.next_on_port(*port, &mut cursor) {
                if lp.client.is_authorized() {
                    authorized += 1;
                    if pi.port_control_mode == PortControlMode::Auto {
                        let vlan = lp.client.vlan_id;
                        if !(1..=4094).contains(&vlan) {
                            return Err(PacError::failure(format!(
                                "authorized client {} with vlan {}",
                                lp.client.mac, vlan
                            )));
                        }
                    }
                }
                if !lp.client.mac.is_zero()
                    && self.mac_index.find(lp.client.mac) != Some(lp.key)
                {
                    return Err(PacError::failure(format!(
                        "mac {} not uniquely indexed",
                        lp.client.mac
                    )));
                }
            }
            if pi.auth_count != authorized {
                return Err(PacError::failure(format!(
                    "port {}: auth_count {} != authorized {}",
                    port, pi.auth_count, authorized
                )));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Worker dispatch.
    // ------------------------------------------------------------------

    /// Applies one event. Called by the worker for every message it
    /// drains from the bus.
    pub fn dispatch(&self, ev: AuthmgrEvent) -> PacResult<()> {
        debug!(?ev, "dispatch");
        match ev {
            AuthmgrEvent::AdminModeSet { enable } => self.handle_admin_mode(enable),
            AuthmgrEvent::MethodEnableChange { .. } => self.handle_method_enable_change(),
            AuthmgrEvent::PortControlModeSet { port, mode } => {
                self.handle_port_control_mode_set(port, mode)
            }
            AuthmgrEvent::HostModeSet { port, mode } => self.handle_host_mode_set(port, mode),
            AuthmgrEvent::PortInitialize { port } => self.handle_port_initialize(port),
            AuthmgrEvent::PortReauthenticate { port } => self.handle_port_reauthenticate(port),
            AuthmgrEvent::QuietPeriodSet { port, secs } => {
                self.handle_quiet_period_set(port, secs)
            }
            AuthmgrEvent::ReauthPeriodSet {
                port,
                secs,
                from_server,
            } => self.handle_reauth_period_set(port, secs, from_server),
            AuthmgrEvent::ReauthEnabledSet { port, enabled } => {
                self.handle_reauth_enabled_set(port, enabled)
            }
            AuthmgrEvent::MaxUsersSet { port, count } => self.handle_max_users_set(port, count),
            AuthmgrEvent::PaeCapabilitiesSet { port, cap } => {
                self.handle_pae_capabilities_set(port, cap)
            }
            AuthmgrEvent::ViolationModeSet { port, enabled } => {
                self.handle_violation_mode_set(port, enabled)
            }
            AuthmgrEvent::MethodResult {
                port,
                mac,
                method,
                status,
            } => self.handle_method_result(port, mac, method, status),
            AuthmgrEvent::ClientSeen {
                port,
                mac,
                method,
                vlan,
            } => self.handle_client_seen(port, mac, method, vlan),
            AuthmgrEvent::ClientTimeout { key, timer } => self.handle_client_timeout(key, timer),
            AuthmgrEvent::ClientCleanup { key } => self.client_cleanup(key),
            AuthmgrEvent::TimeTick => self.handle_time_tick(),
            AuthmgrEvent::IntfChange { port, event } => self.handle_intf_change(port, event),
            AuthmgrEvent::IntfStartup { port, phase } => self.handle_intf_startup(port, phase),
            AuthmgrEvent::VlanAdd { vlan } => self.handle_vlan_add(vlan),
            AuthmgrEvent::VlanDelete { vlan } => self.handle_vlan_delete(vlan),
            AuthmgrEvent::VlanPortAdd { vlan, port, tagged } => {
                self.handle_vlan_port_add(vlan, port, tagged)
            }
            AuthmgrEvent::VlanPortDelete { vlan, port } => {
                self.handle_vlan_port_delete(vlan, port)
            }
            AuthmgrEvent::VlanPvidChange { port, pvid } => {
                self.handle_vlan_pvid_change(port, pvid)
            }
        }
    }

    // ------------------------------------------------------------------
    // Admin-mode and per-port configuration handlers.
    // ------------------------------------------------------------------

    #[instrument(skip(self))]
    fn handle_admin_mode(&self, enable: bool) -> PacResult<()> {
        if enable {
            // enumerate interfaces outside the lock
            let mut intfs = Vec::new();
            let mut cur = self.nim.first_valid_intf();
            while let Some(i) = cur {
                intfs.push(i);
                cur = self.nim.next_valid_intf(i);
            }
            let states: Vec<(u32, bool)> = intfs
                .iter()
                .map(|&i| (i, self.nim.intf_link_up(i) && self.nim.intf_admin_up(i)))
                .collect();
            {
                let mut guard = self.wr()?;
                let st = &mut *guard;
                st.admin_mode = true;
                for (i, up) in &states {
                    st.ports.entry(*i).or_default().port_enabled = *up;
                    st.stats.entry(*i).or_default();
                }
            }
            info!(ports = states.len(), "authentication manager enabled");
            self.enabled_lists_rebuild_all()
        } else {
            let ports: Vec<u32> = {
                let st = self.rd()?;
                st.ports.keys().copied().collect()
            };
            for port in ports {
                self.port_clients_purge(port)?;
            }
            self.timer.clear();
            let mut st = self.wr()?;
            st.admin_mode = false;
            info!("authentication manager disabled");
            Ok(())
        }
    }

    #[instrument(skip(self))]
    fn handle_port_control_mode_set(&self, port: u32, mode: PortControlMode) -> PacResult<()> {
        {
            let st = self.rd()?;
            let pi = port_info(&st, port)?;
            if pi.port_control_mode == mode {
                return Ok(());
            }
        }
        let ifname = self.nim.intf_name(port)?;
        self.port_clients_purge(port)?;
        {
            let mut st = self.wr()?;
            let pi = port_info_mut(&mut st, port)?;
            pi.port_control_mode = mode;
        }

        match mode {
            PortControlMode::Auto => self.port_control_auto_action(port, &ifname),
            PortControlMode::ForceAuth => self.port_control_force_auth_action(port, &ifname),
            PortControlMode::ForceUnauth => self.port_control_force_unauth_action(port, &ifname),
            PortControlMode::Invalid => Ok(()),
        }?;

        for plugin in self.plugins_snapshot() {
            plugin.port_ctrl(port, mode);
        }
        Ok(())
    }

    fn port_control_auto_action(&self, port: u32, ifname: &str) -> PacResult<()> {
        {
            let mut st = self.wr()?;
            let pi = port_info_mut(&mut st, port)?;
            if pi.host_mode == HostMode::Invalid {
                pi.host_mode = HostMode::MultiHost;
            }
        }
        {
            let mut st = self.wr()?;
            let MgrState { vlans, .. } = &mut *st;
            vlans.acquire_port(self.cfg.as_ref(), ifname, port)?;
        }
        self.cfg
            .intf_learning_mode_set(ifname, LearningMode::CpuControlled)?;
        self.host_mode_policy_apply(port, ifname)
    }

    fn port_control_force_auth_action(&self, port: u32, ifname: &str) -> PacResult<()> {
        {
            let mut st = self.wr()?;
            let MgrState { vlans, .. } = &mut *st;
            vlans.release_port(self.cfg.as_ref(), ifname, port)?;
        }
        self.cfg.port_pvid_set(ifname, 0)?;
        self.cfg
            .intf_learning_mode_set(ifname, LearningMode::Enable)?;
        let mut st = self.wr()?;
        let key = {
            let MgrState { registry, .. } = &mut *st;
            registry.alloc_synthetic(port)?.key
        };
        {
            let lp = st.registry.get_mut(key).expect("fresh synthetic entry");
            lp.client.logical_port_status = Some(PortStatus::Authorized);
            lp.protocol.auth_state = AuthState::Authenticated;
        }
        let pi = port_info_mut(&mut st, port)?;
        pi.host_mode = HostMode::Invalid;
        pi.num_users += 1;
        pi.auth_count += 1;
        info!(port, "port force-authorized");
        Ok(())
    }

    fn port_control_force_unauth_action(&self, port: u32, ifname: &str) -> PacResult<()> {
        {
            let mut st = self.wr()?;
            let MgrState { vlans, .. } = &mut *st;
            vlans.acquire_port(self.cfg.as_ref(), ifname, port)?;
        }
        self.cfg
            .intf_learning_mode_set(ifname, LearningMode::Disable)?;
        let mut st = self.wr()?;
        let key = {
            let MgrState { registry, .. } = &mut *st;
            registry.alloc_synthetic(port)?.key
        };
        {
            let lp = st.registry.get_mut(key).expect("fresh synthetic entry");
            lp.client.logical_port_status = Some(PortStatus::Unauthorized);
            lp.protocol.auth_state = AuthState::Unauthenticated;
        }
        let pi = port_info_mut(&mut st, port)?;
        pi.host_mode = HostMode::Invalid;
        pi.num_users += 1;
        info!(port, "port force-unauthorized");
        Ok(())
    }

    #[instrument(skip(self))]
    fn handle_host_mode_set(&self, port: u32, mode: HostMode) -> PacResult<()> {
        {
            let st = self.rd()?;
            let pi = port_info(&st, port)?;
            if pi.port_control_mode != PortControlMode::Auto {
                return Err(PacError::denied("host mode valid only under auto"));
            }
            if pi.host_mode == mode {
                return Ok(());
            }
        }
        let ifname = self.nim.intf_name(port)?;
        self.port_clients_purge(port)?;
        {
            let mut st = self.wr()?;
            port_info_mut(&mut st, port)?.host_mode = mode;
        }
        self.enabled_lists_rebuild(port)?;
        self.host_mode_policy_apply(port, &ifname)?;
        for plugin in self.plugins_snapshot() {
            plugin.host_ctrl(port, mode);
        }
        Ok(())
    }

    fn host_mode_policy_apply(&self, port: u32, ifname: &str) -> PacResult<()> {
        let violation = {
            let st = self.rd()?;
            port_info(&st, port)?.violation_policy
        };
        self.cfg
            .intf_learning_mode_set(ifname, LearningMode::CpuControlled)?;
        self.cfg.intf_violation_policy_set(ifname, violation)?;
        Ok(())
    }

    fn handle_port_initialize(&self, port: u32) -> PacResult<()> {
        self.port_clients_purge(port)?;
        let ifname = self.nim.intf_name(port)?;
        let mode = {
            let st = self.rd()?;
            port_info(&st, port)?.port_control_mode
        };
        if mode == PortControlMode::Auto {
            self.host_mode_policy_apply(port, &ifname)?;
        }
        self.enabled_lists_rebuild(port)
    }

    fn handle_port_reauthenticate(&self, port: u32) -> PacResult<()> {
        let keys = {
            let st = self.rd()?;
            st.registry.keys_on_port(port)
        };
        for key in keys {
            let authorized = {
                let mut st = self.wr()?;
                match st.registry.get_mut(key) {
                    Some(lp) if lp.client.is_authorized() => {
                        lp.protocol.reauth = true;
                        true
                    }
                    _ => false,
                }
            };
            if authorized {
                self.generate_events(key)?;
            }
        }
        Ok(())
    }

    fn handle_quiet_period_set(&self, port: u32, secs: u32) -> PacResult<()> {
        let keys = {
            let mut st = self.wr()?;
            port_info_mut(&mut st, port)?.quiet_period = secs;
            st.registry.keys_on_port(port)
        };
        // restart running quiet timers with the new period
        for key in keys {
            let held = {
                let st = self.rd()?;
                st.registry
                    .get(key)
                    .map(|lp| lp.protocol.auth_state == AuthState::Held)
                    .unwrap_or(false)
            };
            if held {
                self.timer_destroy(key, TimerType::QuietWhile)?;
                self.timer_start(key, TimerType::QuietWhile)?;
            }
        }
        Ok(())
    }

    fn handle_reauth_period_set(&self, port: u32, secs: u32, from_server: bool) -> PacResult<()> {
        let keys = {
            let mut st = self.wr()?;
            let pi = port_info_mut(&mut st, port)?;
            pi.reauth_period = secs;
            pi.reauth_period_from_server = from_server;
            let enabled = pi.reauth_enabled;
            if enabled {
                st.registry.keys_on_port(port)
            } else {
                Vec::new()
            }
        };
        for key in keys {
            let authorized = {
                let st = self.rd()?;
                st.registry
                    .get(key)
                    .map(|lp| lp.client.is_authorized())
                    .unwrap_or(false)
            };
            if authorized {
                self.timer_destroy(key, TimerType::ReauthWhen)?;
                self.timer_start(key, TimerType::ReauthWhen)?;
            }
        }
        Ok(())
    }

    fn handle_reauth_enabled_set(&self, port: u32, enabled: bool) -> PacResult<()> {
        let keys = {
            let mut st = self.wr()?;
            let pi = port_info_mut(&mut st, port)?;
            if pi.reauth_enabled == enabled {
                return Ok(());
            }
            pi.reauth_enabled = enabled;
            st.registry.keys_on_port(port)
        };
        for key in keys {
            let authorized = {
                let st = self.rd()?;
                st.registry
                    .get(key)
                    .map(|lp| lp.client.is_authorized())
                    .unwrap_or(false)
            };
            if !authorized {
                continue;
            }
            if enabled {
                self.timer_start(key, TimerType::ReauthWhen)?;
            } else {
                self.timer_destroy(key, TimerType::ReauthWhen)?;
            }
        }
        Ok(())
    }

    fn handle_max_users_set(&self, port: u32, count: u32) -> PacResult<()> {
        let shrink = {
            let mut st = self.wr()?;
            let pi = port_info_mut(&mut st, port)?;
            if pi.host_mode != HostMode::MultiAuth {
                return Err(PacError::denied("max users valid only in multi-auth"));
            }
            let shrink = count < pi.num_users;
            pi.max_users = count;
            shrink
        };
        if shrink {
            self.handle_port_initialize(port)?;
        }
        Ok(())
    }

    fn handle_pae_capabilities_set(&self, port: u32, cap: PaeCapability) -> PacResult<()> {
        let old = {
            let mut st = self.wr()?;
            let pi = port_info_mut(&mut st, port)?;
            let old = pi.pae_capabilities;
            pi.pae_capabilities = cap;
            old
        };
        if old == cap {
            return Ok(());
        }
        match cap {
            PaeCapability::None => self.port_clients_purge(port),
            PaeCapability::AuthCapable => self.handle_port_initialize(port),
        }
    }

    fn handle_violation_mode_set(&self, port: u32, enabled: bool) -> PacResult<()> {
        {
            let mut st = self.wr()?;
            port_info_mut(&mut st, port)?.violation_policy = enabled;
        }
        let ifname = self.nim.intf_name(port)?;
        self.cfg.intf_violation_policy_set(&ifname, enabled)
    }

    // ------------------------------------------------------------------
    // Enabled-method bookkeeping and arbitration.
    // ------------------------------------------------------------------

    fn plugins_snapshot(&self) -> Vec<Arc<dyn MethodPlugin>> {
        self.plugins
            .read()
            .expect("plugin table poisoned")
            .values()
            .cloned()
            .collect()
    }

    fn handle_method_enable_change(&self) -> PacResult<()> {
        self.enabled_lists_rebuild_all()
    }

    fn enabled_lists_rebuild_all(&self) -> PacResult<()> {
        let ports: Vec<u32> = {
            let st = self.rd()?;
            st.ports.keys().copied().collect()
        };
        for port in ports {
            self.enabled_lists_rebuild(port)?;
        }
        Ok(())
    }

    /// Recomputes `enabled_methods` / `enabled_priority` from the
    /// configured lists and each plugin's live enable status. Clients
    /// authenticated by a method that just left the enabled set are
    /// torn down; clients on other methods are untouched.
    pub(crate) fn enabled_lists_rebuild(&self, port: u32) -> PacResult<()> {
        let (method_list, priority_list, old_enabled) = {
            let st = self.rd()?;
            let pi = port_info(&st, port)?;
            (
                pi.method_list.clone(),
                pi.priority_list.clone(),
                pi.enabled_methods.clone(),
            )
        };

        // plugin callbacks run outside the state lock
        let enabled_of = |m: &Method| {
            self.plugin(*m)
                .map(|p| p.enable_get(port))
                .unwrap_or(false)
        };
        let enabled_methods: Vec<Method> =
            method_list.iter().copied().filter(|m| enabled_of(m)).collect();
        let enabled_priority: Vec<Method> = priority_list
            .iter()
            .copied()
            .filter(|m| enabled_of(m))
            .collect();

        {
            let mut st = self.wr()?;
            let pi = port_info_mut(&mut st, port)?;
            pi.enabled_methods = enabled_methods.clone();
            pi.enabled_priority = enabled_priority;
        }

        for method in old_enabled {
            if !enabled_methods.contains(&method) {
                self.clients_by_method_delete(port, method)?;
            }
        }
        Ok(())
    }

    fn clients_by_method_delete(&self, port: u32, method: Method) -> PacResult<()> {
        let keys = {
            let st = self.rd()?;
            st.registry.keys_on_port(port)
        };
        for key in keys {
            let matches = {
                let st = self.rd()?;
                st.registry
                    .get(key)
                    .map(|lp| lp.client.authenticated_method == Some(method))
                    .unwrap_or(false)
            };
            if matches {
                self.client_cleanup(key)?;
            }
        }
        Ok(())
    }

    /// `Ok` iff `incoming` outranks `current` on the port's enabled
    /// priority array: a lower index is a higher priority; equal or
    /// unknown methods never take precedence.
    pub fn priority_precedence(&self, port: u32, current: Method, incoming: Method) -> PacResult<()> {
        let st = self.rd()?;
        let pi = port_info(&st, port)?;
        let idx = |m: Method| pi.enabled_priority.iter().position(|&x| x == m);
        match (idx(current), idx(incoming)) {
            (Some(c), Some(i)) if i < c => Ok(()),
            _ => Err(PacError::failure("no precedence")),
        }
    }

    // ------------------------------------------------------------------
    // Client arrival and method results.
    // ------------------------------------------------------------------

    #[instrument(skip(self), fields(%mac))]
    fn handle_client_seen(
        &self,
        port: u32,
        mac: MacAddr,
        method: Method,
        vlan: Option<u16>,
    ) -> PacResult<()> {
        {
            let st = self.rd()?;
            if !st.admin_mode {
                return Ok(());
            }
            let pi = port_info(&st, port)?;
            if !pi.port_enabled
                || pi.port_control_mode != PortControlMode::Auto
                || pi.pae_capabilities != PaeCapability::AuthCapable
            {
                return Ok(());
            }
            if !pi.enabled_methods.contains(&method) {
                debug!(port, ?method, "method not enabled; client ignored");
                return Ok(());
            }
        }

        if let Some(key) = self.mac_index.find(mac) {
            if key.phys_port() == port {
                return self.existing_client_action(key, method);
            }
            // the MAC moved to another port: the old binding goes
            // before the new one is completed
            info!(%mac, from = key.phys_port(), to = port, "client roamed");
            self.client_cleanup(key)?;
        }

        let key = {
            let mut st = self.wr()?;
            let pi = port_info(&st, port)?;
            let (host_mode, eff_max) = (pi.host_mode, effective_max_users(pi));
            let MgrState { registry, .. } = &mut *st;
            let key = registry.alloc(port, eff_max, host_mode)?.key;
            registry.get_mut(key).expect("fresh entry").client.mac = mac;
            port_info_mut(&mut st, port)?.num_users += 1;
            key
        };
        self.mac_index.insert(mac, key)?;

        // drop rule until the client authenticates
        let block_vlan = {
            let st = self.rd()?;
            vlan.unwrap_or_else(|| st.vlans.port_default_vlan(port).unwrap_or(0))
        };
        if block_vlan != 0 {
            let ifname = self.nim.intf_name(port)?;
            if self.cfg.client_block(&ifname, mac, block_vlan).is_ok() {
                let mut st = self.wr()?;
                if let Some(lp) = st.registry.get_mut(key) {
                    lp.client.data_blocked = true;
                    lp.client.block_vlan_id = block_vlan;
                }
            }
        }

        {
            let mut st = self.wr()?;
            if let Some(lp) = st.registry.get_mut(key) {
                lp.protocol.authenticate = true;
            }
        }
        self.state_machine(key, SmEvent::Initialize)
    }

    /// A method reported a client we already track on the same port.
    fn existing_client_action(&self, key: LPortKey, method: Method) -> PacResult<()> {
        let port = key.phys_port();
        let (state, authenticated_method) = {
            let st = self.rd()?;
            let lp = st
                .registry
                .get(key)
                .ok_or_else(|| PacError::not_exist("client"))?;
            (lp.protocol.auth_state, lp.client.authenticated_method)
        };
        match state {
            // quiet period: no new attempts for this MAC until expiry
            AuthState::Held => Ok(()),
            AuthState::Authenticating | AuthState::Initialize | AuthState::Unauthenticated => {
                Ok(())
            }
            AuthState::Authenticated => {
                if authenticated_method == Some(method) {
                    // the authenticated method saw the client again
                    let mut st = self.wr()?;
                    if let Some(lp) = st.registry.get_mut(key) {
                        lp.protocol.authenticated_rcvd_start = true;
                    }
                    drop(st);
                    self.generate_events(key)
                } else if let Some(current) = authenticated_method {
                    if self.priority_precedence(port, current, method).is_ok() {
                        info!(
                            port,
                            incoming = method.as_str(),
                            current = current.as_str(),
                            "higher-priority method preempts"
                        );
                        {
                            let mut st = self.wr()?;
                            if let Some(lp) = st.registry.get_mut(key) {
                                lp.client.current_method = Some(method);
                            }
                        }
                        self.state_machine(key, SmEvent::HigherMethodAdded)
                    } else {
                        debug!(port, incoming = method.as_str(), "lower priority; ignored");
                        Ok(())
                    }
                } else {
                    Ok(())
                }
            }
        }
    }

    fn handle_method_result(
        &self,
        port: u32,
        mac: MacAddr,
        method: Method,
        status: MethodStatus,
    ) -> PacResult<()> {
        let Some(key) = self.mac_index.find(mac) else {
            debug!(%mac, "result for unknown client");
            return Ok(());
        };
        if key.phys_port() != port {
            return Ok(());
        }
        self.timer_destroy(key, TimerType::MethodNoResp)?;

        {
            let mut st = self.wr()?;
            let stats = st.stats.entry(port).or_default().for_method(method);
            match &status {
                MethodStatus::Success(_) => stats.successes += 1,
                MethodStatus::Fail => stats.failures += 1,
                MethodStatus::Timeout | MethodStatus::ServerCommFailure => stats.timeouts += 1,
                MethodStatus::Disconnected => {}
            }
        }

        match status {
            MethodStatus::Success(attrs) => self.status_success_action(key, method, attrs),
            MethodStatus::Fail => {
                {
                    let mut st = self.wr()?;
                    if let Some(lp) = st.registry.get_mut(key) {
                        lp.protocol.auth_fail = true;
                    }
                }
                self.generate_events(key)
            }
            MethodStatus::Timeout | MethodStatus::ServerCommFailure => {
                {
                    let mut st = self.wr()?;
                    if let Some(lp) = st.registry.get_mut(key) {
                        lp.protocol.auth_timeout = true;
                    }
                }
                self.generate_events(key)
            }
            MethodStatus::Disconnected => self.client_cleanup(key),
        }
    }

    /// Applies a successful method result: resolves the client's
    /// VLAN, captures session attributes and feeds the FSM.
    fn status_success_action(
        &self,
        key: LPortKey,
        method: Method,
        attrs: pac_common::ClientAttrs,
    ) -> PacResult<()> {
        let port = key.phys_port();

        let resolved = {
            let st = self.rd()?;
            match attrs.vlan_id {
                Some(v) if (1..=4094).contains(&v) => Some((v, pac_common::VlanType::Radius)),
                Some(_) => None,
                None => st
                    .vlans
                    .port_default_vlan(port)
                    .map(|v| (v, pac_common::VlanType::Default)),
            }
        };
        let Some((vlan, vlan_type)) = resolved else {
            warn!(port, "no usable VLAN for authenticated client");
            let mut st = self.wr()?;
            if let Some(lp) = st.registry.get_mut(key) {
                lp.protocol.auth_fail = true;
            }
            drop(st);
            return self.generate_events(key);
        };

        let needs_hw_cleanup = {
            let mut st = self.wr()?;
            let Some(lp) = st.registry.get_mut(key) else {
                return Ok(());
            };
            lp.client.user_name = attrs.user_name.clone();
            lp.client.session_timeout = attrs.session_timeout.unwrap_or(0);
            lp.client.termination_action = attrs.termination_action;
            lp.client.server_state = attrs.server_state.clone();
            lp.client.server_class = attrs.server_class.clone();
            lp.client.filter_id = attrs.filter_id.clone();
            lp.client.current_method = Some(method);
            lp.protocol.auth_success = true;

            // same VLAN while already authorized means nothing to redo
            // in the dataplane
            !crate::client::cleanup_not_needed(&lp.client, vlan)
                && lp.client.is_authorized()
        };
        if needs_hw_cleanup {
            self.client_hw_info_cleanup(key)?;
        }
        {
            let mut st = self.wr()?;
            if let Some(lp) = st.registry.get_mut(key) {
                lp.client.vlan_id = vlan;
                lp.client.vlan_type = Some(vlan_type);
            }
        }
        self.generate_events(key)
    }

    // ------------------------------------------------------------------
    // Interface and VLAN notifications.
    // ------------------------------------------------------------------

    fn handle_time_tick(&self) -> PacResult<()> {
        {
            let mut st = self.wr()?;
            st.tick += 1;
        }
        self.timer.process();
        Ok(())
    }

    fn handle_intf_change(&self, port: u32, event: IntfEvent) -> PacResult<()> {
        match event {
            IntfEvent::Up | IntfEvent::Attach => {
                let up = self.nim.intf_link_up(port) && self.nim.intf_admin_up(port);
                let mode = {
                    let mut guard = self.wr()?;
                    let st = &mut *guard;
                    st.ports.entry(port).or_default().port_enabled = up;
                    st.stats.entry(port).or_default();
                    st.ports.get(&port).map(|p| p.port_control_mode)
                };
                if up && mode == Some(PortControlMode::Auto) {
                    let ifname = self.nim.intf_name(port)?;
                    self.host_mode_policy_apply(port, &ifname)?;
                }
                Ok(())
            }
            IntfEvent::Down | IntfEvent::Detach => {
                // link loss drops every client straight to
                // unauthenticated, dataplane state removed
                {
                    let mut st = self.wr()?;
                    if let Some(pi) = st.ports.get_mut(&port) {
                        pi.port_enabled = false;
                    }
                }
                self.port_clients_purge(port)
            }
        }
    }

    fn handle_intf_startup(&self, port: u32, phase: crate::event::StartupPhase) -> PacResult<()> {
        match phase {
            crate::event::StartupPhase::Create => {
                let mut guard = self.wr()?;
                let st = &mut *guard;
                st.ports.entry(port).or_default();
                st.stats.entry(port).or_default();
                Ok(())
            }
            crate::event::StartupPhase::Activate => {
                self.handle_intf_change(port, IntfEvent::Attach)
            }
        }
    }

    fn handle_vlan_add(&self, vlan: u16) -> PacResult<()> {
        let mut st = self.wr()?;
        st.vlans.vlan_add(VlanDbKind::Operational, vlan)?;
        st.vlans.vlan_add(VlanDbKind::Configured, vlan)
    }

    fn handle_vlan_delete(&self, vlan: u16) -> PacResult<()> {
        let keys = {
            let mut st = self.wr()?;
            st.vlans.vlan_delete(VlanDbKind::Operational, vlan)?;
            st.vlans.vlan_delete(VlanDbKind::Configured, vlan)?;
            st.registry.all_keys()
        };
        // authorized clients on the deleted VLAN lose their session
        for key in keys {
            let affected = {
                let st = self.rd()?;
                st.registry
                    .get(key)
                    .map(|lp| lp.client.is_authorized() && lp.client.vlan_id == vlan)
                    .unwrap_or(false)
            };
            if affected {
                self.client_cleanup(key)?;
            }
        }
        Ok(())
    }

    fn handle_vlan_port_add(&self, vlan: u16, port: u32, tagged: bool) -> PacResult<()> {
        let mut st = self.wr()?;
        st.vlans
            .port_vlan_add(VlanDbKind::Operational, vlan, port, tagged)?;
        st.vlans
            .port_vlan_add(VlanDbKind::Configured, vlan, port, tagged)
    }

    fn handle_vlan_port_delete(&self, vlan: u16, port: u32) -> PacResult<()> {
        let mut st = self.wr()?;
        st.vlans
            .port_vlan_delete(VlanDbKind::Operational, vlan, port)?;
        st.vlans
            .port_vlan_delete(VlanDbKind::Configured, vlan, port)
    }

    fn handle_vlan_pvid_change(&self, port: u32, pvid: u16) -> PacResult<()> {
        let mut st = self.wr()?;
        st.vlans.port_pvid_set(VlanDbKind::Operational, port, pvid);
        st.vlans.port_pvid_set(VlanDbKind::Configured, port, pvid);
        if let Some(pi) = st.ports.get_mut(&port) {
            pi.pvid = pvid;
        }
        Ok(())
    }

    /// Tears down every client on a port.
    pub(crate) fn port_clients_purge(&self, port: u32) -> PacResult<()> {
        let keys = {
            let st = self.rd()?;
            st.registry.keys_on_port(port)
        };
        for key in keys {
            self.client_cleanup(key)?;
        }
        Ok(())
    }

    /// Notifies the owning method and removes all trace of a client:
    /// timers, dataplane state, MAC index entry, registry slot.
    #[instrument(skip(self))]
    pub(crate) fn client_cleanup(&self, key: LPortKey) -> PacResult<()> {
        let port = key.phys_port();
        let (mac, authorized, method) = {
            let st = self.rd()?;
            let Some(lp) = st.registry.get(key) else {
                return Ok(());
            };
            (
                lp.client.mac,
                lp.client.is_authorized(),
                lp.client.current_method,
            )
        };
        self.timer_destroy(key, TimerType::QuietWhile)?;
        self.timer_destroy(key, TimerType::ReauthWhen)?;
        self.timer_destroy(key, TimerType::MethodNoResp)?;

        if authorized {
            self.client_hw_info_cleanup(key)?;
            self.client_status_set(key, PortStatus::Unauthorized)?;
        }
        self.client_block_cleanup(key)?;

        if let Some(method) = method {
            if let Some(plugin) = self.plugin(method) {
                let _ = plugin.event_notify(port, MethodEvent::Disconnect, mac);
            }
        }

        if !mac.is_zero() {
            self.mac_index.remove(mac);
        }
        let mut st = self.wr()?;
        st.registry.free(key);
        if let Some(pi) = st.ports.get_mut(&port) {
            pi.num_users = pi.num_users.saturating_sub(1);
        }
        debug!(?key, %mac, "client removed");
        Ok(())
    }
}

/// Clients a port admits under its current host mode.
pub(crate) fn effective_max_users(pi: &PortInfo) -> u32 {
    match pi.host_mode {
        HostMode::SingleAuth | HostMode::MultiHost => 1,
        HostMode::MultiAuth => pi.max_users,
        HostMode::Invalid => 1,
    }
}

pub(crate) fn port_info<'a>(st: &'a MgrState, port: u32) -> PacResult<&'a PortInfo> {
    st.ports
        .get(&port)
        .ok_or_else(|| PacError::not_exist(format!("interface {}", port)))
}

pub(crate) fn port_info_mut<'a>(st: &'a mut MgrState, port: u32) -> PacResult<&'a mut PortInfo> {
    st.ports
        .get_mut(&port)
        .ok_or_else(|| PacError::not_exist(format!("interface {}", port)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::RecordingPacCfg;
    use pac_common::StaticNim;

    fn mgr() -> (Arc<AuthMgr>, pac_common::BusReceiver<AuthmgrEvent>) {
        let cfg = Arc::new(RecordingPacCfg::new());
        let nim = Arc::new(StaticNim::new(4));
        AuthMgr::new(cfg, nim)
    }

    fn drain(mgr: &AuthMgr, rx: &pac_common::BusReceiver<AuthmgrEvent>) {
        while let Some(ev) = rx.try_next() {
            let _ = mgr.dispatch(ev);
        }
    }

    #[test]
    fn test_admin_enable_builds_port_table() {
        let (mgr, rx) = mgr();
        mgr.admin_mode_set(true).unwrap();
        drain(&mgr, &rx);
        for port in 1..=4 {
            let pi = mgr.port_snapshot(port).expect("port exists");
            assert!(pi.port_enabled);
            assert_eq!(pi.port_control_mode, PortControlMode::Invalid);
        }
        assert!(mgr.port_snapshot(5).is_none());
    }

    #[test]
    fn test_invalid_mode_rejected_synchronously() {
        let (mgr, _rx) = mgr();
        assert!(matches!(
            mgr.port_control_mode_set(1, PortControlMode::Invalid),
            Err(PacError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_effective_max_users_by_host_mode() {
        let mut pi = PortInfo {
            max_users: 16,
            ..Default::default()
        };
        pi.host_mode = HostMode::SingleAuth;
        assert_eq!(effective_max_users(&pi), 1);
        pi.host_mode = HostMode::MultiHost;
        assert_eq!(effective_max_users(&pi), 1);
        pi.host_mode = HostMode::MultiAuth;
        assert_eq!(effective_max_users(&pi), 16);
    }

    #[test]
    fn test_control_mode_round_trip() {
        let (mgr, rx) = mgr();
        mgr.admin_mode_set(true).unwrap();
        drain(&mgr, &rx);
        mgr.port_control_mode_set(2, PortControlMode::Auto).unwrap();
        drain(&mgr, &rx);
        assert_eq!(
            mgr.port_snapshot(2).unwrap().port_control_mode,
            PortControlMode::Auto
        );
        // setting the same mode again is a no-op
        mgr.port_control_mode_set(2, PortControlMode::Auto).unwrap();
        drain(&mgr, &rx);
        assert_eq!(
            mgr.port_snapshot(2).unwrap().port_control_mode,
            PortControlMode::Auto
        );
    }
}
