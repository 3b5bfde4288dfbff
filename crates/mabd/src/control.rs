//! MAB worker: event dispatch and the RADIUS transaction driver.
//!
//! MAB fronts its own queue so RADIUS I/O never blocks the AuthMgr
//! worker. The orchestrator reaches in through the method-plugin
//! surface; results travel back through the orchestrator's event
//! sink. All MAB state lives behind its own writer-preferring lock.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use pac_common::{
    AppTimer, AuthEventSink, BusReceiver, BusSender, ClientAttrs, HostMode, LPortKey, LPortKind,
    MacAddr, Method, MethodEvent, MethodPlugin, MethodStatus, NimApi, PacError, PacRwLock,
    PacResult, PortControlMode, QueueClass, Timeout,
};

use crate::auth;
use crate::radius::{
    build_access_request, service_type_acceptable, termination_action_map, tunnel_vlan_extract,
    RadiusCode, RadiusResponseMsg, RadiusTransport,
};
use crate::types::{MabAuthType, MabClient, MabClientState, MabPortCfg, SERVER_AWHILE_PERIOD};

/// Milliseconds to wait for the MAB state lock.
const LOCK_TIMEOUT_MS: u64 = 5000;

/// Timer pool: one server-wait slot per possible client.
const TIMER_POOL_SIZE: usize = 32 * 1024;

/// Slots per port in the MAB client table.
const MAX_CLIENTS_PER_PORT: u32 = 48;

/// Events the MAB worker consumes.
pub enum MabEvent {
    AuthStart { port: u32, mac: MacAddr },
    Reauthenticate { port: u32, mac: MacAddr },
    Disconnect { port: u32, mac: MacAddr },
    /// RADIUS client callback; `correlator` is the logical-port key.
    AaaResponse {
        correlator: u32,
        msg: Box<dyn RadiusResponseMsg>,
    },
    PortCtrl { port: u32, mode: PortControlMode },
    HostCtrl { port: u32, host_mode: HostMode },
    ServerTimeout { key: LPortKey },
    /// The VLAN collaborator removed a VLAN; sessions granted it are
    /// dropped.
    VlanDelete { vlan: u16 },
    TimeTick,
}

impl MabEvent {
    fn queue_class(&self) -> QueueClass {
        match self {
            MabEvent::VlanDelete { .. } => QueueClass::Vlan,
            _ => QueueClass::Normal,
        }
    }
}

impl std::fmt::Debug for MabEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MabEvent::AuthStart { port, mac } => write!(f, "AuthStart({}, {})", port, mac),
            MabEvent::Reauthenticate { port, mac } => {
                write!(f, "Reauthenticate({}, {})", port, mac)
            }
            MabEvent::Disconnect { port, mac } => write!(f, "Disconnect({}, {})", port, mac),
            MabEvent::AaaResponse { correlator, .. } => write!(f, "AaaResponse({})", correlator),
            MabEvent::PortCtrl { port, mode } => write!(f, "PortCtrl({}, {:?})", port, mode),
            MabEvent::HostCtrl { port, host_mode } => {
                write!(f, "HostCtrl({}, {:?})", port, host_mode)
            }
            MabEvent::ServerTimeout { key } => write!(f, "ServerTimeout({:?})", key),
            MabEvent::VlanDelete { vlan } => write!(f, "VlanDelete({})", vlan),
            MabEvent::TimeTick => write!(f, "TimeTick"),
        }
    }
}

/// MAB state behind the lock.
#[derive(Default)]
pub struct MabState {
    pub ports: BTreeMap<u32, MabPortCfg>,
    pub clients: BTreeMap<u32, MabClient>,
    pub mac_map: BTreeMap<MacAddr, LPortKey>,
    pub nas_ip: Option<IpAddr>,
    pub nas_id: Option<String>,
    pub shared_secret: String,
}

/// The MAB daemon.
pub struct MabDaemon {
    state: PacRwLock<MabState>,
    nim: Arc<dyn NimApi>,
    transport: Arc<dyn RadiusTransport>,
    sink: Arc<dyn AuthEventSink>,
    tx: BusSender<MabEvent>,
    timer: Arc<AppTimer>,
}

/// Plugin face of the daemon handed to the orchestrator.
pub struct MabPlugin {
    daemon: Arc<MabDaemon>,
}

impl MethodPlugin for MabPlugin {
    fn method(&self) -> Method {
        Method::Mab
    }

    fn event_notify(&self, port: u32, event: MethodEvent, mac: MacAddr) -> PacResult<()> {
        let ev = match event {
            MethodEvent::AuthStart => MabEvent::AuthStart { port, mac },
            MethodEvent::Reauthenticate => MabEvent::Reauthenticate { port, mac },
            MethodEvent::Disconnect => MabEvent::Disconnect { port, mac },
        };
        self.daemon.issue(ev)
    }

    fn enable_get(&self, port: u32) -> bool {
        self.daemon
            .state
            .read(Timeout::Millis(LOCK_TIMEOUT_MS))
            .map(|st| st.ports.get(&port).map(|p| p.enabled).unwrap_or(false))
            .unwrap_or(false)
    }

    fn port_ctrl(&self, port: u32, mode: PortControlMode) {
        let _ = self.daemon.issue(MabEvent::PortCtrl { port, mode });
    }

    fn host_ctrl(&self, port: u32, host_mode: HostMode) {
        let _ = self.daemon.issue(MabEvent::HostCtrl { port, host_mode });
    }
}

impl MabDaemon {
    /// Creates the daemon and the receiving end of its bus.
    pub fn new(
        nim: Arc<dyn NimApi>,
        transport: Arc<dyn RadiusTransport>,
        sink: Arc<dyn AuthEventSink>,
    ) -> (Arc<MabDaemon>, BusReceiver<MabEvent>) {
        let (tx, rx) = pac_common::event_bus();
        let daemon = Arc::new(MabDaemon {
            state: PacRwLock::new(MabState::default()),
            nim,
            transport,
            sink,
            tx,
            timer: Arc::new(AppTimer::new(TIMER_POOL_SIZE)),
        });
        (daemon, rx)
    }

    /// The plugin face registered with the orchestrator.
    pub fn plugin(self: &Arc<Self>) -> Arc<dyn MethodPlugin> {
        Arc::new(MabPlugin {
            daemon: Arc::clone(self),
        })
    }

    /// Sender used by the RADIUS callback shim and the tick task.
    pub fn sender(&self) -> BusSender<MabEvent> {
        self.tx.clone()
    }

    fn issue(&self, ev: MabEvent) -> PacResult<()> {
        let class = ev.queue_class();
        self.tx.issue(class, ev)
    }

    fn wr(&self) -> PacResult<pac_common::rwlock::PacWriteGuard<'_, MabState>> {
        self.state.write(Timeout::Millis(LOCK_TIMEOUT_MS))
    }

    fn rd(&self) -> PacResult<pac_common::rwlock::PacReadGuard<'_, MabState>> {
        self.state.read(Timeout::Millis(LOCK_TIMEOUT_MS))
    }

    // ------------------------------------------------------------------
    // Configuration surface.
    // ------------------------------------------------------------------

    /// Enables or disables MAB on a port.
    pub fn port_enable_set(&self, port: u32, enabled: bool) -> PacResult<()> {
        {
            let mut st = self.wr()?;
            st.ports.entry(port).or_default().enabled = enabled;
        }
        if !enabled {
            self.port_clients_purge(port)?;
        }
        info!(port, enabled, "mab port enable");
        Ok(())
    }

    /// Selects the credential variant used on a port.
    pub fn auth_type_set(&self, port: u32, auth_type: MabAuthType) -> PacResult<()> {
        let mut st = self.wr()?;
        st.ports.entry(port).or_default().auth_type = auth_type;
        Ok(())
    }

    /// Global NAS identity carried in every Access-Request.
    pub fn nas_config_set(&self, nas_ip: Option<IpAddr>, nas_id: Option<String>) -> PacResult<()> {
        let mut st = self.wr()?;
        st.nas_ip = nas_ip;
        st.nas_id = nas_id;
        Ok(())
    }

    /// Shared secret for the PAP User-Password obfuscation.
    pub fn shared_secret_set(&self, secret: impl Into<String>) -> PacResult<()> {
        let mut st = self.wr()?;
        st.shared_secret = secret.into();
        Ok(())
    }

    /// Entry point for the VLAN collaborator's delete notification.
    pub fn vlan_delete_issue(&self, vlan: u16) -> PacResult<()> {
        self.issue(MabEvent::VlanDelete { vlan })
    }

    /// Client summary for the status surface.
    pub fn client_snapshot(&self, mac: MacAddr) -> Option<MabClient> {
        let st = self.rd().ok()?;
        let key = st.mac_map.get(&mac)?;
        st.clients.get(&key.0).cloned()
    }

    // ------------------------------------------------------------------
    // Worker dispatch.
    // ------------------------------------------------------------------

    /// Applies one event from the bus.
    pub fn dispatch(&self, ev: MabEvent) -> PacResult<()> {
        debug!(?ev, "mab dispatch");
        match ev {
            MabEvent::AuthStart { port, mac } | MabEvent::Reauthenticate { port, mac } => {
                self.auth_start(port, mac)
            }
            MabEvent::Disconnect { port, mac } => self.client_purge(port, mac),
            MabEvent::AaaResponse { correlator, msg } => self.aaa_response(correlator, msg),
            MabEvent::PortCtrl { port, mode } => self.port_ctrl_apply(port, mode),
            MabEvent::HostCtrl { port, host_mode } => self.host_ctrl_apply(port, host_mode),
            MabEvent::ServerTimeout { key } => self.server_timeout(key),
            MabEvent::VlanDelete { vlan } => self.vlan_delete_process(vlan),
            MabEvent::TimeTick => {
                self.timer.process();
                Ok(())
            }
        }
    }

    /// Begins (or restarts) a RADIUS transaction for a client.
    #[instrument(skip(self), fields(%mac))]
    fn auth_start(&self, port: u32, mac: MacAddr) -> PacResult<()> {
        let (key, request) = {
            let mut st = self.wr()?;
            let pcfg = st.ports.entry(port).or_default().clone();
            if !pcfg.enabled {
                debug!(port, "mab not enabled; ignoring auth start");
                return Ok(());
            }

            let key = match st.mac_map.get(&mac).copied() {
                Some(k) => k,
                None => {
                    let key = alloc_key(&st.clients, port)?;
                    st.clients
                        .insert(key.0, MabClient::new(key, mac, pcfg.auth_type));
                    st.mac_map.insert(mac, key);
                    key
                }
            };

            let MabState {
                clients,
                nas_ip,
                nas_id,
                shared_secret,
                ..
            } = &mut *st;
            let client = clients.get_mut(&key.0).expect("client just ensured");
            client.auth_type = pcfg.auth_type;
            client.current_id = client.current_id.wrapping_add(1);
            client.state = MabClientState::Authenticating;
            client.server_state.clear();
            if pcfg.auth_type == MabAuthType::Chap {
                client.challenge = auth::challenge_generate(auth::CHALLENGE_LEN);
            }

            let request = build_access_request(
                self.nim.as_ref(),
                client,
                port,
                *nas_ip,
                nas_id.as_deref(),
                shared_secret,
                None,
            )?;
            (key, request)
        };

        self.server_timer_start(key)?;
        if let Err(e) = self.transport.access_request_send(request) {
            warn!(port, %mac, error = %e, "access-request send failed");
            self.server_timer_stop(key)?;
            self.client_state_reset(key)?;
            self.sink
                .method_result(port, mac, Method::Mab, MethodStatus::ServerCommFailure);
        }
        Ok(())
    }

    /// Handles the RADIUS client callback.
    fn aaa_response(&self, correlator: u32, msg: Box<dyn RadiusResponseMsg>) -> PacResult<()> {
        let key = LPortKey(correlator);
        let port = key.phys_port();
        let (mac, state) = {
            let st = self.rd()?;
            match st.clients.get(&key.0) {
                Some(c) => (c.mac, c.state),
                None => {
                    debug!(correlator, "response for unknown client");
                    return Ok(());
                }
            }
        };
        // only a client waiting on the server consumes a response
        if state != MabClientState::Authenticating {
            return Ok(());
        }

        match msg.response_code() {
            RadiusCode::AccessAccept => self.accept_process(key, port, mac, msg.as_ref()),
            RadiusCode::AccessChallenge => self.challenge_process(key, port, mac, msg.as_ref()),
            RadiusCode::AccessReject => {
                self.server_timer_stop(key)?;
                self.client_state_reset(key)?;
                info!(port, %mac, "radius authentication rejected");
                self.sink
                    .method_result(port, mac, Method::Mab, MethodStatus::Fail);
                Ok(())
            }
            RadiusCode::Timeout | RadiusCode::CommFailure => {
                self.server_timer_stop(key)?;
                self.client_state_reset(key)?;
                warn!(port, %mac, "radius server unreachable");
                self.sink
                    .method_result(port, mac, Method::Mab, MethodStatus::Timeout);
                Ok(())
            }
        }
    }

    fn accept_process(
        &self,
        key: LPortKey,
        port: u32,
        mac: MacAddr,
        msg: &dyn RadiusResponseMsg,
    ) -> PacResult<()> {
        self.server_timer_stop(key)?;

        let attrs = match msg.parse_access_accept() {
            Ok(a) => a,
            Err(e) => {
                warn!(port, %mac, error = %e, "malformed access-accept");
                self.client_state_reset(key)?;
                self.sink
                    .method_result(port, mac, Method::Mab, MethodStatus::Fail);
                return Ok(());
            }
        };

        // an unsupported Service-Type downgrades the Accept to a
        // rejection
        if !service_type_acceptable(attrs.service_type) {
            warn!(
                port,
                %mac,
                service_type = ?attrs.service_type,
                "unsupported service-type in accept"
            );
            self.client_state_reset(key)?;
            self.sink
                .method_result(port, mac, Method::Mab, MethodStatus::Fail);
            return Ok(());
        }

        let vlan = match tunnel_vlan_extract(&attrs) {
            Ok(v) => v,
            Err(()) => {
                warn!(port, %mac, "invalid tunnel VLAN attributes in accept");
                self.client_state_reset(key)?;
                self.sink
                    .method_result(port, mac, Method::Mab, MethodStatus::Fail);
                return Ok(());
            }
        };

        let user_name = {
            let mut st = self.wr()?;
            let Some(client) = st.clients.get_mut(&key.0) else {
                return Ok(());
            };
            client.state = MabClientState::Authenticated;
            client.server_state.clear();
            client.assigned_vlan = vlan;
            client.user_name.clone()
        };

        let result = ClientAttrs {
            user_name,
            session_timeout: attrs.session_timeout,
            termination_action: termination_action_map(attrs.termination_action),
            server_state: attrs.state,
            server_class: attrs.class,
            vlan_id: vlan,
            filter_id: attrs.filter_id,
        };
        info!(port, %mac, vlan = ?vlan, "radius authentication accepted");
        self.sink
            .method_result(port, mac, Method::Mab, MethodStatus::Success(result));
        Ok(())
    }

    /// Multi-round EAP: answer the server's MD5 challenge with a new
    /// Access-Request, echoing the State attribute.
    fn challenge_process(
        &self,
        key: LPortKey,
        port: u32,
        mac: MacAddr,
        msg: &dyn RadiusResponseMsg,
    ) -> PacResult<()> {
        self.server_timer_stop(key)?;

        let attrs = match msg.parse_access_challenge() {
            Ok(a) => a,
            Err(e) => {
                warn!(port, %mac, error = %e, "malformed access-challenge");
                self.client_state_reset(key)?;
                self.sink
                    .method_result(port, mac, Method::Mab, MethodStatus::Fail);
                return Ok(());
            }
        };

        let request = {
            let mut st = self.wr()?;
            let MabState {
                clients,
                nas_ip,
                nas_id,
                shared_secret,
                ..
            } = &mut *st;
            let Some(client) = clients.get_mut(&key.0) else {
                return Ok(());
            };
            if client.auth_type != MabAuthType::EapMd5 {
                warn!(port, %mac, "challenge for a non-EAP variant");
                None
            } else {
                let eap = attrs
                    .eap_message
                    .as_deref()
                    .and_then(auth::eap_md5_challenge_parse);
                match eap {
                    Some((id, challenge)) => {
                        client.current_id = id;
                        client.server_state = attrs.state.clone();
                        let response =
                            auth::eap_md5_response(id, &client.user_name, &challenge);
                        Some(build_access_request(
                            self.nim.as_ref(),
                            client,
                            port,
                            *nas_ip,
                            nas_id.as_deref(),
                            shared_secret,
                            Some(response),
                        )?)
                    }
                    None => {
                        warn!(port, %mac, "challenge without a parsable EAP message");
                        None
                    }
                }
            }
        };

        let Some(request) = request else {
            self.client_state_reset(key)?;
            self.sink
                .method_result(port, mac, Method::Mab, MethodStatus::Fail);
            return Ok(());
        };

        self.server_timer_start(key)?;
        if let Err(e) = self.transport.access_request_send(request) {
            warn!(port, %mac, error = %e, "challenge response send failed");
            self.server_timer_stop(key)?;
            self.client_state_reset(key)?;
            self.sink
                .method_result(port, mac, Method::Mab, MethodStatus::ServerCommFailure);
        }
        Ok(())
    }

    /// The server-wait window closed with no response.
    fn server_timeout(&self, key: LPortKey) -> PacResult<()> {
        let (port, mac, authenticating) = {
            let mut st = self.wr()?;
            let Some(client) = st.clients.get_mut(&key.0) else {
                return Ok(());
            };
            client.server_timer = None;
            (
                key.phys_port(),
                client.mac,
                client.state == MabClientState::Authenticating,
            )
        };
        if !authenticating {
            return Ok(());
        }
        self.client_state_reset(key)?;
        warn!(port, %mac, "radius server-wait expired");
        self.sink
            .method_result(port, mac, Method::Mab, MethodStatus::Timeout);
        Ok(())
    }

    /// A VLAN disappeared from the switch: every session the server
    /// granted that VLAN is stale, so its MAB state goes too. The
    /// orchestrator tears down its own side from the same
    /// notification.
    fn vlan_delete_process(&self, vlan: u16) -> PacResult<()> {
        let stale: Vec<(u32, MacAddr)> = {
            let st = self.rd()?;
            st.clients
                .values()
                .filter(|c| {
                    c.state == MabClientState::Authenticated && c.assigned_vlan == Some(vlan)
                })
                .map(|c| (c.key.phys_port(), c.mac))
                .collect()
        };
        for (port, mac) in stale {
            info!(port, %mac, vlan, "assigned VLAN deleted; dropping mab session");
            self.client_purge(port, mac)?;
        }
        Ok(())
    }

    fn port_ctrl_apply(&self, port: u32, mode: PortControlMode) -> PacResult<()> {
        {
            let mut st = self.wr()?;
            st.ports.entry(port).or_default().port_control_mode = mode;
        }
        if mode != PortControlMode::Auto {
            self.port_clients_purge(port)?;
        }
        Ok(())
    }

    fn host_ctrl_apply(&self, port: u32, host_mode: HostMode) -> PacResult<()> {
        let changed = {
            let mut st = self.wr()?;
            let pcfg = st.ports.entry(port).or_default();
            let changed = pcfg.host_mode != host_mode;
            pcfg.host_mode = host_mode;
            changed
        };
        if changed {
            self.port_clients_purge(port)?;
        }
        Ok(())
    }

    fn port_clients_purge(&self, port: u32) -> PacResult<()> {
        let macs: Vec<MacAddr> = {
            let st = self.rd()?;
            st.clients
                .values()
                .filter(|c| c.key.phys_port() == port)
                .map(|c| c.mac)
                .collect()
        };
        for mac in macs {
            self.client_purge(port, mac)?;
        }
        Ok(())
    }

    /// Drops all MAB state for a client.
    fn client_purge(&self, port: u32, mac: MacAddr) -> PacResult<()> {
        let handle = {
            let mut st = self.wr()?;
            let Some(key) = st.mac_map.remove(&mac) else {
                return Ok(());
            };
            st.clients.remove(&key.0).and_then(|c| c.server_timer)
        };
        if let Some(handle) = handle {
            self.timer.delete(handle);
        }
        debug!(port, %mac, "mab client purged");
        Ok(())
    }

    fn client_state_reset(&self, key: LPortKey) -> PacResult<()> {
        let mut st = self.wr()?;
        if let Some(client) = st.clients.get_mut(&key.0) {
            client.state = MabClientState::Idle;
            client.server_state.clear();
            client.assigned_vlan = None;
        }
        Ok(())
    }

    fn server_timer_start(&self, key: LPortKey) -> PacResult<()> {
        {
            let st = self.rd()?;
            if let Some(client) = st.clients.get(&key.0) {
                if client.server_timer.is_some() {
                    return Ok(());
                }
            } else {
                return Ok(());
            }
        }
        let tx = self.tx.clone();
        let handle = self.timer.add(
            move |ctx| {
                let key = LPortKey(ctx as u32);
                let _ = tx.issue(QueueClass::Normal, MabEvent::ServerTimeout { key });
            },
            key.0 as u64,
            SERVER_AWHILE_PERIOD as u64,
            "mab_server_awhile",
        )?;
        let mut st = self.wr()?;
        if let Some(client) = st.clients.get_mut(&key.0) {
            client.server_timer = Some(handle);
        } else {
            drop(st);
            self.timer.delete(handle);
        }
        Ok(())
    }

    fn server_timer_stop(&self, key: LPortKey) -> PacResult<()> {
        let handle = {
            let mut st = self.wr()?;
            st.clients.get_mut(&key.0).and_then(|c| c.server_timer.take())
        };
        if let Some(handle) = handle {
            self.timer.delete(handle);
        }
        Ok(())
    }
}

fn alloc_key(clients: &BTreeMap<u32, MabClient>, port: u32) -> PacResult<LPortKey> {
    for slot in 0..MAX_CLIENTS_PER_PORT {
        let key = LPortKey::pack(port, slot, LPortKind::Logical);
        if !clients.contains_key(&key.0) {
            return Ok(key);
        }
    }
    Err(PacError::CapacityExceeded { port })
}
