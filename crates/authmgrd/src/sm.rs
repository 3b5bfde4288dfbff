//! Per-client authentication state machine.
//!
//! A fixed transition table maps (event, state) to the next state;
//! entry actions run on every transition. The event generator runs
//! after selected actions, inspecting the client's protocol flags to
//! decide which event to feed back, so a single external stimulus
//! (a method result, a timer) ripples through to a stable state.

use tracing::{debug, info, warn};

use pac_common::{LPortKey, Method, MethodEvent, PacError, PacResult, PortStatus};

use crate::control::{port_info, AuthMgr};
use crate::types::{AuthState, SmEvent, TimerType};

/// `STATE_TABLE[event][state]` is the next state, `None` when the
/// event is ignored in that state. Column order: Initialize,
/// Authenticating, Authenticated, Held, Unauthenticated.
#[rustfmt::skip]
const STATE_TABLE: [[Option<AuthState>; 5]; 12] = {
    use AuthState::*;
    [
        /* Initialize          */ [Some(Initialize), Some(Initialize), Some(Initialize), Some(Initialize), Some(Initialize)],
        /* StartAuthenticate   */ [Some(Unauthenticated), None, None, None, None],
        /* AuthSuccess         */ [None, Some(Authenticated), Some(Authenticated), None, Some(Authenticated)],
        /* NotSuccessNoNext    */ [None, Some(Held), None, None, None],
        /* NotSuccessNext      */ [None, Some(Authenticating), None, None, Some(Authenticating)],
        /* HeldTimerExpired    */ [None, None, None, Some(Unauthenticated), None],
        /* StopAuthenticate    */ [None, Some(Unauthenticated), Some(Unauthenticated), None, None],
        /* HigherMethodAdded   */ [None, None, Some(Authenticating), None, None],
        /* Reauthenticate      */ [None, None, Some(Authenticating), None, None],
        /* AuthenticatedRxStart*/ [None, None, Some(Authenticating), None, None],
        /* AuthFail            */ [None, None, Some(Authenticating), None, None],
        /* AbortAndRestart     */ [None, None, Some(Authenticating), None, None],
    ]
};

fn event_index(ev: SmEvent) -> usize {
    match ev {
        SmEvent::Initialize => 0,
        SmEvent::StartAuthenticate => 1,
        SmEvent::AuthSuccess => 2,
        SmEvent::NotSuccessNoNextMethod => 3,
        SmEvent::NotSuccessNextMethod => 4,
        SmEvent::HeldTimerExpired => 5,
        SmEvent::StopAuthenticate => 6,
        SmEvent::HigherMethodAdded => 7,
        SmEvent::Reauthenticate => 8,
        SmEvent::AuthenticatedRxStart => 9,
        SmEvent::AuthFail => 10,
        SmEvent::AbortAndRestart => 11,
    }
}

fn state_index(st: AuthState) -> usize {
    match st {
        AuthState::Initialize => 0,
        AuthState::Authenticating => 1,
        AuthState::Authenticated => 2,
        AuthState::Held => 3,
        AuthState::Unauthenticated => 4,
    }
}

/// Looks up the transition table.
pub fn next_state(event: SmEvent, state: AuthState) -> Option<AuthState> {
    STATE_TABLE[event_index(event)][state_index(state)]
}

/// Next method after `current` in the enabled order; `None` current
/// yields the first enabled method.
pub fn next_enabled_method(enabled: &[Method], current: Option<Method>) -> Option<Method> {
    match current {
        None => enabled.first().copied(),
        Some(m) => {
            let pos = enabled.iter().position(|&x| x == m)?;
            enabled.get(pos + 1).copied()
        }
    }
}

impl AuthMgr {
    /// Runs one FSM transition for the client and executes the entry
    /// action of the next state. Ignored events are a no-op.
    pub(crate) fn state_machine(&self, key: LPortKey, event: SmEvent) -> PacResult<()> {
        let state = {
            let st = self.rd()?;
            match st.registry.get(key) {
                Some(lp) => lp.protocol.auth_state,
                None => return Err(PacError::not_exist("client")),
            }
        };
        let Some(next) = next_state(event, state) else {
            debug!(?key, ?event, ?state, "event ignored");
            return Ok(());
        };
        debug!(?key, ?event, from = ?state, to = ?next, "fsm transition");

        match next {
            AuthState::Initialize => {
                self.initialize_action(key)?;
                self.generate_events(key)
            }
            AuthState::Authenticating => self.authenticating_action(key),
            AuthState::Authenticated => self.authenticated_action(key),
            AuthState::Held => self.held_action(key),
            AuthState::Unauthenticated => {
                self.unauthenticated_action(key)?;
                self.generate_events(key)
            }
        }
    }

    fn initialize_action(&self, key: LPortKey) -> PacResult<()> {
        let mut st = self.wr()?;
        if let Some(lp) = st.registry.get_mut(key) {
            lp.client.executed_methods.clear();
            lp.protocol.auth_state = AuthState::Initialize;
        }
        Ok(())
    }

    fn authenticating_action(&self, key: LPortKey) -> PacResult<()> {
        let trigger = {
            let mut st = self.wr()?;
            let Some(lp) = st.registry.get_mut(key) else {
                return Ok(());
            };
            lp.protocol.auth_state = AuthState::Authenticating;
            lp.protocol.auth_fail = false;
            lp.protocol.auth_timeout = false;
            lp.protocol.auth_success = false;

            if lp.protocol.authenticated_rcvd_start {
                // the authenticated method pumps its own events; do
                // not trigger a fresh attempt
                lp.protocol.authenticated_rcvd_start = false;
                lp.client.current_method = lp.client.authenticated_method;
                None
            } else {
                lp.client.current_method.map(|m| (m, lp.client.mac))
            }
        };
        let Some((method, mac)) = trigger else {
            return Ok(());
        };

        let port = key.phys_port();
        {
            let mut st = self.wr()?;
            st.stats.entry(port).or_default().for_method(method).attempts += 1;
            if let Some(lp) = st.registry.get_mut(key) {
                if !lp.client.executed_methods.contains(&method) {
                    lp.client.executed_methods.push(method);
                }
            }
        }

        // method callout outside the state lock
        let triggered = match self.plugin(method) {
            Some(plugin) => plugin.event_notify(port, MethodEvent::AuthStart, mac).is_ok(),
            None => false,
        };

        if triggered {
            self.timer_start(key, TimerType::MethodNoResp)?;
        } else {
            warn!(?key, method = method.as_str(), "method failed to start");
            {
                let mut st = self.wr()?;
                if let Some(lp) = st.registry.get_mut(key) {
                    lp.protocol.auth_fail = true;
                }
            }
            self.generate_events(key)?;
        }
        Ok(())
    }

    fn authenticated_action(&self, key: LPortKey) -> PacResult<()> {
        let port = key.phys_port();

        if let Err(e) = self.client_hw_info_add(key) {
            warn!(?key, error = %e, "dataplane install failed; unauthenticating");
            let mut st = self.wr()?;
            if let Some(lp) = st.registry.get_mut(key) {
                lp.protocol.auth_state = AuthState::Authenticated;
                lp.protocol.unauthenticate = true;
            }
            drop(st);
            return self.generate_events(key);
        }

        self.client_status_set(key, PortStatus::Authorized)?;

        let (mac, vlan_type, reauth_enabled) = {
            let mut st = self.wr()?;
            let reauth_enabled = port_info(&st, port)?.reauth_enabled;
            let tick = st.tick;
            let Some(lp) = st.registry.get_mut(key) else {
                return Ok(());
            };
            lp.protocol.auth_state = AuthState::Authenticated;
            if lp.protocol.reauth {
                lp.client.reauth_count += 1;
            }
            lp.protocol.reauth = false;
            lp.protocol.auth_fail = false;
            lp.protocol.auth_timeout = false;
            lp.protocol.auth_success = false;
            lp.client.authenticated_method = lp.client.current_method;
            lp.client.last_auth_time = tick;
            if lp.client.session_start_time == 0 {
                lp.client.session_start_time = tick;
            }
            (lp.client.mac, lp.client.vlan_type, reauth_enabled)
        };

        if reauth_enabled {
            self.timer_start(key, TimerType::ReauthWhen)?;
        }

        info!(
            %mac,
            port,
            vlan_type = ?vlan_type,
            "client authorized"
        );
        Ok(())
    }

    fn held_action(&self, key: LPortKey) -> PacResult<()> {
        let port = key.phys_port();
        let (was_authorized, failed, mac) = {
            let st = self.rd()?;
            let Some(lp) = st.registry.get(key) else {
                return Ok(());
            };
            (
                lp.client.is_authorized(),
                lp.protocol.auth_fail || lp.protocol.auth_timeout,
                lp.client.mac,
            )
        };

        // an authorized client that failed reauthentication loses its
        // installed state before the quiet period starts
        if was_authorized {
            self.client_hw_info_cleanup(key)?;
            self.client_status_set(key, PortStatus::Unauthorized)?;
        }

        self.timer_destroy(key, TimerType::ReauthWhen)?;
        self.timer_start(key, TimerType::QuietWhile)?;

        {
            let mut st = self.wr()?;
            if let Some(lp) = st.registry.get_mut(key) {
                lp.protocol.auth_state = AuthState::Held;
            }
        }
        if failed {
            let ifname = self.nim.intf_name(port).unwrap_or_default();
            info!(%mac, %ifname, "client authentication failed");
        }
        Ok(())
    }

    fn unauthenticated_action(&self, key: LPortKey) -> PacResult<()> {
        let (reauth_in_progress, held_expired, authorized) = {
            let mut st = self.wr()?;
            let Some(lp) = st.registry.get_mut(key) else {
                return Ok(());
            };
            if lp.protocol.reauth && lp.protocol.auth_fail {
                lp.protocol.reauth = false;
            }
            (
                lp.protocol.reauth && lp.client.is_authorized(),
                lp.protocol.held_expired,
                lp.client.is_authorized(),
            )
        };

        if !reauth_in_progress || held_expired {
            if authorized {
                self.client_hw_info_cleanup(key)?;
            }
            self.client_status_set(key, PortStatus::Unauthorized)?;
        }

        let mut st = self.wr()?;
        if let Some(lp) = st.registry.get_mut(key) {
            lp.protocol.auth_state = AuthState::Unauthenticated;
        }
        Ok(())
    }

    /// Classifies the next event from the client's flags and feeds it
    /// back into the FSM.
    pub(crate) fn generate_events(&self, key: LPortKey) -> PacResult<()> {
        let port = key.phys_port();
        let snapshot = {
            let st = self.rd()?;
            let Some(lp) = st.registry.get(key) else {
                return Ok(());
            };
            let port_enabled = port_info(&st, port)?.port_enabled;
            (
                lp.protocol.clone(),
                lp.client.current_method,
                lp.client.authenticated_method,
                port_enabled,
            )
        };
        let (proto, current_method, authenticated_method, port_enabled) = snapshot;

        match proto.auth_state {
            AuthState::Initialize => {
                if port_enabled {
                    return self.state_machine(key, SmEvent::StartAuthenticate);
                }
                Ok(())
            }
            AuthState::Unauthenticated => {
                if proto.auth_success {
                    return self.state_machine(key, SmEvent::AuthSuccess);
                }
                if proto.held_expired {
                    // the quiet period ran out with nothing pending;
                    // the client entry is dropped for the next cycle
                    return self.client_cleanup(key);
                }
                if proto.authenticate {
                    let next = {
                        let st = self.rd()?;
                        let enabled = &port_info(&st, port)?.enabled_methods;
                        next_enabled_method(enabled, current_method)
                    };
                    let Some(next) = next else {
                        debug!(?key, "no enabled method available");
                        return Ok(());
                    };
                    {
                        let mut st = self.wr()?;
                        if let Some(lp) = st.registry.get_mut(key) {
                            lp.client.current_method = Some(next);
                        }
                    }
                    return self.state_machine(key, SmEvent::NotSuccessNextMethod);
                }
                Ok(())
            }
            AuthState::Authenticating => {
                if proto.reauth {
                    if !proto.auth_fail && !proto.auth_timeout && !proto.auth_success {
                        // reauthentication still in flight
                        return Ok(());
                    }
                    if proto.auth_fail && authenticated_method.is_some() {
                        return self.state_machine(key, SmEvent::NotSuccessNoNextMethod);
                    }
                }
                if proto.unauthenticate {
                    return self.state_machine(key, SmEvent::StopAuthenticate);
                }
                if proto.auth_success {
                    return self.state_machine(key, SmEvent::AuthSuccess);
                }
                let mut have_next = true;
                if proto.auth_fail || proto.auth_timeout {
                    let next = {
                        let st = self.rd()?;
                        let enabled = &port_info(&st, port)?.enabled_methods;
                        next_enabled_method(enabled, current_method)
                    };
                    match next {
                        Some(next) => {
                            let mut st = self.wr()?;
                            if let Some(lp) = st.registry.get_mut(key) {
                                lp.client.current_method = Some(next);
                            }
                        }
                        None => have_next = false,
                    }
                }
                if have_next {
                    self.state_machine(key, SmEvent::NotSuccessNextMethod)
                } else {
                    self.state_machine(key, SmEvent::NotSuccessNoNextMethod)
                }
            }
            AuthState::Held => {
                if proto.held_expired {
                    return self.state_machine(key, SmEvent::HeldTimerExpired);
                }
                Ok(())
            }
            AuthState::Authenticated => {
                if proto.auth_success {
                    return self.state_machine(key, SmEvent::AuthSuccess);
                }
                if proto.unauthenticate {
                    return self.state_machine(key, SmEvent::StopAuthenticate);
                }
                let mut reauth = proto.reauth;
                if proto.authenticated_rcvd_start {
                    let mut st = self.wr()?;
                    if let Some(lp) = st.registry.get_mut(key) {
                        lp.protocol.authenticated_rcvd_start = false;
                        lp.protocol.reauth = true;
                    }
                    reauth = true;
                }
                if reauth {
                    return self.state_machine(key, SmEvent::Reauthenticate);
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_from_every_state() {
        for st in [
            AuthState::Initialize,
            AuthState::Authenticating,
            AuthState::Authenticated,
            AuthState::Held,
            AuthState::Unauthenticated,
        ] {
            assert_eq!(next_state(SmEvent::Initialize, st), Some(AuthState::Initialize));
        }
    }

    #[test]
    fn test_start_authenticate_only_from_initialize() {
        assert_eq!(
            next_state(SmEvent::StartAuthenticate, AuthState::Initialize),
            Some(AuthState::Unauthenticated)
        );
        assert_eq!(
            next_state(SmEvent::StartAuthenticate, AuthState::Authenticating),
            None
        );
        assert_eq!(next_state(SmEvent::StartAuthenticate, AuthState::Held), None);
    }

    #[test]
    fn test_success_paths() {
        assert_eq!(
            next_state(SmEvent::AuthSuccess, AuthState::Authenticating),
            Some(AuthState::Authenticated)
        );
        assert_eq!(
            next_state(SmEvent::AuthSuccess, AuthState::Unauthenticated),
            Some(AuthState::Authenticated)
        );
        assert_eq!(next_state(SmEvent::AuthSuccess, AuthState::Held), None);
        assert_eq!(next_state(SmEvent::AuthSuccess, AuthState::Initialize), None);
    }

    #[test]
    fn test_failure_paths() {
        assert_eq!(
            next_state(SmEvent::NotSuccessNoNextMethod, AuthState::Authenticating),
            Some(AuthState::Held)
        );
        assert_eq!(
            next_state(SmEvent::NotSuccessNextMethod, AuthState::Authenticating),
            Some(AuthState::Authenticating)
        );
        assert_eq!(
            next_state(SmEvent::HeldTimerExpired, AuthState::Held),
            Some(AuthState::Unauthenticated)
        );
        assert_eq!(
            next_state(SmEvent::HeldTimerExpired, AuthState::Authenticated),
            None
        );
    }

    #[test]
    fn test_authenticated_reentry_events() {
        for ev in [
            SmEvent::HigherMethodAdded,
            SmEvent::Reauthenticate,
            SmEvent::AuthenticatedRxStart,
            SmEvent::AuthFail,
            SmEvent::AbortAndRestart,
        ] {
            assert_eq!(
                next_state(ev, AuthState::Authenticated),
                Some(AuthState::Authenticating)
            );
            assert_eq!(next_state(ev, AuthState::Held), None);
        }
    }

    #[test]
    fn test_next_enabled_method() {
        let enabled = [Method::Dot1x, Method::Mab];
        assert_eq!(next_enabled_method(&enabled, None), Some(Method::Dot1x));
        assert_eq!(
            next_enabled_method(&enabled, Some(Method::Dot1x)),
            Some(Method::Mab)
        );
        assert_eq!(next_enabled_method(&enabled, Some(Method::Mab)), None);
        assert_eq!(next_enabled_method(&[], None), None);
        // a method no longer enabled yields no successor
        assert_eq!(next_enabled_method(&[Method::Mab], Some(Method::Dot1x)), None);
    }
}
