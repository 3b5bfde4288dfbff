//! Per-client timer arming and expiry handling.
//!
//! Timer callbacks never touch manager state: they post a
//! `ClientTimeout` event and the worker applies the expiry action
//! under its lock. A logical port holds one general timer slot
//! (quiet-while or reauth-when) plus an independent
//! method-no-response slot; arming a type that is already armed in
//! its slot is a silent no-op.

use tracing::debug;

use pac_common::{LPortKey, PacResult, QueueClass};

use crate::control::{port_info, AuthMgr};
use crate::event::AuthmgrEvent;
use crate::types::TimerType;

fn timer_name(ttype: TimerType) -> &'static str {
    match ttype {
        TimerType::QuietWhile => "authmgr_qwhile",
        TimerType::ReauthWhen => "authmgr_reauth_when",
        TimerType::MethodNoResp => "authmgr_method_no_resp",
    }
}

impl AuthMgr {
    /// Arms `ttype` for the client. The period comes from the port
    /// configuration; for reauthentication the server-supplied
    /// Session-Timeout wins when the port defers to it.
    pub(crate) fn timer_start(&self, key: LPortKey, ttype: TimerType) -> PacResult<()> {
        let port = key.phys_port();
        let period = {
            let st = self.rd()?;
            let pi = port_info(&st, port)?;
            let Some(lp) = st.registry.get(key) else {
                return Ok(());
            };
            match ttype {
                TimerType::QuietWhile => pi.quiet_period,
                TimerType::ReauthWhen => {
                    if pi.reauth_period_from_server && lp.client.session_timeout > 0 {
                        lp.client.session_timeout
                    } else {
                        pi.reauth_period
                    }
                }
                TimerType::MethodNoResp => pi.method_no_resp_period,
            }
        };

        // slot discipline before arming
        {
            let st = self.rd()?;
            let Some(lp) = st.registry.get(key) else {
                return Ok(());
            };
            match ttype {
                TimerType::MethodNoResp => {
                    if lp.timers.method_no_resp.is_some() {
                        return Ok(());
                    }
                }
                _ => {
                    if let Some((armed, _)) = lp.timers.general {
                        if armed == ttype {
                            return Ok(());
                        }
                    }
                }
            }
        }
        if !matches!(ttype, TimerType::MethodNoResp) {
            // a different type occupying the general slot gives way
            let occupied = {
                let st = self.rd()?;
                st.registry
                    .get(key)
                    .and_then(|lp| lp.timers.general.map(|(t, _)| t))
            };
            if let Some(old) = occupied {
                self.timer_destroy(key, old)?;
            }
        }

        let tx = self.tx.clone();
        let handle = self.timer.add(
            move |ctx| {
                let key = LPortKey(ctx as u32);
                let _ = tx.issue(
                    QueueClass::Normal,
                    AuthmgrEvent::ClientTimeout { key, timer: ttype },
                );
            },
            key.0 as u64,
            period as u64,
            timer_name(ttype),
        )?;

        let mut st = self.wr()?;
        if let Some(lp) = st.registry.get_mut(key) {
            match ttype {
                TimerType::MethodNoResp => lp.timers.method_no_resp = Some(handle),
                _ => lp.timers.general = Some((ttype, handle)),
            }
        } else {
            drop(st);
            self.timer.delete(handle);
        }
        debug!(?key, ?ttype, period, "timer armed");
        Ok(())
    }

    /// Cancels `ttype` if armed; unknown or mismatched slots are a
    /// no-op.
    pub(crate) fn timer_destroy(&self, key: LPortKey, ttype: TimerType) -> PacResult<()> {
        let handle = {
            let mut st = self.wr()?;
            let Some(lp) = st.registry.get_mut(key) else {
                return Ok(());
            };
            match ttype {
                TimerType::MethodNoResp => lp.timers.method_no_resp.take(),
                _ => match lp.timers.general {
                    Some((armed, handle)) if armed == ttype => {
                        lp.timers.general = None;
                        Some(handle)
                    }
                    _ => None,
                },
            }
        };
        if let Some(handle) = handle {
            self.timer.delete(handle);
        }
        Ok(())
    }

    /// Applies a fired timer: records the expiry flag and lets the
    /// event generator advance the FSM.
    pub(crate) fn handle_client_timeout(&self, key: LPortKey, ttype: TimerType) -> PacResult<()> {
        {
            let mut st = self.wr()?;
            let Some(lp) = st.registry.get_mut(key) else {
                return Ok(());
            };
            match ttype {
                TimerType::QuietWhile => {
                    if let Some((TimerType::QuietWhile, _)) = lp.timers.general {
                        lp.timers.general = None;
                    }
                    lp.protocol.held_expired = true;
                }
                TimerType::ReauthWhen => {
                    if let Some((TimerType::ReauthWhen, _)) = lp.timers.general {
                        lp.timers.general = None;
                    }
                    lp.protocol.reauth = true;
                }
                TimerType::MethodNoResp => {
                    lp.timers.method_no_resp = None;
                    lp.protocol.auth_timeout = true;
                }
            }
        }
        debug!(?key, ?ttype, "timer expired");
        self.generate_events(key)
    }
}
