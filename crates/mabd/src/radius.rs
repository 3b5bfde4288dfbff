//! RADIUS collaborator contract and Access-Request construction.
//!
//! The wire codec lives in the external RADIUS client library; this
//! module owns the typed request the library encodes, the response
//! contract it decodes into, and the attribute-level processing of
//! Accept / Challenge payloads.

use std::net::IpAddr;

use pac_common::{MacAddr, NimApi, PacResult, TerminationAction};

use crate::auth;
use crate::types::{MabAuthType, MabClient};

/// RADIUS packet codes the callback can deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadiusCode {
    AccessAccept,
    AccessReject,
    AccessChallenge,
    /// The client library's synthetic code for a request that timed
    /// out against every server.
    Timeout,
    /// Transport-level failure talking to the server.
    CommFailure,
}

/// Service-Type: Login.
pub const SERVICE_TYPE_LOGIN: u32 = 1;
/// Service-Type: Administrative.
pub const SERVICE_TYPE_ADMIN: u32 = 6;
/// Service-Type: Call-Check, the canonical MAB value.
pub const SERVICE_TYPE_CALL_CHECK: u32 = 10;

/// Tunnel-Type value for VLAN.
pub const TUNNEL_TYPE_VLAN: u32 = 13;
/// Tunnel-Medium-Type value for IEEE-802.
pub const TUNNEL_MEDIUM_802: u32 = 6;

/// Termination-Action: re-run authentication at session expiry.
pub const TERMINATION_ACTION_RADIUS_REQUEST: u32 = 1;

/// Attributes parsed from an Access-Accept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcceptAttrs {
    pub session_timeout: Option<u32>,
    pub termination_action: Option<u32>,
    pub service_type: Option<u32>,
    pub state: Vec<u8>,
    pub class: Vec<u8>,
    pub tunnel_type: Option<u32>,
    pub tunnel_medium_type: Option<u32>,
    pub tunnel_private_group_id: Option<String>,
    pub filter_id: Option<String>,
    pub eap_message: Option<Vec<u8>>,
}

/// Attributes parsed from an Access-Challenge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChallengeAttrs {
    pub state: Vec<u8>,
    pub eap_message: Option<Vec<u8>>,
}

/// Decoded response message handed to the callback. Implemented by
/// the RADIUS client library; tests provide canned messages.
pub trait RadiusResponseMsg: Send {
    fn response_code(&self) -> RadiusCode;
    fn parse_access_accept(&self) -> PacResult<AcceptAttrs>;
    fn parse_access_challenge(&self) -> PacResult<ChallengeAttrs>;
}

/// A fully specified Access-Request for the client library to
/// encode and transmit. The `correlator` is the logical-port key;
/// it comes back verbatim with the response.
#[derive(Debug, Clone)]
pub struct AccessRequest {
    pub user_name: String,
    pub nas_port: u32,
    pub nas_port_id: String,
    pub nas_ip: Option<IpAddr>,
    pub nas_id: Option<String>,
    pub called_station_id: String,
    pub calling_station_id: String,
    pub mac: MacAddr,
    pub correlator: u32,
    /// Echo of the server State attribute across challenge rounds.
    pub state: Vec<u8>,
    pub request_authenticator: [u8; 16],
    pub eap_message: Option<Vec<u8>>,
    pub chap_password: Option<Vec<u8>>,
    pub chap_challenge: Option<Vec<u8>>,
    /// RFC 2865 §5.2 obfuscated User-Password (PAP variant).
    pub user_password: Option<Vec<u8>>,
}

/// Transport half of the RADIUS collaborator: the daemon hands it
/// requests, responses come back through the registered callback
/// path as bus events.
pub trait RadiusTransport: Send + Sync {
    fn access_request_send(&self, req: AccessRequest) -> PacResult<()>;
}

/// Builds the Access-Request for a client, attribute for attribute.
pub fn build_access_request(
    nim: &dyn NimApi,
    client: &MabClient,
    port: u32,
    nas_ip: Option<IpAddr>,
    nas_id: Option<&str>,
    shared_secret: &str,
    eap_override: Option<Vec<u8>>,
) -> PacResult<AccessRequest> {
    let ifindex = nim.intf_ifindex(port)?;
    let alias = nim.intf_name(port)?;
    let switch_mac = nim.intf_mac(port)?;

    let mut authenticator = [0u8; 16];
    authenticator.copy_from_slice(&auth::challenge_generate(16));

    let mut req = AccessRequest {
        user_name: client.user_name.clone(),
        nas_port: ifindex,
        nas_port_id: alias,
        nas_ip,
        nas_id: nas_id.map(str::to_owned),
        called_station_id: switch_mac.to_colon_string_upper(),
        calling_station_id: client.mac.to_dashed_string(),
        mac: client.mac,
        correlator: client.key.0,
        state: client.server_state.clone(),
        request_authenticator: authenticator,
        eap_message: None,
        chap_password: None,
        chap_challenge: None,
        user_password: None,
    };

    match client.auth_type {
        MabAuthType::EapMd5 => {
            req.eap_message = Some(eap_override.unwrap_or_else(|| {
                auth::eap_identity_response(client.current_id, &client.user_name)
            }));
        }
        MabAuthType::Chap => {
            req.chap_password = Some(auth::chap_password(
                client.current_id,
                &client.user_name,
                &client.challenge,
            ));
            req.chap_challenge = Some(client.challenge.clone());
        }
        MabAuthType::Pap => {
            req.user_password = Some(auth::pap_password_obfuscate(
                shared_secret,
                &authenticator,
                &client.user_name,
            ));
        }
    }
    Ok(req)
}

/// Whether an Accept's Service-Type admits network access. A missing
/// attribute defaults to Login.
pub fn service_type_acceptable(service_type: Option<u32>) -> bool {
    matches!(
        service_type.unwrap_or(SERVICE_TYPE_LOGIN),
        SERVICE_TYPE_LOGIN | SERVICE_TYPE_ADMIN | SERVICE_TYPE_CALL_CHECK
    )
}

/// Extracts the assigned VLAN from the tunnel attribute trio.
/// Returns `Ok(None)` when no VLAN was assigned, `Err(())` when the
/// trio is present but malformed or out of range.
pub fn tunnel_vlan_extract(attrs: &AcceptAttrs) -> Result<Option<u16>, ()> {
    let Some(group) = attrs.tunnel_private_group_id.as_deref() else {
        return Ok(None);
    };
    if attrs.tunnel_type != Some(TUNNEL_TYPE_VLAN)
        || attrs.tunnel_medium_type != Some(TUNNEL_MEDIUM_802)
    {
        return Err(());
    }
    let vlan: u16 = group.trim().parse().map_err(|_| ())?;
    if !(1..=4094).contains(&vlan) {
        return Err(());
    }
    Ok(Some(vlan))
}

/// Maps a Termination-Action attribute value.
pub fn termination_action_map(value: Option<u32>) -> Option<TerminationAction> {
    value.map(|v| {
        if v == TERMINATION_ACTION_RADIUS_REQUEST {
            TerminationAction::Reauthenticate
        } else {
            TerminationAction::Default
        }
    })
}

/// Canned responses and a recording transport. Backs the unit and
/// scenario suites; the real transport lives in the RADIUS client
/// library.
pub mod test_support {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use pac_common::{PacError, PacResult, QueueClass};

    use super::{
        AcceptAttrs, AccessRequest, ChallengeAttrs, RadiusCode, RadiusResponseMsg,
        RadiusTransport, SERVICE_TYPE_CALL_CHECK, TERMINATION_ACTION_RADIUS_REQUEST,
        TUNNEL_MEDIUM_802, TUNNEL_TYPE_VLAN,
    };
    use crate::auth;
    use crate::control::MabEvent;

    /// A pre-built response message.
    #[derive(Debug, Clone)]
    pub struct CannedResponse {
        code: RadiusCode,
        accept: AcceptAttrs,
        challenge: ChallengeAttrs,
    }

    impl CannedResponse {
        /// Accept with Service-Type=Call-Check, optional tunnel VLAN
        /// and Session-Timeout (with Termination-Action
        /// RADIUS-Request).
        pub fn accept_call_check(vlan: Option<u16>, session_timeout: Option<u32>) -> Self {
            let mut accept = AcceptAttrs {
                service_type: Some(SERVICE_TYPE_CALL_CHECK),
                session_timeout,
                ..Default::default()
            };
            if session_timeout.is_some() {
                accept.termination_action = Some(TERMINATION_ACTION_RADIUS_REQUEST);
            }
            if let Some(v) = vlan {
                accept.tunnel_type = Some(TUNNEL_TYPE_VLAN);
                accept.tunnel_medium_type = Some(TUNNEL_MEDIUM_802);
                accept.tunnel_private_group_id = Some(v.to_string());
            }
            Self {
                code: RadiusCode::AccessAccept,
                accept,
                challenge: ChallengeAttrs::default(),
            }
        }

        /// Accept carrying an arbitrary Service-Type.
        pub fn accept_with_service_type(service_type: u32) -> Self {
            Self {
                code: RadiusCode::AccessAccept,
                accept: AcceptAttrs {
                    service_type: Some(service_type),
                    ..Default::default()
                },
                challenge: ChallengeAttrs::default(),
            }
        }

        pub fn reject() -> Self {
            Self {
                code: RadiusCode::AccessReject,
                accept: AcceptAttrs::default(),
                challenge: ChallengeAttrs::default(),
            }
        }

        pub fn timeout() -> Self {
            Self {
                code: RadiusCode::Timeout,
                accept: AcceptAttrs::default(),
                challenge: ChallengeAttrs::default(),
            }
        }

        /// Access-Challenge carrying an EAP-Request/MD5-Challenge and
        /// a State attribute.
        pub fn md5_challenge(id: u8, challenge: &[u8], state: &[u8]) -> Self {
            let mut eap = vec![
                auth::EAP_CODE_REQUEST,
                id,
                0,
                0,
                auth::EAP_TYPE_MD5,
                challenge.len() as u8,
            ];
            eap.extend_from_slice(challenge);
            let total = eap.len() as u16;
            eap[2..4].copy_from_slice(&total.to_be_bytes());
            Self {
                code: RadiusCode::AccessChallenge,
                accept: AcceptAttrs::default(),
                challenge: ChallengeAttrs {
                    state: state.to_vec(),
                    eap_message: Some(eap),
                },
            }
        }
    }

    impl RadiusResponseMsg for CannedResponse {
        fn response_code(&self) -> RadiusCode {
            self.code
        }

        fn parse_access_accept(&self) -> PacResult<AcceptAttrs> {
            if self.code == RadiusCode::AccessAccept {
                Ok(self.accept.clone())
            } else {
                Err(PacError::failure("not an accept"))
            }
        }

        fn parse_access_challenge(&self) -> PacResult<ChallengeAttrs> {
            if self.code == RadiusCode::AccessChallenge {
                Ok(self.challenge.clone())
            } else {
                Err(PacError::failure("not a challenge"))
            }
        }
    }

    /// Records requests; answers each with the next queued canned
    /// response via the daemon's bus, like the real callback path.
    pub struct MockRadius {
        requests: Mutex<Vec<AccessRequest>>,
        responses: Mutex<VecDeque<CannedResponse>>,
        tx: Mutex<Option<pac_common::BusSender<MabEvent>>>,
        fail_send: Mutex<bool>,
    }

    impl MockRadius {
        pub fn new() -> Self {
            Self {
                requests: Mutex::new(Vec::new()),
                responses: Mutex::new(VecDeque::new()),
                tx: Mutex::new(None),
                fail_send: Mutex::new(false),
            }
        }

        /// Connects the response path to the daemon's bus.
        pub fn attach(&self, tx: pac_common::BusSender<MabEvent>) {
            *self.tx.lock().unwrap() = Some(tx);
        }

        /// Queues the response for the next Access-Request.
        pub fn push_response(&self, resp: CannedResponse) {
            self.responses.lock().unwrap().push_back(resp);
        }

        /// Makes subsequent sends fail at the transport.
        pub fn fail_sends(&self, fail: bool) {
            *self.fail_send.lock().unwrap() = fail;
        }

        /// Requests captured so far.
        pub fn requests(&self) -> Vec<AccessRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl Default for MockRadius {
        fn default() -> Self {
            Self::new()
        }
    }

    impl RadiusTransport for MockRadius {
        fn access_request_send(&self, req: AccessRequest) -> PacResult<()> {
            if *self.fail_send.lock().unwrap() {
                return Err(PacError::failure("transport down"));
            }
            let correlator = req.correlator;
            self.requests.lock().unwrap().push(req);
            if let Some(resp) = self.responses.lock().unwrap().pop_front() {
                if let Some(tx) = self.tx.lock().unwrap().as_ref() {
                    let _ = tx.issue(
                        QueueClass::Normal,
                        MabEvent::AaaResponse {
                            correlator,
                            msg: Box::new(resp),
                        },
                    );
                }
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pac_common::{LPortKey, LPortKind, StaticNim};

    fn client() -> MabClient {
        let key = LPortKey::pack(2, 0, LPortKind::Logical);
        MabClient::new(key, MacAddr([0xaa, 0xbb, 0xcc, 0, 0, 0x01]), MabAuthType::EapMd5)
    }

    #[test]
    fn test_request_attributes() {
        let nim = StaticNim::new(4);
        let req =
            build_access_request(&nim, &client(), 2, None, Some("switch-1"), "secret", None)
                .unwrap();
        assert_eq!(req.user_name, "AABBCC000001");
        assert_eq!(req.nas_port, 1002);
        assert_eq!(req.nas_port_id, "Ethernet2");
        assert_eq!(req.nas_id.as_deref(), Some("switch-1"));
        assert_eq!(req.called_station_id, "00:A0:C8:00:00:01");
        assert_eq!(req.calling_station_id, "AA-BB-CC-00-00-01");
        assert_eq!(req.correlator, client().key.0);
        // EAP-MD5 variant carries a Response/Identity
        let eap = req.eap_message.unwrap();
        assert_eq!(eap[0], auth::EAP_CODE_RESPONSE);
        assert_eq!(eap[4], auth::EAP_TYPE_IDENTITY);
        assert!(req.chap_password.is_none());
        assert!(req.user_password.is_none());
    }

    #[test]
    fn test_chap_variant_attaches_pair() {
        let nim = StaticNim::new(4);
        let mut c = client();
        c.auth_type = MabAuthType::Chap;
        c.challenge = auth::challenge_generate(auth::CHALLENGE_LEN);
        c.current_id = 3;
        let req = build_access_request(&nim, &c, 2, None, None, "secret", None).unwrap();
        let pw = req.chap_password.unwrap();
        assert_eq!(pw.len(), 1 + auth::MD5_LEN);
        assert_eq!(pw[0], 3);
        assert_eq!(req.chap_challenge.unwrap(), c.challenge);
        assert!(req.eap_message.is_none());
    }

    #[test]
    fn test_pap_variant_obfuscates_password() {
        let nim = StaticNim::new(4);
        let mut c = client();
        c.auth_type = MabAuthType::Pap;
        let req = build_access_request(&nim, &c, 2, None, None, "secret", None).unwrap();
        let pw = req.user_password.unwrap();
        assert_eq!(pw.len() % 16, 0);
        assert_ne!(&pw[..12], c.user_name.as_bytes());
    }

    #[test]
    fn test_service_type_gate() {
        assert!(service_type_acceptable(None));
        assert!(service_type_acceptable(Some(SERVICE_TYPE_LOGIN)));
        assert!(service_type_acceptable(Some(SERVICE_TYPE_ADMIN)));
        assert!(service_type_acceptable(Some(SERVICE_TYPE_CALL_CHECK)));
        assert!(!service_type_acceptable(Some(2)));
    }

    #[test]
    fn test_tunnel_vlan_extract() {
        let mut attrs = AcceptAttrs::default();
        assert_eq!(tunnel_vlan_extract(&attrs), Ok(None));

        attrs.tunnel_private_group_id = Some("99".into());
        attrs.tunnel_type = Some(TUNNEL_TYPE_VLAN);
        attrs.tunnel_medium_type = Some(TUNNEL_MEDIUM_802);
        assert_eq!(tunnel_vlan_extract(&attrs), Ok(Some(99)));

        attrs.tunnel_medium_type = Some(1);
        assert_eq!(tunnel_vlan_extract(&attrs), Err(()));

        attrs.tunnel_medium_type = Some(TUNNEL_MEDIUM_802);
        attrs.tunnel_private_group_id = Some("4095".into());
        assert_eq!(tunnel_vlan_extract(&attrs), Err(()));

        attrs.tunnel_private_group_id = Some("guests".into());
        assert_eq!(tunnel_vlan_extract(&attrs), Err(()));
    }

    #[test]
    fn test_termination_action_map() {
        assert_eq!(termination_action_map(None), None);
        assert_eq!(
            termination_action_map(Some(TERMINATION_ACTION_RADIUS_REQUEST)),
            Some(TerminationAction::Reauthenticate)
        );
        assert_eq!(
            termination_action_map(Some(0)),
            Some(TerminationAction::Default)
        );
    }
}
