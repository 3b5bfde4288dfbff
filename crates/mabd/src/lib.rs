//! MAC Authentication Bypass daemon.
//!
//! mabd authenticates stations by their MAC address against a RADIUS
//! server. The Authentication Manager drives it through the
//! method-plugin surface; mabd owns the RADIUS transaction: username
//! synthesis, Access-Request construction (EAP-MD5, CHAP or PAP
//! variants), challenge rounds, and mapping of server outcomes back
//! to method results.

pub mod auth;
pub mod control;
pub mod radius;
pub mod server;
pub mod types;

pub use control::{MabDaemon, MabEvent, MabState};
pub use radius::{
    AcceptAttrs, AccessRequest, ChallengeAttrs, RadiusCode, RadiusResponseMsg, RadiusTransport,
};
pub use types::{MabAuthType, MabClient, MabClientState, MabPortCfg};
