//! JSON-lines status server.
//!
//! External consumers (CLI, platform) connect over TCP and send one
//! request object per line; the server answers with one response
//! object per line. It never touches manager state directly beyond
//! the read-only query surface.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use pac_common::PacResult;

use crate::control::AuthMgr;

/// One status request.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StatusRequest {
    /// Per-port configuration and counters.
    PortStatus { port: u32 },
    /// Clients currently tracked on a port.
    PortClients { port: u32 },
}

/// One status response line.
#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusResponse {
    PortStatus {
        port: u32,
        enabled: bool,
        num_users: u32,
        auth_count: u32,
        control_mode: String,
        host_mode: String,
    },
    PortClients {
        port: u32,
        clients: Vec<ClientStatus>,
    },
    Error {
        message: String,
    },
}

/// Client summary on the status surface.
#[derive(Debug, Serialize)]
pub struct ClientStatus {
    pub mac: String,
    pub state: String,
    pub vlan: u16,
    pub method: Option<String>,
    pub user_name: String,
}

fn answer(mgr: &AuthMgr, req: StatusRequest) -> StatusResponse {
    match req {
        StatusRequest::PortStatus { port } => match mgr.port_snapshot(port) {
            Some(pi) => StatusResponse::PortStatus {
                port,
                enabled: pi.port_enabled,
                num_users: pi.num_users,
                auth_count: pi.auth_count,
                control_mode: format!("{:?}", pi.port_control_mode),
                host_mode: format!("{:?}", pi.host_mode),
            },
            None => StatusResponse::Error {
                message: format!("interface {} not found", port),
            },
        },
        StatusRequest::PortClients { port } => {
            let clients = mgr
                .clients_on_port(port)
                .into_iter()
                .map(|lp| ClientStatus {
                    mac: lp.client.mac.to_string(),
                    state: format!("{:?}", lp.protocol.auth_state),
                    vlan: lp.client.vlan_id,
                    method: lp.client.authenticated_method.map(|m| m.as_str().into()),
                    user_name: lp.client.user_name.clone(),
                })
                .collect();
            StatusResponse::PortClients { port, clients }
        }
    }
}

/// Accept loop; one task per connection.
pub async fn serve(mgr: Arc<AuthMgr>, listener: TcpListener) -> PacResult<()> {
    info!(addr = ?listener.local_addr().ok(), "status server listening");
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(x) => x,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        debug!(?peer, "status connection");
        let mgr = Arc::clone(&mgr);
        tokio::spawn(async move {
            let (rd, mut wr) = stream.into_split();
            let mut lines = BufReader::new(rd).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let resp = match serde_json::from_str::<StatusRequest>(&line) {
                    Ok(req) => answer(&mgr, req),
                    Err(e) => StatusResponse::Error {
                        message: format!("bad request: {}", e),
                    },
                };
                let mut out = serde_json::to_string(&resp).unwrap_or_default();
                out.push('\n');
                if wr.write_all(out.as_bytes()).await.is_err() {
                    break;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::{RecordingPacCfg, StaticNim};

    #[test]
    fn test_answer_unknown_port() {
        let cfg = Arc::new(RecordingPacCfg::new());
        let nim = Arc::new(StaticNim::new(2));
        let (mgr, _rx) = AuthMgr::new(cfg, nim);
        let resp = answer(&mgr, StatusRequest::PortStatus { port: 9 });
        assert!(matches!(resp, StatusResponse::Error { .. }));
    }

    #[test]
    fn test_request_parse() {
        let req: StatusRequest =
            serde_json::from_str(r#"{"op":"port_status","port":3}"#).unwrap();
        assert!(matches!(req, StatusRequest::PortStatus { port: 3 }));
    }
}
