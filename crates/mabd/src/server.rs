//! MAB status server: JSON lines over TCP with a bounded connection
//! pool.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use pac_common::{MacAddr, PacResult};

use crate::control::MabDaemon;
use crate::types::MabClientState;

/// Connection pool bound.
pub const MAX_CONNECTIONS: usize = 1024;

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MabRequest {
    /// State of one client by MAC.
    ClientStatus { mac: [u8; 6] },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MabResponse {
    ClientStatus {
        mac: String,
        state: String,
        user_name: String,
    },
    Error {
        message: String,
    },
}

fn answer(daemon: &MabDaemon, req: MabRequest) -> MabResponse {
    match req {
        MabRequest::ClientStatus { mac } => {
            let mac = MacAddr(mac);
            match daemon.client_snapshot(mac) {
                Some(client) => MabResponse::ClientStatus {
                    mac: mac.to_string(),
                    state: match client.state {
                        MabClientState::Idle => "idle".into(),
                        MabClientState::Authenticating => "authenticating".into(),
                        MabClientState::Authenticated => "authenticated".into(),
                    },
                    user_name: client.user_name,
                },
                None => MabResponse::Error {
                    message: format!("client {} not found", mac),
                },
            }
        }
    }
}

/// Accept loop with a bounded pool; one task per connection.
pub async fn serve(daemon: Arc<MabDaemon>, listener: TcpListener) -> PacResult<()> {
    info!(addr = ?listener.local_addr().ok(), "mab status server listening");
    let pool = Arc::new(Semaphore::new(MAX_CONNECTIONS));
    loop {
        let permit = match Arc::clone(&pool).acquire_owned().await {
            Ok(p) => p,
            Err(_) => return Ok(()),
        };
        let (stream, peer) = match listener.accept().await {
            Ok(x) => x,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        debug!(?peer, "mab status connection");
        let daemon = Arc::clone(&daemon);
        tokio::spawn(async move {
            let _permit = permit;
            let (rd, mut wr) = stream.into_split();
            let mut lines = BufReader::new(rd).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let resp = match serde_json::from_str::<MabRequest>(&line) {
                    Ok(req) => answer(&daemon, req),
                    Err(e) => MabResponse::Error {
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

    #[test]
    fn test_request_parse() {
        let req: MabRequest =
            serde_json::from_str(r#"{"op":"client_status","mac":[0,17,34,51,68,85]}"#).unwrap();
        let MabRequest::ClientStatus { mac } = req;
        assert_eq!(mac, [0, 17, 34, 51, 68, 85]);
    }
}
