//! authmgrd daemon entry point.
//!
//! Wires the orchestrator to its collaborators, spawns the worker
//! and timer-tick tasks, and runs the status server.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use authmgrd::cfg::{RecordingPacCfg, StaticNim};
use authmgrd::AuthMgr;

/// Status server bind address.
const STATUS_ADDR: &str = "127.0.0.1:8513";

fn init_logging() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    info!("--- Starting authmgrd ---");

    // The production build binds the platform's configuration agent
    // and interface manager here; the in-tree doubles let the daemon
    // come up stand-alone.
    let cfg = Arc::new(RecordingPacCfg::new());
    let nim = Arc::new(StaticNim::new(64));

    let (mgr, rx) = AuthMgr::new(cfg, nim);

    if let Err(e) = mgr.admin_mode_set(true) {
        error!(error = %e, "failed to enable");
        return ExitCode::FAILURE;
    }

    // worker: one message per wake, VLAN notifications first
    let worker_mgr = Arc::clone(&mgr);
    tokio::spawn(async move {
        while let Some(ev) = rx.recv().await {
            if let Err(e) = worker_mgr.dispatch(ev) {
                warn!(error = %e, "event handler failed");
            }
        }
    });

    // timer tick
    let tick_mgr = Arc::clone(&mgr);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            let _ = tick_mgr.time_tick_issue();
        }
    });

    let listener = match TcpListener::bind(STATUS_ADDR).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, addr = STATUS_ADDR, "cannot bind status server");
            return ExitCode::FAILURE;
        }
    };
    match authmgrd::server::serve(mgr, listener).await {
        Ok(()) => {
            info!("authmgrd exiting normally");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "authmgrd error");
            ExitCode::FAILURE
        }
    }
}
