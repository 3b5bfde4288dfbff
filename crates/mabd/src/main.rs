//! mabd daemon entry point.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use mabd::radius::test_support::MockRadius;
use mabd::MabDaemon;
use pac_common::plugin::AuthEventSink;
use pac_common::{MacAddr, Method, MethodStatus, StaticNim};

/// Status server bind address.
const STATUS_ADDR: &str = "127.0.0.1:8514";

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

/// Stand-alone sink: without the orchestrator attached, results are
/// only logged.
struct LogSink;

impl AuthEventSink for LogSink {
    fn method_result(&self, port: u32, mac: MacAddr, _method: Method, status: MethodStatus) {
        info!(port, %mac, ?status, "method result");
    }

    fn client_seen(&self, port: u32, mac: MacAddr, _method: Method, _vlan: Option<u16>) {
        info!(port, %mac, "client seen");
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    info!("--- Starting mabd ---");

    // The production build connects the RADIUS client library over
    // its socket pair and the orchestrator's sink; the in-tree
    // doubles let the daemon come up stand-alone.
    let nim = Arc::new(StaticNim::new(64));
    let transport = Arc::new(MockRadius::new());
    let sink = Arc::new(LogSink);

    let (daemon, rx) = MabDaemon::new(nim, transport.clone(), sink);
    transport.attach(daemon.sender());

    let worker = Arc::clone(&daemon);
    tokio::spawn(async move {
        while let Some(ev) = rx.recv().await {
            if let Err(e) = worker.dispatch(ev) {
                warn!(error = %e, "event handler failed");
            }
        }
    });

    let tick_tx = daemon.sender();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            let _ = tick_tx.issue(pac_common::QueueClass::Normal, mabd::MabEvent::TimeTick);
        }
    });

    let listener = match TcpListener::bind(STATUS_ADDR).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, addr = STATUS_ADDR, "cannot bind status server");
            return ExitCode::FAILURE;
        }
    };
    match mabd::server::serve(daemon, listener).await {
        Ok(()) => {
            info!("mabd exiting normally");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "mabd error");
            ExitCode::FAILURE
        }
    }
}
