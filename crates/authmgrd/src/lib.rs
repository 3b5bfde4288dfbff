//! Port Access Control authentication manager.
//!
//! authmgrd arbitrates which authentication method (802.1X or MAB)
//! owns each client on each switch port, drives the per-client state
//! machine, and programs the resulting authorization into the
//! dataplane through the Platform Configuration collaborator.
//!
//! # Architecture
//!
//! 1. Method plugins report clients and results onto the event bus
//! 2. The worker drains the bus (VLAN notifications first) and runs
//!    each handler under the state write lock
//! 3. Collaborator callouts happen with the lock released
//! 4. Timer expiries post events; nothing mutates state off-worker

pub mod cfg;
pub mod client;
pub mod control;
pub mod event;
pub mod mac_index;
pub mod registry;
pub mod server;
pub mod sm;
pub mod timers;
pub mod types;
pub mod vlan_cache;

pub use cfg::{NimApi, PacCfg, RecordingPacCfg, StaticNim};
pub use control::{AuthMgr, MgrState};
pub use event::{AuthmgrEvent, IntfEvent, StartupPhase};
pub use types::{AuthState, LogicalPort, PortInfo, SmEvent, TimerType, MAX_USERS_PER_PORT};
pub use vlan_cache::{VlanCache, VlanDbKind, VlanStatus};
