//! Common infrastructure for the PAC daemons.
//!
//! This crate provides the substrate shared by authmgrd and mabd:
//!
//! - [`error`]: the closed PAC error taxonomy
//! - [`mask`]: 1-based fixed-width bitsets over interface and VLAN IDs
//! - [`rwlock`]: the writer-preferring lock guarding daemon state
//! - [`timer`]: the 1-second application timer wheel
//! - [`bus`]: typed event queues with VLAN-first priority drain
//! - [`types`]: MAC addresses, logical-port keys, mode enums
//! - [`nim`]: the Network Interface Manager contract
//! - [`plugin`]: the method-plugin capability surface
//!
//! # Architecture
//!
//! Each daemon runs a worker that blocks on its bus, takes the state
//! write lock per message, and releases it around every collaborator
//! callout. Timer callbacks and plugin results post events instead of
//! mutating state, so all mutation happens on the worker.

pub mod bus;
pub mod error;
pub mod mask;
pub mod nim;
pub mod plugin;
pub mod rwlock;
pub mod timer;
pub mod types;

// Re-export commonly used items at crate root
pub use bus::{event_bus, BusReceiver, BusSender, QueueClass};
pub use error::{PacError, PacResult};
pub use mask::{IntfMask, VlanMask, MAX_INTERFACE_COUNT};
pub use nim::{NimApi, StaticNim};
pub use plugin::{AuthEventSink, MethodEvent, MethodPlugin, MethodStatus};
pub use rwlock::{PacRwLock, Timeout};
pub use timer::{AppTimer, TimerHandle, APP_TMR_1SEC};
pub use types::{
    ClientAttrs, HostMode, LPortKey, LPortKind, MacAddr, Method, PaeCapability, PortControlMode,
    PortStatus, TerminationAction, VlanType,
};
