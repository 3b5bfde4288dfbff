//! The orchestrator's event union and queue classification.

use pac_common::{
    HostMode, LPortKey, MacAddr, Method, MethodStatus, PaeCapability, PortControlMode, QueueClass,
};

use crate::types::TimerType;

/// Interface state transitions delivered by NIM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntfEvent {
    Up,
    Down,
    Attach,
    Detach,
}

/// Interface bring-up phases during system start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupPhase {
    /// Interface object exists; default state is built.
    Create,
    /// Interface is attached and configuration applies.
    Activate,
}

/// Every event the AuthMgr worker consumes. Each carries the
/// physical port it concerns (or a logical-port key where the client
/// is already known).
#[derive(Debug)]
pub enum AuthmgrEvent {
    /// A method plugin's enable status changed; rebuild the enabled
    /// arrays everywhere.
    MethodEnableChange { method: Method },
    AdminModeSet { enable: bool },
    PortControlModeSet { port: u32, mode: PortControlMode },
    HostModeSet { port: u32, mode: HostMode },
    PortInitialize { port: u32 },
    PortReauthenticate { port: u32 },
    QuietPeriodSet { port: u32, secs: u32 },
    ReauthPeriodSet { port: u32, secs: u32, from_server: bool },
    ReauthEnabledSet { port: u32, enabled: bool },
    MaxUsersSet { port: u32, count: u32 },
    PaeCapabilitiesSet { port: u32, cap: PaeCapability },
    ViolationModeSet { port: u32, enabled: bool },
    /// Terminal (or failure-mode) result from a method plugin.
    MethodResult {
        port: u32,
        mac: MacAddr,
        method: Method,
        status: MethodStatus,
    },
    /// A method saw a new client; delivered in bulk by the dataplane.
    ClientSeen {
        port: u32,
        mac: MacAddr,
        method: Method,
        vlan: Option<u16>,
    },
    /// A per-client timer fired.
    ClientTimeout { key: LPortKey, timer: TimerType },
    ClientCleanup { key: LPortKey },
    /// One-second tick driving the timer wheel.
    TimeTick,
    IntfChange { port: u32, event: IntfEvent },
    IntfStartup { port: u32, phase: StartupPhase },
    VlanAdd { vlan: u16 },
    VlanDelete { vlan: u16 },
    VlanPortAdd { vlan: u16, port: u32, tagged: bool },
    VlanPortDelete { vlan: u16, port: u32 },
    VlanPvidChange { port: u32, pvid: u16 },
}

impl AuthmgrEvent {
    /// Which queue the event is issued on. VLAN notifications must be
    /// observed before any client event that depends on them; bulk
    /// address callbacks must never starve either.
    pub fn queue_class(&self) -> QueueClass {
        match self {
            AuthmgrEvent::VlanAdd { .. }
            | AuthmgrEvent::VlanDelete { .. }
            | AuthmgrEvent::VlanPortAdd { .. }
            | AuthmgrEvent::VlanPortDelete { .. }
            | AuthmgrEvent::VlanPvidChange { .. } => QueueClass::Vlan,
            AuthmgrEvent::ClientSeen { .. } => QueueClass::Bulk,
            _ => QueueClass::Normal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_classification() {
        assert_eq!(
            AuthmgrEvent::VlanAdd { vlan: 5 }.queue_class(),
            QueueClass::Vlan
        );
        assert_eq!(
            AuthmgrEvent::ClientSeen {
                port: 1,
                mac: MacAddr::ZERO,
                method: Method::Mab,
                vlan: None
            }
            .queue_class(),
            QueueClass::Bulk
        );
        assert_eq!(AuthmgrEvent::TimeTick.queue_class(), QueueClass::Normal);
        assert_eq!(
            AuthmgrEvent::AdminModeSet { enable: true }.queue_class(),
            QueueClass::Normal
        );
    }
}
