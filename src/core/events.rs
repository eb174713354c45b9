use std::collections::BTreeMap;

pub use super::diagnostics::Severity;

/// A structured, observable progress transition emitted by the engine.
///
/// Mirrors the teacher's event/reporter split: callers implement [`super::reporter::Reporter`]
/// to receive these instead of passing closures through every pollable method.
#[derive(Debug, Clone)]
pub enum Event {
    /// A free-form informational message, for transitions with no dedicated variant.
    Message { severity: Severity, text: String },
    /// A service's lifecycle state advanced.
    ServiceStateChanged {
        service: String,
        from: ServiceState,
        to: ServiceState,
    },
    /// A cloud instance was requested.
    InstanceRequested { service: String, image: String },
    /// A cloud instance reached the running state with a public hostname.
    InstanceRunning {
        service: String,
        instance_id: String,
        hostname: String,
    },
    /// A cloud instance was observed as terminated.
    InstanceTerminated {
        service: String,
        instance_id: String,
    },
    /// A TCP port became reachable.
    PortReachable {
        service: String,
        host: String,
        port: u16,
    },
    /// An external program ran to completion inside or against a VM.
    ProgramCompleted {
        service: String,
        kind: ProgramKind,
        exit_code: i32,
    },
    /// An external program is being retried after a failed attempt.
    ProgramRetried {
        service: String,
        kind: ProgramKind,
        attempts_remaining: u32,
    },
    /// A pollable exceeded its wall-clock timeout.
    PollableTimedOut { service: String, pollable: String },
    /// A service is restarting after a mid-run error.
    ServiceRestarting { service: String, attempt: u32 },
    /// A level of the top-level multi-level pollable started.
    LevelStarted {
        level_index: usize,
        services: Vec<String>,
    },
    /// A level of the top-level multi-level pollable finished.
    LevelCompleted { level_index: usize },
    /// The boot program's exported attributes were merged into a service's attribute bag.
    AttributesExported {
        service: String,
        attrs: BTreeMap<String, String>,
    },
}

impl Event {
    /// Short, human-readable rendering used by the CLI's line-oriented progress output.
    pub fn describe(&self) -> String {
        match self {
            Event::Message { text, .. } => text.clone(),
            Event::ServiceStateChanged { service, from, to } => {
                format!("{service}: {} -> {}", from.as_str(), to.as_str())
            }
            Event::InstanceRequested { service, image } => {
                format!("{service}: requested instance from image {image}")
            }
            Event::InstanceRunning {
                service,
                instance_id,
                hostname,
            } => format!("{service}: instance {instance_id} running at {hostname}"),
            Event::InstanceTerminated {
                service,
                instance_id,
            } => format!("{service}: instance {instance_id} terminated"),
            Event::PortReachable {
                service,
                host,
                port,
            } => format!("{service}: {host}:{port} reachable"),
            Event::ProgramCompleted {
                service,
                kind,
                exit_code,
            } => format!("{service}: {} exited {exit_code}", kind.as_str()),
            Event::ProgramRetried {
                service,
                kind,
                attempts_remaining,
            } => format!(
                "{service}: {} failed, {attempts_remaining} retries remaining",
                kind.as_str()
            ),
            Event::PollableTimedOut { service, pollable } => {
                format!("{service}: {pollable} timed out")
            }
            Event::ServiceRestarting { service, attempt } => {
                format!("{service}: restarting (attempt {attempt})")
            }
            Event::LevelStarted {
                level_index,
                services,
            } => format!("level {level_index} started: {}", services.join(", ")),
            Event::LevelCompleted { level_index } => format!("level {level_index} completed"),
            Event::AttributesExported { service, attrs } => {
                format!("{service}: exported {} attribute(s)", attrs.len())
            }
        }
    }
}

pub use super::service::ServiceState;

/// Which kind of user-supplied program a [`Event::ProgramCompleted`]/[`Event::ProgramRetried`]
/// refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramKind {
    Terminate,
    Boot,
    Ready,
    SshLiveness,
}

impl ProgramKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProgramKind::Terminate => "terminate program",
            ProgramKind::Boot => "boot program",
            ProgramKind::Ready => "ready program",
            ProgramKind::SshLiveness => "ssh liveness probe",
        }
    }
}
