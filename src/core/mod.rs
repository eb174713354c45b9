//! Core orchestration library: the polling-based engine plus the IaaS and
//! persistence abstraction boundaries it is built on.

pub mod attrs;
pub mod boot_top_level;
pub mod diagnostics;
pub mod events;
pub mod iaas;
pub mod iaas_pollable;
pub mod multilevel;
pub mod persistence;
pub mod pollable;
pub mod port_pollable;
pub mod process_pollable;
pub mod remote;
pub mod reporter;
pub mod service;

pub use attrs::{AttrBag, DependencyResolver};
pub use boot_top_level::BootTopLevel;
pub use diagnostics::{Diagnostic, Severity};
pub use events::{Event, ProgramKind};
pub use iaas::{IaasConnection, Instance, InstanceSnapshot, InstanceState, RunInstanceRequest};
pub use iaas_pollable::{LaunchHostnamePollable, TerminatePollable};
pub use multilevel::{Member, MultiLevelPollable};
pub use persistence::{JsonFileStore, PersistenceStore};
pub use pollable::{PollOutcome, Pollable};
pub use port_pollable::PortPollable;
pub use process_pollable::{ProcessOutput, ProcessPollable};
pub use reporter::Reporter;
pub use service::{ServiceContainer, ServiceRecord, ServiceState, ServiceTable};
