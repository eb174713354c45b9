//! Shared helpers for the CLI command handlers: plan loading, diagnostic
//! rendering, and a line-oriented [`Reporter`] that prints events as the
//! engine drives.

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;

use crate::core::diagnostics::{Diagnostic, Severity};
use crate::core::events::Event;
use crate::core::persistence::{JsonFileStore, PersistenceStore};
use crate::core::pollable::PollOutcome;
use crate::core::reporter::Reporter;
use crate::core::service::ServiceRecord;
use crate::core::{BootTopLevel, Pollable};
use crate::{load_plan, Error, Plan, Result};

/// Prints every [`Diagnostic`] to stderr/stdout depending on severity.
pub fn emit_diagnostics(diagnostics: &[Diagnostic]) {
    for diagnostic in diagnostics {
        match diagnostic.severity {
            Severity::Warning => {
                eprintln!("warning: {}", diagnostic.message);
                if let Some(help) = &diagnostic.help {
                    eprintln!("         {help}");
                }
            }
            Severity::Info => println!("{}", diagnostic.message),
            Severity::Error => eprintln!("error: {}", diagnostic.message),
        }
    }
}

/// A [`Reporter`] that prints each event's `describe()` rendering, one per
/// line, as the boot top-level drives.
pub struct PrintReporter;

impl Reporter for PrintReporter {
    fn report(&mut self, event: Event) {
        println!("{}", event.describe());
    }
}

/// Loads the plan at `path`, reporting its diagnostics, and returns it
/// together with the persistence store derived from its path.
pub fn load_plan_and_store(path: &Path) -> Result<(Plan, Rc<RefCell<JsonFileStore>>)> {
    let (plan, diagnostics) = load_plan(path)?;
    emit_diagnostics(&diagnostics);
    let store = Rc::new(RefCell::new(JsonFileStore::for_plan(path)));
    Ok((plan, store))
}

/// Builds a [`BootTopLevel`] from a loaded plan, registering every service
/// and level in document order, restoring any previously persisted state and
/// optionally filtering to a subset of level names.
pub fn build_top_level(
    plan: &Plan,
    persistence: Rc<RefCell<dyn PersistenceStore>>,
    restart_policy: Option<Rc<dyn Fn(&Error) -> bool>>,
    only_levels: &[String],
) -> Result<BootTopLevel> {
    let persisted = persistence.borrow().load()?;
    let mut top = BootTopLevel::new(persistence, restart_policy);

    for level in &plan.levels {
        if !only_levels.is_empty() && !only_levels.contains(&level.name) {
            continue;
        }
        let mut names = Vec::with_capacity(level.services.len());
        for service in &level.services {
            let record = merge_persisted(service.clone(), persisted.get(&service.name));
            names.push(record.name.clone());
            top.new_service(record)?;
        }
        top.add_level(names)?;
    }
    Ok(top)
}

fn merge_persisted(mut record: ServiceRecord, persisted: Option<&ServiceRecord>) -> ServiceRecord {
    if let Some(previous) = persisted {
        record.hostname = previous.hostname.clone();
        record.instance_id = previous.instance_id.clone();
        record.state = previous.state;
        record.exported = previous.exported.clone();
        record.history = previous.history.clone();
    }
    record
}

/// Default restart policy: always request a restart, bounded by the service
/// container's own restart-limit accounting.
pub fn default_restart_policy() -> Rc<dyn Fn(&Error) -> bool> {
    Rc::new(|_err: &Error| true)
}

/// Drives `top` to completion, printing one line per event after each poll
/// round, pacing with the ambient sleep interval.
pub fn drive_to_completion(top: &mut BootTopLevel, reporter: &mut dyn Reporter) -> Result<()> {
    top.start()?;
    loop {
        let outcome = top.poll();
        for event in top.drain_events() {
            reporter.report(event);
        }
        match outcome? {
            PollOutcome::Done => return Ok(()),
            PollOutcome::NotDone => {
                std::thread::sleep(std::time::Duration::from_millis(500));
            }
        }
    }
}
