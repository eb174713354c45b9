//! `cloudfleet up`: load a plan and drive its boot top-level forward.

use std::path::PathBuf;

use crate::app::common::{build_top_level, default_restart_policy, drive_to_completion, load_plan_and_store, PrintReporter};
use crate::core::persistence::PersistenceStore;
use crate::Result;

pub struct UpArgs {
    pub plan: PathBuf,
    pub levels: Vec<String>,
}

pub fn handle_up(args: UpArgs) -> Result<()> {
    let (plan, store) = load_plan_and_store(&args.plan)?;
    let persistence: std::rc::Rc<std::cell::RefCell<dyn PersistenceStore>> = store;
    let mut top = build_top_level(
        &plan,
        persistence,
        Some(default_restart_policy()),
        &args.levels,
    )?;
    let mut reporter = PrintReporter;
    drive_to_completion(&mut top, &mut reporter)
}
