//! `cloudfleet down`: load a plan and tear it down in reverse level order.

use std::path::PathBuf;

use crate::app::common::{build_top_level, default_restart_policy, drive_to_completion, load_plan_and_store, PrintReporter};
use crate::core::persistence::PersistenceStore;
use crate::Result;

pub struct DownArgs {
    pub plan: PathBuf,
    pub levels: Vec<String>,
}

pub fn handle_down(args: DownArgs) -> Result<()> {
    let (plan, store) = load_plan_and_store(&args.plan)?;
    let persistence: std::rc::Rc<std::cell::RefCell<dyn PersistenceStore>> = store;
    let mut top = build_top_level(
        &plan,
        persistence,
        Some(default_restart_policy()),
        &args.levels,
    )?;
    top.reverse_order()?;
    top.set_mode(false, false, true);
    let mut reporter = PrintReporter;
    drive_to_completion(&mut top, &mut reporter)
}
