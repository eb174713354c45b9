//! `cloudfleet doctor`: validate a plan without starting anything.

use std::path::PathBuf;

use crate::core::diagnostics::Diagnostic;
use crate::{load_plan, Plan, Result};

use super::common::emit_diagnostics;

pub struct DoctorArgs {
    pub plan: PathBuf,
}

pub fn handle_doctor(args: DoctorArgs) -> Result<()> {
    let (plan, diagnostics) = load_plan(&args.plan)?;
    emit_diagnostics(&diagnostics);
    report_ok(&plan, &diagnostics);
    Ok(())
}

fn report_ok(plan: &Plan, diagnostics: &[Diagnostic]) {
    let service_count: usize = plan.levels.iter().map(|l| l.services.len()).sum();
    println!(
        "plan ok: {} level(s), {} service(s), {} warning(s)",
        plan.levels.len(),
        service_count,
        diagnostics.len()
    );
}
