//! `cloudfleet status`: render persisted service state as a table or JSON.

use std::path::PathBuf;

use crate::app::common::{build_top_level, load_plan_and_store};
use crate::core::persistence::PersistenceStore;
use crate::Result;

pub struct StatusArgs {
    pub plan: PathBuf,
    pub json: bool,
}

pub fn handle_status(args: StatusArgs) -> Result<()> {
    let (plan, store) = load_plan_and_store(&args.plan)?;
    let committed_at = store.borrow().read_committed_at()?;
    let persistence: std::rc::Rc<std::cell::RefCell<dyn PersistenceStore>> = store;
    let top = build_top_level(&plan, persistence, None, &[])?;
    let mut doc = top.get_json_doc();
    if let serde_json::Value::Object(map) = &mut doc {
        map.insert("committed_at".to_string(), serde_json::json!(committed_at));
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&doc).expect("doc is always serializable"));
        return Ok(());
    }

    println!(
        "last commit: {}",
        committed_at.as_deref().unwrap_or("<never>")
    );
    println!("{:<10} {:<20} {:<16} {:<22} {}", "LEVEL", "SERVICE", "STATE", "HOSTNAME", "LAST ERROR");
    for (level_idx, level) in doc["levels"].as_array().unwrap().iter().enumerate() {
        for service in level["services"].as_array().unwrap() {
            println!(
                "{:<10} {:<20} {:<16} {:<22} {}",
                level_idx,
                service["name"].as_str().unwrap_or(""),
                service["state"].as_str().unwrap_or(""),
                service["hostname"].as_str().unwrap_or("-"),
                service["last_error"].as_str().unwrap_or(""),
            );
        }
    }
    Ok(())
}
