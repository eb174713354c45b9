//! Boot top-level: owns the service dictionary and the enclosing multi-level
//! pollable whose members are services.
//!
//! Grounded on §4.7 and `original_source/cloudinitd/services.py`'s
//! `BootTopLevel`.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::core::attrs::DependencyResolver;
use crate::core::events::Event;
use crate::core::multilevel::{Member, MultiLevelPollable};
use crate::core::persistence::PersistenceStore;
use crate::core::pollable::{PollOutcome, Pollable};
use crate::core::service::{ServiceContainer, ServiceRecord, ServiceTable};
use crate::error::{Error, Result};

/// Owns the plan-wide service table and the top-level multi-level pollable
/// that sequences levels of [`ServiceContainer`]s.
pub struct BootTopLevel {
    table: ServiceTable,
    persistence: Rc<RefCell<dyn PersistenceStore>>,
    restart_policy: Option<Rc<dyn Fn(&Error) -> bool>>,
    levels: Vec<Vec<String>>,
    containers: BTreeMap<String, Rc<RefCell<ServiceContainer>>>,
    multilevel: Option<MultiLevelPollable>,
}

/// Delegates `Pollable` to a shared container so the top-level multi-level
/// pollable can drive it while `BootTopLevel` keeps its own handle for
/// observability (`get_json_doc`).
struct ContainerMember(Rc<RefCell<ServiceContainer>>);

impl Pollable for ContainerMember {
    fn start(&mut self) -> Result<()> {
        self.0.borrow_mut().start()
    }

    fn poll(&mut self) -> Result<PollOutcome> {
        self.0.borrow_mut().poll()
    }

    fn cancel(&mut self) {
        self.0.borrow_mut().cancel();
    }

    fn drain_events(&mut self) -> Vec<Event> {
        self.0.borrow_mut().drain_events()
    }
}

impl BootTopLevel {
    pub fn new(
        persistence: Rc<RefCell<dyn PersistenceStore>>,
        restart_policy: Option<Rc<dyn Fn(&Error) -> bool>>,
    ) -> Self {
        Self {
            table: ServiceTable::new(),
            persistence,
            restart_policy,
            levels: Vec::new(),
            containers: BTreeMap::new(),
            multilevel: None,
        }
    }

    /// Registers a service record, creating its container. Rejects duplicate
    /// names and records lacking both `image` and a static hostname (enforced
    /// by [`ServiceRecord::validate`] via [`ServiceTable::insert`]).
    pub fn new_service(&mut self, record: ServiceRecord) -> Result<()> {
        let name = record.name.clone();
        self.table.insert(record)?;
        let container = ServiceContainer::new(
            name.clone(),
            self.table.clone(),
            self.persistence.clone(),
            self.restart_policy.clone(),
        );
        self.containers
            .insert(name, Rc::new(RefCell::new(container)));
        Ok(())
    }

    /// Appends a level naming services already registered via `new_service`.
    /// Only legal before `start`.
    pub fn add_level(&mut self, service_names: Vec<String>) -> Result<()> {
        if self.multilevel.is_some() {
            return Err(Error::api_misuse("add_level called after start"));
        }
        for name in &service_names {
            if !self.containers.contains_key(name) {
                return Err(Error::config(format!(
                    "level references unknown service `{name}`"
                )));
            }
        }
        self.levels.push(service_names);
        Ok(())
    }

    /// Reverses level order for tear-down. Only legal before `start`.
    pub fn reverse_order(&mut self) -> Result<()> {
        if self.multilevel.is_some() {
            return Err(Error::api_misuse("reverse_order called after start"));
        }
        self.levels.reverse();
        Ok(())
    }

    /// Sets which phases every registered service should drive this run.
    pub fn set_mode(&mut self, do_boot: bool, do_ready: bool, do_terminate: bool) {
        for container in self.containers.values() {
            container
                .borrow_mut()
                .set_mode(do_boot, do_ready, do_terminate);
        }
    }

    pub fn find_dep(&self, svc_name: &str, attr: &str) -> Result<String> {
        self.table.find_dep(svc_name, attr)
    }

    /// Serializes the plan and live state as a nested map (levels → services
    /// → attributes) for observability.
    pub fn get_json_doc(&self) -> serde_json::Value {
        let levels: Vec<serde_json::Value> = self
            .levels
            .iter()
            .map(|level| {
                let services: Vec<serde_json::Value> = level
                    .iter()
                    .filter_map(|name| self.table.get(name))
                    .map(|record| {
                        serde_json::json!({
                            "name": record.name,
                            "state": record.state.as_str(),
                            "hostname": record.hostname,
                            "instance_id": record.instance_id,
                            "last_error": record.last_error,
                            "attrs": record.exported,
                        })
                    })
                    .collect();
                serde_json::json!({ "services": services })
            })
            .collect();
        serde_json::json!({ "levels": levels })
    }
}

impl Pollable for BootTopLevel {
    fn start(&mut self) -> Result<()> {
        if self.multilevel.is_some() {
            return Err(Error::api_misuse("boot top-level started twice"));
        }
        let mut multilevel = MultiLevelPollable::new(false);
        for level in &self.levels {
            let members = level
                .iter()
                .map(|name| {
                    let container = self
                        .containers
                        .get(name)
                        .expect("level names validated at add_level")
                        .clone();
                    Member::new(name.clone(), Box::new(ContainerMember(container)))
                })
                .collect();
            multilevel.add_level(members)?;
        }
        multilevel.start()?;
        self.multilevel = Some(multilevel);
        Ok(())
    }

    fn poll(&mut self) -> Result<PollOutcome> {
        let multilevel = self
            .multilevel
            .as_mut()
            .ok_or_else(|| Error::api_misuse("boot top-level polled before start"))?;
        multilevel.poll()
    }

    fn cancel(&mut self) {
        if let Some(multilevel) = &mut self.multilevel {
            multilevel.cancel();
        }
    }

    fn drain_events(&mut self) -> Vec<Event> {
        // Member containers are drained each round by the enclosing
        // `MultiLevelPollable::poll()` itself (it collects every member's
        // `drain_events()` to fill its own buffer), so pulling from
        // containers here directly would race with that and lose events.
        match &mut self.multilevel {
            Some(multilevel) => multilevel.drain_events(),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::iaas::{self, fake};
    use crate::core::persistence::JsonFileStore;
    use crate::core::remote;
    use crate::core::service::ServiceState;

    /// Scopes the fake-IaaS gate plus `ssh`/task-runner overrides so
    /// process-pollable stages invoke `true` instead of spawning real
    /// `ssh`/`fab` binaries that may not exist in the test environment.
    fn with_stubbed_remote<R>(f: impl FnOnce() -> R) -> R {
        temp_env::with_var(iaas::FAKE_ENV_VAR, Some("1"), || {
            temp_env::with_var(remote::SSH_BIN_ENV, Some("true"), || {
                temp_env::with_var(remote::FAB_BIN_ENV, Some("true"), || f())
            })
        })
    }

    fn image_record(name: &str, bootpgm: &str) -> ServiceRecord {
        let mut record = ServiceRecord::new(name.to_string());
        record.image = Some("img".to_string());
        record.instance_type = Some("m5.large".to_string());
        record.key_name = Some("key".to_string());
        record.bootpgm = Some(bootpgm.to_string());
        record.readypgm = Some("true".to_string());
        record.username = Some("root".to_string());
        record
    }

    /// Binds an ephemeral loopback listener so a service's port-check has a
    /// real socket to connect to; the fake IaaS double hands out `127.0.0.1`
    /// as every instance's hostname, so services share the same host and are
    /// distinguished only by port.
    fn bind_loopback_listener() -> (std::net::TcpListener, u16) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    /// Pre-creates the boot program's output file at the path `build_phase_b`
    /// derives internally (`{name}-bootout-{pid}.json` in the OS temp dir).
    fn write_empty_boot_output(service_name: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!(
            "{service_name}-bootout-{}.json",
            std::process::id()
        ));
        std::fs::write(&path, "{}").unwrap();
        path
    }

    fn drive(top: &mut BootTopLevel) -> Result<()> {
        top.start()?;
        loop {
            match top.poll()? {
                PollOutcome::Done => return Ok(()),
                PollOutcome::NotDone => std::thread::sleep(std::time::Duration::from_millis(10)),
            }
        }
    }

    #[test]
    fn two_level_plan_resolves_cross_service_hostname() {
        with_stubbed_remote(|| {
            fake::reset();
            let dir = tempfile::tempdir().unwrap();
            let persistence: Rc<RefCell<dyn PersistenceStore>> =
                Rc::new(RefCell::new(JsonFileStore::new(dir.path().join("state.json"))));
            let mut top = BootTopLevel::new(persistence, None);
            let (_listener, port) = bind_loopback_listener();

            let mut a = image_record("a", "true");
            a.ssh_port = port;
            top.new_service(a).unwrap();
            let mut b = ServiceRecord::new("b".to_string());
            b.static_hostname = Some("${a.hostname}".to_string());
            b.username = Some("root".to_string());
            b.readypgm = Some("true".to_string());
            b.ssh_port = port;
            top.new_service(b).unwrap();

            top.add_level(vec!["a".to_string()]).unwrap();
            top.add_level(vec!["b".to_string()]).unwrap();
            top.set_mode(true, true, false);

            let output_path = write_empty_boot_output("a");
            drive(&mut top).unwrap();
            let _ = std::fs::remove_file(output_path);

            let a = top.table.get("a").unwrap();
            let b = top.table.get("b").unwrap();
            assert_eq!(a.state, ServiceState::Contextualized);
            assert_eq!(b.hostname, a.hostname);
            assert_eq!(b.state, ServiceState::Contextualized);

            let doc = top.get_json_doc();
            assert_eq!(doc["levels"].as_array().unwrap().len(), 2);
        });
    }

    #[test]
    fn duplicate_service_name_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let persistence: Rc<RefCell<dyn PersistenceStore>> =
            Rc::new(RefCell::new(JsonFileStore::new(dir.path().join("state.json"))));
        let mut top = BootTopLevel::new(persistence, None);
        top.new_service(image_record("a", "true")).unwrap();
        let err = top.new_service(image_record("a", "true")).unwrap_err();
        assert!(matches!(err, Error::ConfigError { .. }));
    }

    #[test]
    fn add_level_rejects_unknown_service() {
        let dir = tempfile::tempdir().unwrap();
        let persistence: Rc<RefCell<dyn PersistenceStore>> =
            Rc::new(RefCell::new(JsonFileStore::new(dir.path().join("state.json"))));
        let mut top = BootTopLevel::new(persistence, None);
        let err = top.add_level(vec!["ghost".to_string()]).unwrap_err();
        assert!(matches!(err, Error::ConfigError { .. }));
    }

    #[test]
    fn tear_down_runs_levels_in_reverse() {
        with_stubbed_remote(|| {
            fake::reset();
            let dir = tempfile::tempdir().unwrap();
            let persistence: Rc<RefCell<dyn PersistenceStore>> =
                Rc::new(RefCell::new(JsonFileStore::new(dir.path().join("state.json"))));
            let mut top = BootTopLevel::new(persistence.clone(), None);
            let (_listener, port) = bind_loopback_listener();
            let mut a = image_record("a", "true");
            a.ssh_port = port;
            let mut b = image_record("b", "true");
            b.ssh_port = port;
            top.new_service(a).unwrap();
            top.new_service(b).unwrap();
            top.add_level(vec!["a".to_string()]).unwrap();
            top.add_level(vec!["b".to_string()]).unwrap();
            top.set_mode(true, true, false);
            let output_a = write_empty_boot_output("a");
            let output_b = write_empty_boot_output("b");
            drive(&mut top).unwrap();
            let _ = std::fs::remove_file(output_a);
            let _ = std::fs::remove_file(output_b);

            let mut down = BootTopLevel::new(persistence, None);
            down.new_service(top.table.get("a").unwrap()).unwrap();
            down.new_service(top.table.get("b").unwrap()).unwrap();
            down.add_level(vec!["a".to_string()]).unwrap();
            down.add_level(vec!["b".to_string()]).unwrap();
            down.reverse_order().unwrap();
            down.set_mode(false, false, true);
            drive(&mut down).unwrap();

            assert_eq!(down.table.get("a").unwrap().state, ServiceState::Terminated);
            assert_eq!(down.table.get("b").unwrap().state, ServiceState::Terminated);
        });
    }
}
