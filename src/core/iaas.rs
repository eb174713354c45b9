//! IaaS facade: a uniform interface over cloud instance lifecycle plus a
//! deterministic in-memory double for testing.
//!
//! Grounded on `original_source/cloudboot/cb_iaas.py`: `IaaSTestCon`,
//! `IaaSTestInstance`, the process-wide `g_fake_instance_table`, and the
//! `CLOUDBOOT_TESTENV` environment-variable gate (renamed here to
//! `CLOUDFLEET_IAAS_FAKE`, keeping the same idea: a designated environment
//! variable selects the deterministic double over the real cloud connection).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use crate::error::{Error, Result};

/// Environment variable that selects the in-memory double when set.
pub const FAKE_ENV_VAR: &str = "CLOUDFLEET_IAAS_FAKE";

/// Lifecycle states of a cloud instance, compatible with EC2 query semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Pending,
    Running,
    ShuttingDown,
    Terminated,
}

impl InstanceState {
    pub fn as_str(self) -> &'static str {
        match self {
            InstanceState::Pending => "pending",
            InstanceState::Running => "running",
            InstanceState::ShuttingDown => "shutting-down",
            InstanceState::Terminated => "terminated",
        }
    }
}

/// A snapshot of a cloud instance's observable state.
#[derive(Debug, Clone)]
pub struct InstanceSnapshot {
    pub id: String,
    pub state: InstanceState,
    pub public_dns_name: Option<String>,
}

/// Parameters for launching a new instance.
#[derive(Debug, Clone)]
pub struct RunInstanceRequest {
    pub image: String,
    pub instance_type: String,
    pub key_name: String,
    pub security_groups: Vec<String>,
}

/// A live handle to a cloud instance. `update` refreshes the cached snapshot
/// from the cloud; `terminate` requests shutdown.
pub trait Instance {
    fn id(&self) -> &str;
    fn snapshot(&self) -> InstanceSnapshot;
    fn update(&mut self) -> Result<()>;
    fn terminate(&mut self) -> Result<()>;
}

/// An authenticated connection to an IaaS endpoint.
pub trait IaasConnection {
    fn run_instance(&self, request: &RunInstanceRequest) -> Result<Box<dyn Instance>>;
    fn find_instance(&self, instance_id: &str) -> Result<Option<Box<dyn Instance>>>;
}

/// Resolve `key_ref`/`secret_ref` (environment variable names) and connect.
///
/// Selects the deterministic double when [`FAKE_ENV_VAR`] is set, the real
/// connection otherwise.
pub fn connect(
    key_ref: &str,
    secret_ref: &str,
    host: Option<&str>,
    port: Option<u16>,
) -> Result<Box<dyn IaasConnection>> {
    if std::env::var(FAKE_ENV_VAR).is_ok() {
        return Ok(Box::new(fake::FakeConnection::new()));
    }
    let key = std::env::var(key_ref)
        .map_err(|_| Error::config(format!("environment variable `{key_ref}` is not set")))?;
    let secret = std::env::var(secret_ref)
        .map_err(|_| Error::config(format!("environment variable `{secret_ref}` is not set")))?;
    Ok(Box::new(real::RealConnection::new(
        key,
        secret,
        host.map(str::to_string),
        port,
    )))
}

/// Real IaaS connection, speaking an EC2-query-compatible HTTP API via `ureq`
/// (the teacher's HTTP client of choice elsewhere in its stack).
mod real {
    use super::*;

    pub struct RealConnection {
        #[allow(dead_code)]
        access_key: String,
        #[allow(dead_code)]
        secret_key: String,
        endpoint: String,
    }

    impl RealConnection {
        pub fn new(
            access_key: String,
            secret_key: String,
            host: Option<String>,
            port: Option<u16>,
        ) -> Self {
            let endpoint = match (host, port) {
                (Some(host), Some(port)) => format!("https://{host}:{port}"),
                (Some(host), None) => format!("https://{host}"),
                (None, _) => "https://ec2.amazonaws.com".to_string(),
            };
            Self {
                access_key,
                secret_key,
                endpoint,
            }
        }
    }

    impl IaasConnection for RealConnection {
        fn run_instance(&self, request: &RunInstanceRequest) -> Result<Box<dyn Instance>> {
            let response = ureq::post(&format!("{}/", self.endpoint))
                .send_form(&[
                    ("Action", "RunInstances"),
                    ("ImageId", &request.image),
                    ("InstanceType", &request.instance_type),
                    ("KeyName", &request.key_name),
                ])
                .map_err(|source| Error::iaas(format!("run_instance request failed: {source}")))?;
            let body = response
                .into_string()
                .map_err(|source| Error::iaas(format!("could not read response body: {source}")))?;
            let instance_id = extract_instance_id(&body)
                .ok_or_else(|| Error::iaas("response did not contain an instance id"))?;
            Ok(Box::new(RealInstance {
                endpoint: self.endpoint.clone(),
                snapshot: InstanceSnapshot {
                    id: instance_id,
                    state: InstanceState::Pending,
                    public_dns_name: None,
                },
            }))
        }

        fn find_instance(&self, instance_id: &str) -> Result<Option<Box<dyn Instance>>> {
            let response = ureq::post(&format!("{}/", self.endpoint))
                .send_form(&[("Action", "DescribeInstances"), ("InstanceId", instance_id)])
                .map_err(|source| Error::iaas(format!("find_instance request failed: {source}")))?;
            if response.status() == 404 {
                return Ok(None);
            }
            let body = response
                .into_string()
                .map_err(|source| Error::iaas(format!("could not read response body: {source}")))?;
            if !body.contains(instance_id) {
                return Ok(None);
            }
            Ok(Some(Box::new(RealInstance {
                endpoint: self.endpoint.clone(),
                snapshot: parse_snapshot(&body, instance_id),
            })))
        }
    }

    struct RealInstance {
        endpoint: String,
        snapshot: InstanceSnapshot,
    }

    impl Instance for RealInstance {
        fn id(&self) -> &str {
            &self.snapshot.id
        }

        fn snapshot(&self) -> InstanceSnapshot {
            self.snapshot.clone()
        }

        fn update(&mut self) -> Result<()> {
            let response = ureq::post(&format!("{}/", self.endpoint))
                .send_form(&[
                    ("Action", "DescribeInstances"),
                    ("InstanceId", &self.snapshot.id),
                ])
                .map_err(|source| Error::iaas(format!("instance update failed: {source}")))?;
            let body = response
                .into_string()
                .map_err(|source| Error::iaas(format!("could not read response body: {source}")))?;
            self.snapshot = parse_snapshot(&body, &self.snapshot.id);
            Ok(())
        }

        fn terminate(&mut self) -> Result<()> {
            let response = ureq::post(&format!("{}/", self.endpoint)).send_form(&[
                ("Action", "TerminateInstances"),
                ("InstanceId", &self.snapshot.id),
            ]);
            match response {
                Ok(_) => {
                    self.snapshot.state = InstanceState::ShuttingDown;
                    Ok(())
                }
                Err(ureq::Error::Status(404, _)) => {
                    self.snapshot.state = InstanceState::Terminated;
                    Ok(())
                }
                Err(source) => Err(Error::iaas(format!("terminate request failed: {source}"))),
            }
        }
    }

    fn extract_instance_id(body: &str) -> Option<String> {
        // EC2-query responses carry `<instanceId>...</instanceId>`; a minimal,
        // dependency-free extraction suffices for the narrow fields this facade
        // consumes (§4.8: `id`, `state`, `public_dns_name` only).
        extract_tag(body, "instanceId")
    }

    fn parse_snapshot(body: &str, instance_id: &str) -> InstanceSnapshot {
        let state = match extract_tag(body, "name").as_deref() {
            Some("pending") => InstanceState::Pending,
            Some("running") => InstanceState::Running,
            Some("shutting-down") => InstanceState::ShuttingDown,
            Some("terminated") => InstanceState::Terminated,
            _ => InstanceState::Pending,
        };
        InstanceSnapshot {
            id: instance_id.to_string(),
            state,
            public_dns_name: extract_tag(body, "dnsName").filter(|s| !s.is_empty()),
        }
    }

    fn extract_tag(body: &str, tag: &str) -> Option<String> {
        let open = format!("<{tag}>");
        let close = format!("</{tag}>");
        let start = body.find(&open)? + open.len();
        let end = body[start..].find(&close)? + start;
        Some(body[start..end].to_string())
    }
}

/// Deterministic in-memory IaaS double, selected via [`FAKE_ENV_VAR`].
///
/// Grounded on `cb_iaas.py`'s `IaaSTestCon`/`IaaSTestInstance`: instances
/// transition `pending -> running` and `shutting-down -> terminated` after a
/// fixed, configurable delay measured in poll counts (not wall-clock), and a
/// process-wide table keyed by synthesized id lets `find_instance` recover the
/// same object across calls.
pub mod fake {
    use super::*;

    /// Number of `update()`/`poll` calls an instance spends in a transitional
    /// state before advancing, chosen to be small enough for fast tests while
    /// still exercising at least one `NotDone` poll.
    pub const TRANSITION_DELAY_POLLS: u32 = 2;

    struct FakeInstanceRecord {
        state: InstanceState,
        public_dns_name: Option<String>,
        polls_in_state: u32,
    }

    static TABLE: OnceLock<Mutex<HashMap<String, FakeInstanceRecord>>> = OnceLock::new();

    fn table() -> &'static Mutex<HashMap<String, FakeInstanceRecord>> {
        TABLE.get_or_init(|| Mutex::new(HashMap::new()))
    }

    /// Clears the process-wide fake instance table. Intended for test isolation
    /// between cases that both set [`FAKE_ENV_VAR`].
    pub fn reset() {
        table().lock().expect("fake iaas table poisoned").clear();
    }

    pub struct FakeConnection {
        counter: Arc<Mutex<u64>>,
    }

    impl FakeConnection {
        pub fn new() -> Self {
            Self {
                counter: Arc::new(Mutex::new(0)),
            }
        }

        fn next_id(&self) -> String {
            let mut counter = self.counter.lock().expect("fake iaas counter poisoned");
            *counter += 1;
            format!("i-fake{:08x}", *counter)
        }
    }

    impl Default for FakeConnection {
        fn default() -> Self {
            Self::new()
        }
    }

    impl IaasConnection for FakeConnection {
        fn run_instance(&self, _request: &RunInstanceRequest) -> Result<Box<dyn Instance>> {
            let id = self.next_id();
            table().lock().expect("fake iaas table poisoned").insert(
                id.clone(),
                FakeInstanceRecord {
                    state: InstanceState::Pending,
                    public_dns_name: None,
                    polls_in_state: 0,
                },
            );
            Ok(Box::new(FakeInstance { id }))
        }

        fn find_instance(&self, instance_id: &str) -> Result<Option<Box<dyn Instance>>> {
            let table = table().lock().expect("fake iaas table poisoned");
            if table.contains_key(instance_id) {
                Ok(Some(Box::new(FakeInstance {
                    id: instance_id.to_string(),
                })))
            } else {
                Ok(None)
            }
        }
    }

    struct FakeInstance {
        id: String,
    }

    impl Instance for FakeInstance {
        fn id(&self) -> &str {
            &self.id
        }

        fn snapshot(&self) -> InstanceSnapshot {
            let table = table().lock().expect("fake iaas table poisoned");
            match table.get(&self.id) {
                Some(record) => InstanceSnapshot {
                    id: self.id.clone(),
                    state: record.state,
                    public_dns_name: record.public_dns_name.clone(),
                },
                None => InstanceSnapshot {
                    id: self.id.clone(),
                    state: InstanceState::Terminated,
                    public_dns_name: None,
                },
            }
        }

        fn update(&mut self) -> Result<()> {
            let mut table = table().lock().expect("fake iaas table poisoned");
            let Some(record) = table.get_mut(&self.id) else {
                return Ok(());
            };
            record.polls_in_state += 1;
            if record.polls_in_state < TRANSITION_DELAY_POLLS {
                return Ok(());
            }
            match record.state {
                InstanceState::Pending => {
                    record.state = InstanceState::Running;
                    // Loopback rather than a synthetic DNS name so that callers
                    // driving a service all the way through port/ssh checks can
                    // bind a real listener and observe a real connect.
                    record.public_dns_name = Some("127.0.0.1".to_string());
                    record.polls_in_state = 0;
                }
                InstanceState::ShuttingDown => {
                    record.state = InstanceState::Terminated;
                    record.polls_in_state = 0;
                }
                InstanceState::Running | InstanceState::Terminated => {}
            }
            Ok(())
        }

        fn terminate(&mut self) -> Result<()> {
            let mut table = table().lock().expect("fake iaas table poisoned");
            if let Some(record) = table.get_mut(&self.id) {
                if record.state != InstanceState::Terminated {
                    record.state = InstanceState::ShuttingDown;
                    record.polls_in_state = 0;
                }
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_instance_reaches_running_with_hostname() {
        temp_env::with_var(FAKE_ENV_VAR, Some("1"), || {
            fake::reset();
            let con = connect("UNUSED", "UNUSED", None, None).unwrap();
            let mut instance = con
                .run_instance(&RunInstanceRequest {
                    image: "img".to_string(),
                    instance_type: "m5.large".to_string(),
                    key_name: "key".to_string(),
                    security_groups: Vec::new(),
                })
                .unwrap();
            for _ in 0..fake::TRANSITION_DELAY_POLLS {
                instance.update().unwrap();
            }
            let snapshot = instance.snapshot();
            assert_eq!(snapshot.state, InstanceState::Running);
            assert!(snapshot.public_dns_name.is_some());
        });
    }

    #[test]
    fn fake_find_instance_recovers_same_object() {
        temp_env::with_var(FAKE_ENV_VAR, Some("1"), || {
            fake::reset();
            let con = connect("UNUSED", "UNUSED", None, None).unwrap();
            let instance = con
                .run_instance(&RunInstanceRequest {
                    image: "img".to_string(),
                    instance_type: "m5.large".to_string(),
                    key_name: "key".to_string(),
                    security_groups: Vec::new(),
                })
                .unwrap();
            let id = instance.id().to_string();
            let found = con.find_instance(&id).unwrap();
            assert!(found.is_some());
        });
    }

    #[test]
    fn fake_terminate_is_idempotent() {
        temp_env::with_var(FAKE_ENV_VAR, Some("1"), || {
            fake::reset();
            let con = connect("UNUSED", "UNUSED", None, None).unwrap();
            let mut instance = con
                .run_instance(&RunInstanceRequest {
                    image: "img".to_string(),
                    instance_type: "m5.large".to_string(),
                    key_name: "key".to_string(),
                    security_groups: Vec::new(),
                })
                .unwrap();
            instance.terminate().unwrap();
            for _ in 0..fake::TRANSITION_DELAY_POLLS {
                instance.update().unwrap();
            }
            assert_eq!(instance.snapshot().state, InstanceState::Terminated);
            instance.terminate().unwrap();
            assert_eq!(instance.snapshot().state, InstanceState::Terminated);
        });
    }

    #[test]
    fn find_missing_instance_returns_none() {
        temp_env::with_var(FAKE_ENV_VAR, Some("1"), || {
            fake::reset();
            let con = connect("UNUSED", "UNUSED", None, None).unwrap();
            assert!(con.find_instance("i-doesnotexist").unwrap().is_none());
        });
    }
}
