//! IaaS pollables: launch-and-wait-for-hostname, and terminate-and-wait.
//!
//! Grounded on §4.4 and `original_source/cloudboot/cb_iaas.py`'s instance
//! lifecycle (`pending -> running`, `shutting-down -> terminated`).

use std::time::{Duration, Instant};

use crate::core::iaas::{IaasConnection, Instance, InstanceSnapshot, InstanceState, RunInstanceRequest};
use crate::core::pollable::{PollOutcome, Pollable};
use crate::error::{Error, Result};

pub const LAUNCH_KIND: &str = "launch-hostname pollable";
pub const TERMINATE_KIND: &str = "terminate pollable";

/// Submits `run_instances` (or resumes polling an existing instance) and
/// completes once the instance is running with a non-empty public hostname.
pub struct LaunchHostnamePollable {
    connection: Box<dyn IaasConnection>,
    request: Option<RunInstanceRequest>,
    resume_instance_id: Option<String>,
    timeout: Duration,
    started_at: Option<Instant>,
    instance: Option<Box<dyn Instance>>,
}

impl LaunchHostnamePollable {
    pub fn new(connection: Box<dyn IaasConnection>, request: RunInstanceRequest, timeout: Duration) -> Self {
        Self {
            connection,
            request: Some(request),
            resume_instance_id: None,
            timeout,
            started_at: None,
            instance: None,
        }
    }

    pub fn resume(connection: Box<dyn IaasConnection>, instance_id: String, timeout: Duration) -> Self {
        Self {
            connection,
            request: None,
            resume_instance_id: Some(instance_id),
            timeout,
            started_at: None,
            instance: None,
        }
    }

    pub fn instance_id(&self) -> Option<&str> {
        self.instance.as_deref().map(Instance::id)
    }

    pub fn snapshot(&self) -> Option<InstanceSnapshot> {
        self.instance.as_ref().map(|instance| instance.snapshot())
    }
}

impl Pollable for LaunchHostnamePollable {
    fn start(&mut self) -> Result<()> {
        if self.started_at.is_some() {
            return Err(Error::api_misuse("launch-hostname pollable started twice"));
        }
        self.started_at = Some(Instant::now());
        self.instance = Some(match (&self.request, &self.resume_instance_id) {
            (Some(request), _) => self.connection.run_instance(request)?,
            (None, Some(instance_id)) => self
                .connection
                .find_instance(instance_id)?
                .ok_or_else(|| Error::iaas(format!("instance `{instance_id}` not found on resume")))?,
            (None, None) => {
                return Err(Error::api_misuse(
                    "launch-hostname pollable has neither a request nor a resume id",
                ));
            }
        });
        Ok(())
    }

    fn poll(&mut self) -> Result<PollOutcome> {
        let started_at = self
            .started_at
            .ok_or_else(|| Error::api_misuse("launch-hostname pollable polled before start"))?;
        if started_at.elapsed() > self.timeout {
            return Err(Error::TimeoutError {
                pollable: LAUNCH_KIND,
                elapsed_secs: started_at.elapsed().as_secs(),
                budget_secs: self.timeout.as_secs(),
            });
        }

        let instance = self
            .instance
            .as_mut()
            .ok_or_else(|| Error::api_misuse("launch-hostname pollable polled before start"))?;
        instance.update()?;
        let snapshot = instance.snapshot();
        match snapshot.state {
            InstanceState::Running if snapshot.public_dns_name.is_some() => Ok(PollOutcome::Done),
            InstanceState::Terminated | InstanceState::ShuttingDown => Err(Error::iaas(format!(
                "instance `{}` reached terminal state `{}` before becoming reachable",
                snapshot.id,
                snapshot.state.as_str()
            ))),
            _ => Ok(PollOutcome::NotDone),
        }
    }

    fn cancel(&mut self) {
        // The cloud request, once submitted, is not revoked by a local cancel;
        // the instance continues to exist and a later terminate pollable reaps
        // it. Only local bookkeeping is released here.
        self.instance = None;
    }
}

/// Requests termination of an existing instance and completes once the cloud
/// reports it `terminated` (or reports it missing, which is idempotent
/// success per §4.4).
pub struct TerminatePollable {
    connection: Box<dyn IaasConnection>,
    instance_id: String,
    timeout: Duration,
    started_at: Option<Instant>,
    instance: Option<Box<dyn Instance>>,
    already_gone: bool,
}

impl TerminatePollable {
    pub fn new(connection: Box<dyn IaasConnection>, instance_id: String, timeout: Duration) -> Self {
        Self {
            connection,
            instance_id,
            timeout,
            started_at: None,
            instance: None,
            already_gone: false,
        }
    }
}

impl Pollable for TerminatePollable {
    fn start(&mut self) -> Result<()> {
        if self.started_at.is_some() {
            return Err(Error::api_misuse("terminate pollable started twice"));
        }
        self.started_at = Some(Instant::now());
        match self.connection.find_instance(&self.instance_id)? {
            Some(mut instance) => {
                instance.terminate()?;
                self.instance = Some(instance);
            }
            None => {
                self.already_gone = true;
            }
        }
        Ok(())
    }

    fn poll(&mut self) -> Result<PollOutcome> {
        if self.already_gone {
            return Ok(PollOutcome::Done);
        }
        let started_at = self
            .started_at
            .ok_or_else(|| Error::api_misuse("terminate pollable polled before start"))?;
        if started_at.elapsed() > self.timeout {
            return Err(Error::TimeoutError {
                pollable: TERMINATE_KIND,
                elapsed_secs: started_at.elapsed().as_secs(),
                budget_secs: self.timeout.as_secs(),
            });
        }
        let instance = self
            .instance
            .as_mut()
            .ok_or_else(|| Error::api_misuse("terminate pollable polled before start"))?;
        instance.update()?;
        match instance.snapshot().state {
            InstanceState::Terminated => Ok(PollOutcome::Done),
            _ => Ok(PollOutcome::NotDone),
        }
    }

    fn cancel(&mut self) {
        self.instance = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::iaas::{self, fake};

    #[test]
    fn launch_reaches_done_with_hostname() {
        temp_env::with_var(iaas::FAKE_ENV_VAR, Some("1"), || {
            fake::reset();
            let connection = iaas::connect("UNUSED", "UNUSED", None, None).unwrap();
            let mut pollable = LaunchHostnamePollable::new(
                connection,
                RunInstanceRequest {
                    image: "img".to_string(),
                    instance_type: "m5.large".to_string(),
                    key_name: "key".to_string(),
                    security_groups: Vec::new(),
                },
                Duration::from_secs(5),
            );
            pollable.start().unwrap();
            loop {
                match pollable.poll().unwrap() {
                    PollOutcome::Done => break,
                    PollOutcome::NotDone => {}
                }
            }
            assert!(pollable.snapshot().unwrap().public_dns_name.is_some());
        });
    }

    #[test]
    fn terminate_of_missing_instance_is_idempotent_success() {
        temp_env::with_var(iaas::FAKE_ENV_VAR, Some("1"), || {
            fake::reset();
            let connection = iaas::connect("UNUSED", "UNUSED", None, None).unwrap();
            let mut pollable =
                TerminatePollable::new(connection, "i-doesnotexist".to_string(), Duration::from_secs(5));
            pollable.start().unwrap();
            assert_eq!(pollable.poll().unwrap(), PollOutcome::Done);
        });
    }

    #[test]
    fn terminate_reaches_terminated_state() {
        temp_env::with_var(iaas::FAKE_ENV_VAR, Some("1"), || {
            fake::reset();
            let connection = iaas::connect("UNUSED", "UNUSED", None, None).unwrap();
            let instance = connection
                .run_instance(&RunInstanceRequest {
                    image: "img".to_string(),
                    instance_type: "m5.large".to_string(),
                    key_name: "key".to_string(),
                    security_groups: Vec::new(),
                })
                .unwrap();
            let id = instance.id().to_string();
            drop(instance);

            let connection2 = iaas::connect("UNUSED", "UNUSED", None, None).unwrap();
            let mut pollable = TerminatePollable::new(connection2, id, Duration::from_secs(5));
            pollable.start().unwrap();
            loop {
                match pollable.poll().unwrap() {
                    PollOutcome::Done => break,
                    PollOutcome::NotDone => {}
                }
            }
        });
    }
}
