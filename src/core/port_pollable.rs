//! Port pollable: a non-blocking TCP connect probe with a retry budget and an
//! overall timeout.
//!
//! No direct teacher analogue exists (cloudfleet never probes a remote host's
//! network reachability); built from `std::net` in the teacher's non-blocking,
//! bounded-quantum style.

use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use crate::core::events::Event;
use crate::core::pollable::{PollOutcome, Pollable};
use crate::error::{Error, Result};

pub const KIND: &str = "port pollable";

/// Short per-attempt connect deadline, carved out of the remaining overall
/// budget so a single slow DNS lookup or connect cannot stall an entire level.
const PER_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(3);

/// Probes `host:port` with a single non-blocking connect attempt per `poll`.
///
/// `host` is re-resolved fresh on every attempt since it may be populated (or
/// change) after `start`, e.g. once a service's hostname becomes known.
pub struct PortPollable {
    host: String,
    port: u16,
    retry_budget: u32,
    timeout: Duration,
    started_at: Option<Instant>,
    attempts_made: u32,
    service: Option<String>,
    pending_events: Vec<Event>,
}

impl PortPollable {
    pub fn new(host: impl Into<String>, port: u16, retry_budget: u32, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            retry_budget,
            timeout,
            started_at: None,
            attempts_made: 0,
            service: None,
            pending_events: Vec::new(),
        }
    }

    /// Tags this pollable with the service it checks reachability for, so its
    /// `poll()` can emit [`Event::PortReachable`] on success.
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    fn attempt(&self) -> Result<bool> {
        let target = format!("{}:{}", self.host, self.port);
        let addrs = match target.to_socket_addrs() {
            Ok(addrs) => addrs,
            Err(_) => return Ok(false),
        };
        for addr in addrs {
            if TcpStream::connect_timeout(&addr, PER_ATTEMPT_TIMEOUT).is_ok() {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

impl Pollable for PortPollable {
    fn start(&mut self) -> Result<()> {
        if self.started_at.is_some() {
            return Err(Error::api_misuse("port pollable started twice"));
        }
        self.started_at = Some(Instant::now());
        Ok(())
    }

    fn poll(&mut self) -> Result<PollOutcome> {
        let started_at = self
            .started_at
            .ok_or_else(|| Error::api_misuse("port pollable polled before start"))?;

        if started_at.elapsed() > self.timeout {
            return Err(Error::TimeoutError {
                pollable: KIND,
                elapsed_secs: started_at.elapsed().as_secs(),
                budget_secs: self.timeout.as_secs(),
            });
        }

        if self.attempt()? {
            if let Some(service) = &self.service {
                self.pending_events.push(Event::PortReachable {
                    service: service.clone(),
                    host: self.host.clone(),
                    port: self.port,
                });
            }
            return Ok(PollOutcome::Done);
        }

        self.attempts_made += 1;
        if self.attempts_made > self.retry_budget {
            return Err(Error::ServiceError {
                service: String::new(),
                host: Some(self.host.clone()),
                pollable: KIND,
                message: format!(
                    "could not reach {}:{} after {} attempt(s)",
                    self.host, self.port, self.attempts_made
                ),
                stdout: String::new(),
                stderr: String::new(),
            });
        }
        Ok(PollOutcome::NotDone)
    }

    fn cancel(&mut self) {
        // No held OS resources between polls; a single connect attempt is
        // synchronous and short-lived by construction (`PER_ATTEMPT_TIMEOUT`).
    }

    fn drain_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.pending_events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn succeeds_against_a_listening_port() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut pollable = PortPollable::new("127.0.0.1", port, 3, Duration::from_secs(5));
        pollable.start().unwrap();
        loop {
            match pollable.poll().unwrap() {
                PollOutcome::Done => break,
                PollOutcome::NotDone => std::thread::sleep(Duration::from_millis(20)),
            }
        }
    }

    #[test]
    fn exhausts_retry_budget_against_a_closed_port() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let mut pollable = PortPollable::new("127.0.0.1", port, 1, Duration::from_secs(5));
        pollable.start().unwrap();
        let mut err = None;
        for _ in 0..5 {
            match pollable.poll() {
                Ok(PollOutcome::NotDone) => continue,
                Ok(PollOutcome::Done) => panic!("expected no listener to keep failing"),
                Err(e) => {
                    err = Some(e);
                    break;
                }
            }
        }
        assert!(matches!(err, Some(Error::ServiceError { .. })));
    }
}
