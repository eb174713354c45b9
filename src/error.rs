use std::path::PathBuf;

use thiserror::Error;

/// Convenient result alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// A single member of a multi-level pollable that failed during a level drain.
#[derive(Debug)]
pub struct FailedMember {
    /// Human-readable label identifying the failed pollable (e.g. a service name).
    pub label: String,
    /// The error the member raised.
    pub source: Box<Error>,
}

/// The crate's error taxonomy.
///
/// Variants correspond one-to-one with the documented taxonomy: malformed plans,
/// illegal lifecycle calls, cloud failures, composite service failures, multi-level
/// drain failures, and wall-clock timeouts.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or unresolvable plan: missing env var, dangling reference,
    /// conflicting image+hostname, unknown service, unknown attribute, missing
    /// template file.
    #[error("configuration error: {message}")]
    ConfigError { message: String },

    /// Illegal lifecycle call: start-twice, boot-an-already-contextualized service
    /// without terminate, action on a terminated service.
    #[error("API misuse: {message}")]
    ApiMisuseError { message: String },

    /// Cloud API failure or instance in an unexpected terminal state.
    #[error("IaaS error: {message}")]
    IaasError { message: String },

    /// Composite failure with pointers to the offending subordinate pollable,
    /// the failing service, the host, and captured stdout/stderr.
    #[error("service `{service}` failed in {pollable}{host_suffix}: {message}",
        host_suffix = .host.as_deref().map(|h| format!(" (host {h})")).unwrap_or_default())]
    ServiceError {
        service: String,
        host: Option<String>,
        pollable: &'static str,
        message: String,
        stdout: String,
        stderr: String,
    },

    /// Raised by the multi-level pollable, carrying the set of failed members.
    #[error("{} member(s) failed during level drain", .failed.len())]
    MultilevelError { failed: Vec<FailedMember> },

    /// A pollable exceeded its wall-clock budget.
    #[error("{pollable} timed out after {elapsed_secs}s (budget {budget_secs}s)")]
    TimeoutError {
        pollable: &'static str,
        elapsed_secs: u64,
        budget_secs: u64,
    },

    #[error("failed to read file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse plan at {}: {source}", .path.display())]
    ParsePlan {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Error::ConfigError {
            message: message.into(),
        }
    }

    pub fn api_misuse(message: impl Into<String>) -> Self {
        Error::ApiMisuseError {
            message: message.into(),
        }
    }

    pub fn iaas(message: impl Into<String>) -> Self {
        Error::IaasError {
            message: message.into(),
        }
    }
}
