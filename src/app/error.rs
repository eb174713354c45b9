use std::process::ExitCode;

use crate::Error;

/// Maps the crate's error taxonomy to a process exit code, per §10: 64 for
/// usage/config failures raised before any service reaches a terminal state,
/// 70 for mid-run failures.
pub fn exit_code(err: &Error) -> ExitCode {
    match err {
        Error::ConfigError { .. } => ExitCode::from(64),
        Error::ApiMisuseError { .. } => ExitCode::from(64),
        Error::Io { .. } => ExitCode::from(66),
        Error::ParsePlan { .. } => ExitCode::from(64),
        Error::IaasError { .. } => ExitCode::from(70),
        Error::ServiceError { .. } => ExitCode::from(70),
        Error::MultilevelError { .. } => ExitCode::from(70),
        Error::TimeoutError { .. } => ExitCode::from(70),
    }
}
