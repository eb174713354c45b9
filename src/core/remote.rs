//! Remote command collaborator: composes the shell command strings the
//! engine hands to process pollables, and resolves the `ssh`/`scp`/task-runner
//! executable names from environment overrides.
//!
//! Grounded on §6 and `original_source/cloudinitd/services.py`'s
//! `_get_ssh_command`/`_get_fab_command`.

/// Environment variables that override the default executable names.
pub const SSH_BIN_ENV: &str = "CLOUDFLEET_SSH_BIN";
pub const SCP_BIN_ENV: &str = "CLOUDFLEET_SCP_BIN";
pub const FAB_BIN_ENV: &str = "CLOUDFLEET_FAB_BIN";

fn executable(env_var: &str, default: &str) -> String {
    std::env::var(env_var).unwrap_or_else(|_| default.to_string())
}

/// Build the SSH liveness probe command: `ssh ... user@host /bin/true`.
pub fn ssh_liveness_command(localkey: &str, user: &str, host: &str, port: u16) -> String {
    let ssh = executable(SSH_BIN_ENV, "ssh");
    format!(
        "{ssh} -n -T -p {port} -o BatchMode=yes -o StrictHostKeyChecking=no \
         -o PasswordAuthentication=no -i {localkey} {user}@{host} /bin/true"
    )
}

/// Arguments shared by boot/ready/terminate program invocations.
pub struct ProgramInvocation<'a> {
    pub task: &'a str,
    pub host: &'a str,
    pub user: &'a str,
    pub localkey: &'a str,
    pub pgm: &'a str,
    pub args: &'a str,
    pub rendered_conf: Option<&'a str>,
    pub env_conf: Option<&'a str>,
    pub output_file: &'a str,
    pub stagedir: &'a str,
}

/// Build the boot/ready/terminate program command: a task-runner invocation
/// carrying the named task and its comma-separated key=value arguments.
pub fn program_command(invocation: &ProgramInvocation<'_>) -> String {
    let fab = executable(FAB_BIN_ENV, "fab");
    let conf = invocation.rendered_conf.unwrap_or("");
    let env_conf = invocation.env_conf.unwrap_or("");
    format!(
        "{fab} -f fabfile.py -D -u {user} -i {localkey} '{task}:hosts={host},pgm={pgm},args={args},conf={conf},env_conf={env_conf},output={output},stagedir={stagedir}'",
        user = invocation.user,
        localkey = invocation.localkey,
        task = invocation.task,
        host = invocation.host,
        pgm = invocation.pgm,
        args = invocation.args,
        conf = conf,
        env_conf = env_conf,
        output = invocation.output_file,
        stagedir = invocation.stagedir,
    )
}

/// URL-quote and comma-join program arguments for the `args=` field of a
/// task-runner invocation, so an argument containing `,`, ` `, or `=` can't
/// corrupt the surrounding comma-delimited `key=value` task string.
pub fn quote_args<S: AsRef<str>>(args: &[S]) -> String {
    args.iter()
        .map(|arg| urlencoding::encode(arg.as_ref()).into_owned())
        .collect::<Vec<_>>()
        .join(",")
}

/// Build an SCP upload/download command.
pub fn scp_command(localkey: &str, user: &str, host: &str, recursive: bool, src: &str, dst: &str) -> String {
    let scp = executable(SCP_BIN_ENV, "scp");
    let recurse_flag = if recursive { " -r" } else { "" };
    format!(
        "{scp}{recurse_flag} -o BatchMode=yes -o StrictHostKeyChecking=no \
         -o PasswordAuthentication=no -i {localkey} {src} {user}@{host}:{dst}"
    )
}

/// The conventional per-service remote staging directory.
pub fn staging_dir(remote_working_dir: &str, service_name: &str) -> String {
    format!("{remote_working_dir}/{service_name}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    #[test]
    fn ssh_liveness_command_shape() {
        let command = ssh_liveness_command("/home/u/.ssh/key.pem", "ubuntu", "10.0.0.1", 22);
        let pattern = Regex::new(
            r"^ssh -n -T -p 22 -o BatchMode=yes -o StrictHostKeyChecking=no -o PasswordAuthentication=no -i /home/u/\.ssh/key\.pem ubuntu@10\.0\.0\.1 /bin/true$",
        )
        .unwrap();
        assert!(pattern.is_match(&command), "unexpected command: {command}");
    }

    #[test]
    fn program_command_includes_stagedir_and_task() {
        let invocation = ProgramInvocation {
            task: "bootpgm",
            host: "10.0.0.1",
            user: "ubuntu",
            localkey: "/home/u/.ssh/key.pem",
            pgm: "configure.sh",
            args: "",
            rendered_conf: Some("/tmp/app.conf"),
            env_conf: Some("/tmp/app.env"),
            output_file: "/tmp/out.json",
            stagedir: "/opt/stage/app",
        };
        let command = program_command(&invocation);
        assert!(command.contains("bootpgm:hosts=10.0.0.1"));
        assert!(command.contains("stagedir=/opt/stage/app"));
        assert!(command.contains("output=/tmp/out.json"));
    }

    #[test]
    fn executable_respects_env_override() {
        temp_env::with_var(SSH_BIN_ENV, Some("/custom/ssh"), || {
            let command = ssh_liveness_command("key", "user", "host", 22);
            assert!(command.starts_with("/custom/ssh "));
        });
    }

    #[test]
    fn staging_dir_is_conventional() {
        assert_eq!(staging_dir("/var/cloudfleet-remote", "app"), "/var/cloudfleet-remote/app");
    }

    #[test]
    fn quote_args_escapes_delimiters() {
        let args = vec!["--name=foo bar".to_string(), "plain".to_string()];
        let quoted = quote_args(&args);
        assert_eq!(quoted, "--name%3Dfoo%20bar,plain");
    }
}
