//! Plan loading: reads a TOML plan document, validates it, and produces the
//! service records and level groupings the boot top-level consumes.
//!
//! Grounded on the teacher's `src/config.rs` `RawConfig`/`into_validated`
//! pattern (generic `toml::Value` pre-pass for unknown-field warnings, then a
//! typed `Raw*` deserialize, then validation), reshaped per SPEC_FULL §3
//! "Plan document (ambient)" and §4.9.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::core::diagnostics::{Diagnostic, Severity};
use crate::core::service::{ServiceRecord, ServiceState};
use crate::error::Error;

/// A fully validated plan: ordered levels of service names plus the
/// registered records, ready to be fed to [`crate::core::BootTopLevel`].
#[derive(Debug, Clone)]
pub struct Plan {
    pub version: String,
    pub iaas: IaasDefaults,
    pub levels: Vec<PlanLevel>,
}

#[derive(Debug, Clone)]
pub struct PlanLevel {
    pub name: String,
    pub services: Vec<ServiceRecord>,
}

#[derive(Debug, Clone, Default)]
pub struct IaasDefaults {
    pub url: Option<String>,
    pub key_ref: Option<String>,
    pub secret_ref: Option<String>,
}

/// Loads and validates the plan at `path`, returning diagnostics collected
/// along the way (unknown fields) alongside the validated plan.
pub fn load_plan(path: &Path) -> Result<(Plan, Vec<Diagnostic>), Error> {
    let contents = fs::read_to_string(path).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let value: toml::Value = toml::from_str(&contents).map_err(|source| Error::ParsePlan {
        path: path.to_path_buf(),
        source,
    })?;

    let mut diagnostics = detect_unknown_fields(&value, path);

    let raw = RawPlan::deserialize(value).map_err(|source| Error::ParsePlan {
        path: path.to_path_buf(),
        source,
    })?;

    let plan = raw.into_validated(path)?;
    Ok((plan, diagnostics.drain(..).collect()))
}

fn warn(path: &Path, message: impl Into<String>) -> Diagnostic {
    Diagnostic::new(Severity::Warning, message.into()).with_path(path.to_path_buf())
}

fn config_error(path: &Path, message: impl Into<String>) -> Error {
    Error::config(format!("{}: {}", path.display(), message.into()))
}

fn detect_unknown_fields(value: &toml::Value, path: &Path) -> Vec<Diagnostic> {
    let mut warnings = Vec::new();
    let allowed_root = ["version", "iaas", "level"];

    let toml::Value::Table(table) = value else {
        return warnings;
    };
    warn_table(table, &allowed_root, "root", path, &mut warnings);

    if let Some(toml::Value::Table(iaas)) = table.get("iaas") {
        warn_table(iaas, &["url", "key_ref", "secret_ref"], "[iaas]", path, &mut warnings);
    }

    if let Some(toml::Value::Array(levels)) = table.get("level") {
        for (level_idx, level) in levels.iter().enumerate() {
            let toml::Value::Table(level_table) = level else {
                continue;
            };
            warn_table(
                level_table,
                &["name", "service"],
                &format!("[[level]] #{level_idx}"),
                path,
                &mut warnings,
            );
            if let Some(toml::Value::Array(services)) = level_table.get("service") {
                for (svc_idx, service) in services.iter().enumerate() {
                    let toml::Value::Table(svc_table) = service else {
                        continue;
                    };
                    warn_table(
                        svc_table,
                        &[
                            "name",
                            "image",
                            "hostname",
                            "instance_type",
                            "key_name",
                            "security_groups",
                            "iaas_url",
                            "iaas_key_ref",
                            "iaas_secret_ref",
                            "username",
                            "scp_username",
                            "ssh_port",
                            "localkey",
                            "bootpgm",
                            "bootpgm_args",
                            "readypgm",
                            "readypgm_args",
                            "terminatepgm",
                            "terminatepgm_args",
                            "bootconf",
                            "attrs",
                        ],
                        &format!("[[level.service]] #{svc_idx} (level #{level_idx})"),
                        path,
                        &mut warnings,
                    );
                }
            }
        }
    }

    warnings
}

fn warn_table(
    table: &toml::map::Map<String, toml::Value>,
    allowed: &[&str],
    context: &str,
    path: &Path,
    warnings: &mut Vec<Diagnostic>,
) {
    for key in table.keys() {
        if !allowed.contains(&key.as_str()) {
            warnings.push(warn(
                path,
                format!("unknown field `{key}` at {context}; this value will be ignored"),
            ));
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawPlan {
    version: Option<String>,
    #[serde(default)]
    iaas: Option<RawIaas>,
    #[serde(default, rename = "level")]
    levels: Vec<RawLevel>,
}

#[derive(Debug, Deserialize, Default)]
struct RawIaas {
    url: Option<String>,
    key_ref: Option<String>,
    secret_ref: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawLevel {
    name: Option<String>,
    #[serde(default, rename = "service")]
    services: Vec<RawService>,
}

#[derive(Debug, Deserialize)]
struct RawService {
    name: Option<String>,
    image: Option<String>,
    hostname: Option<String>,
    instance_type: Option<String>,
    key_name: Option<String>,
    #[serde(default)]
    security_groups: Vec<String>,
    iaas_url: Option<String>,
    iaas_key_ref: Option<String>,
    iaas_secret_ref: Option<String>,
    username: Option<String>,
    scp_username: Option<String>,
    ssh_port: Option<u16>,
    localkey: Option<String>,
    bootpgm: Option<String>,
    #[serde(default)]
    bootpgm_args: Vec<String>,
    readypgm: Option<String>,
    #[serde(default)]
    readypgm_args: Vec<String>,
    terminatepgm: Option<String>,
    #[serde(default)]
    terminatepgm_args: Vec<String>,
    bootconf: Option<PathBuf>,
    #[serde(default)]
    attrs: BTreeMap<String, String>,
}

impl RawPlan {
    fn into_validated(self, path: &Path) -> Result<Plan, Error> {
        let version = self
            .version
            .ok_or_else(|| config_error(path, "missing required top-level field `version`"))?;

        if self.levels.is_empty() {
            return Err(config_error(path, "plan must declare at least one [[level]]"));
        }

        let iaas = self
            .iaas
            .map(|raw| IaasDefaults {
                url: raw.url,
                key_ref: raw.key_ref,
                secret_ref: raw.secret_ref,
            })
            .unwrap_or_default();

        let mut seen_names: HashSet<String> = HashSet::new();
        // §3 invariant 5: within a level, no service depends on another
        // service in the same or a later level. Checked here syntactically
        // (substring search against names declared at this level or later),
        // since full reference resolution requires live hostnames.
        let mut names_by_level: Vec<HashSet<String>> = Vec::with_capacity(self.levels.len());
        for level in &self.levels {
            let mut names = HashSet::new();
            for service in &level.services {
                if let Some(name) = &service.name {
                    names.insert(name.clone());
                }
            }
            names_by_level.push(names);
        }

        let mut levels = Vec::with_capacity(self.levels.len());
        for (level_idx, level) in self.levels.into_iter().enumerate() {
            let level_name = level
                .name
                .unwrap_or_else(|| format!("level-{level_idx}"));

            let mut services = Vec::with_capacity(level.services.len());
            for raw in level.services {
                let name = raw.name.ok_or_else(|| {
                    config_error(
                        path,
                        format!("a service in level `{level_name}` is missing `name`"),
                    )
                })?;

                if !seen_names.insert(name.clone()) {
                    return Err(config_error(
                        path,
                        format!("duplicate service name `{name}` across the plan"),
                    ));
                }

                if raw.image.is_some() && raw.hostname.is_some() {
                    return Err(config_error(
                        path,
                        format!("service `{name}` declares both `image` and `hostname`"),
                    ));
                }
                if raw.image.is_none() && raw.hostname.is_none() {
                    return Err(config_error(
                        path,
                        format!("service `{name}` must declare either `image` or `hostname`"),
                    ));
                }

                for value in raw.attrs.values().chain(raw.hostname.iter()) {
                    check_forward_reference(path, &name, value, level_idx, &names_by_level)?;
                }
                if let Some(bootconf) = &raw.bootconf {
                    if !bootconf.exists() {
                        return Err(config_error(
                            path,
                            format!(
                                "service `{name}` declares `bootconf` = `{}` which does not exist",
                                bootconf.display()
                            ),
                        ));
                    }
                }

                let mut record = ServiceRecord::new(name);
                record.image = raw.image;
                record.static_hostname = raw.hostname;
                record.instance_type = raw.instance_type;
                record.key_name = raw.key_name;
                record.security_groups = raw.security_groups;
                record.iaas_url = raw.iaas_url.or_else(|| iaas.url.clone());
                record.iaas_key_ref = raw.iaas_key_ref.or_else(|| iaas.key_ref.clone());
                record.iaas_secret_ref = raw.iaas_secret_ref.or_else(|| iaas.secret_ref.clone());
                record.username = raw.username;
                record.scp_username = raw.scp_username;
                if let Some(port) = raw.ssh_port {
                    record.ssh_port = port;
                }
                record.localkey = raw.localkey;
                record.bootpgm = raw.bootpgm;
                record.bootpgm_args = raw.bootpgm_args;
                record.readypgm = raw.readypgm;
                record.readypgm_args = raw.readypgm_args;
                record.terminatepgm = raw.terminatepgm;
                record.terminatepgm_args = raw.terminatepgm_args;
                record.bootconf = raw.bootconf;
                record.config_attrs = raw.attrs;
                record.state = ServiceState::Pending;

                services.push(record);
            }

            levels.push(PlanLevel {
                name: level_name,
                services,
            });
        }

        Ok(Plan {
            version,
            iaas,
            levels,
        })
    }
}

/// A syntactic check for `${svc.attr}` references that name a service
/// declared at the same or a later level than `referencing_level`.
fn check_forward_reference(
    path: &Path,
    service_name: &str,
    value: &str,
    referencing_level: usize,
    names_by_level: &[HashSet<String>],
) -> Result<(), Error> {
    let mut rest = value;
    while let Some(start) = rest.find("${") {
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else { break };
        let inner = &after[..end];
        if let Some((svc, _attr)) = inner.split_once('.') {
            if !svc.is_empty() {
                for level in &names_by_level[referencing_level..] {
                    if level.contains(svc) {
                        return Err(config_error(
                            path,
                            format!(
                                "service `{service_name}` references `${{{inner}}}`, which names a \
                                 service in the same or a later level"
                            ),
                        ));
                    }
                }
            }
        }
        rest = &after[end + 1..];
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_plan(dir: &Path, contents: &str) -> PathBuf {
        let path = dir.join("plan.toml");
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn loads_a_two_level_plan() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_plan(
            dir.path(),
            r#"
            version = "1"

            [[level]]
            name = "level-0"

            [[level.service]]
            name = "db"
            image = "ami-0123456789"
            bootpgm = "configure-db.sh"

            [[level]]
            name = "level-1"

            [[level.service]]
            name = "app"
            image = "ami-0123456789"
            bootpgm = "configure-app.sh"

            [level.service.attrs]
            db_host = "${db.hostname}"
            "#,
        );

        let (plan, diagnostics) = load_plan(&path).unwrap();
        assert_eq!(plan.levels.len(), 2);
        assert_eq!(plan.levels[0].services[0].name, "db");
        assert_eq!(plan.levels[1].services[0].name, "app");
        assert!(diagnostics.is_empty());
    }

    #[test]
    fn rejects_missing_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_plan(dir.path(), "[[level]]\nname = \"only\"\n");
        let err = load_plan(&path).unwrap_err();
        assert!(matches!(err, Error::ConfigError { .. }));
    }

    #[test]
    fn rejects_image_and_hostname_together() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_plan(
            dir.path(),
            r#"
            version = "1"
            [[level]]
            name = "level-0"
            [[level.service]]
            name = "a"
            image = "ami-1"
            hostname = "10.0.0.1"
            "#,
        );
        let err = load_plan(&path).unwrap_err();
        assert!(matches!(err, Error::ConfigError { .. }));
    }

    #[test]
    fn rejects_duplicate_service_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_plan(
            dir.path(),
            r#"
            version = "1"
            [[level]]
            name = "level-0"
            [[level.service]]
            name = "a"
            image = "ami-1"
            [[level.service]]
            name = "a"
            image = "ami-2"
            "#,
        );
        let err = load_plan(&path).unwrap_err();
        assert!(matches!(err, Error::ConfigError { .. }));
    }

    #[test]
    fn rejects_forward_level_reference() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_plan(
            dir.path(),
            r#"
            version = "1"
            [[level]]
            name = "level-0"
            [[level.service]]
            name = "a"
            image = "ami-1"

            [level.service.attrs]
            peek = "${b.hostname}"

            [[level]]
            name = "level-1"
            [[level.service]]
            name = "b"
            image = "ami-2"
            "#,
        );
        let err = load_plan(&path).unwrap_err();
        assert!(matches!(err, Error::ConfigError { .. }));
    }

    #[test]
    fn warns_on_unknown_field() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_plan(
            dir.path(),
            r#"
            version = "1"
            bogus = true
            [[level]]
            name = "level-0"
            [[level.service]]
            name = "a"
            image = "ami-1"
            "#,
        );
        let (_, diagnostics) = load_plan(&path).unwrap();
        assert!(diagnostics.iter().any(|d| d.message.contains("bogus")));
    }
}
