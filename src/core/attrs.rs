//! Attribute bag, cross-service reference resolution, and template substitution.
//!
//! Grounded on `original_source/cloudinitd/services.py`'s `_do_attr_bag` (reference
//! regex `\$\{(.*?)\.(.*)\}`) and `_fill_template` (a `string.Template`-shaped
//! substitution), reimplemented by hand per the design notes rather than pulled in
//! from a templating crate, since the grammar is intentionally narrow.

use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// Per-service key/value map of strings.
pub type AttrBag = BTreeMap<String, String>;

/// Resolves `svc_name`/`attr` lookups against the top-level service table.
///
/// Implemented by the boot top-level; a service container only ever sees this
/// narrow trait so it cannot reach into sibling services except through it.
pub trait DependencyResolver {
    /// Look up `attr` on `svc_name`. An empty `svc_name` means "self" (`${.attr}`).
    fn find_dep(&self, svc_name: &str, attr: &str) -> Result<String>;
}

/// Expand every `${svc.attr}` reference in `value` using `resolver`, iterating to a
/// fixpoint so references inside looked-up values are themselves expanded.
///
/// A missing service or attribute is a [`Error::ConfigError`]. A value that never
/// stabilizes after a bounded number of iterations is treated as a reference cycle,
/// also a [`Error::ConfigError`].
pub fn resolve_references(value: &str, resolver: &dyn DependencyResolver) -> Result<String> {
    const MAX_ITERATIONS: usize = 32;

    let mut current = value.to_string();
    for _ in 0..MAX_ITERATIONS {
        let (next, replaced_any) = expand_once(&current, resolver)?;
        if !replaced_any {
            return Ok(next);
        }
        current = next;
    }
    Err(Error::config(format!(
        "reference cycle detected while expanding `{value}`"
    )))
}

/// A single pass over `value`, replacing every `${svc.attr}` reference found.
/// Returns the rewritten string and whether any replacement occurred.
fn expand_once(value: &str, resolver: &dyn DependencyResolver) -> Result<(String, bool)> {
    let mut out = String::with_capacity(value.len());
    let mut replaced_any = false;
    let chars: Vec<char> = value.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '$' && chars.get(i + 1) == Some(&'{') {
            let start = i + 2;
            if let Some(rel_close) = chars[start..].iter().position(|&c| c == '}') {
                let close = start + rel_close;
                let inner: String = chars[start..close].iter().collect();
                match inner.split_once('.') {
                    Some((svc_name, attr)) if !attr.is_empty() => {
                        let resolved = resolver.find_dep(svc_name, attr)?;
                        out.push_str(&resolved);
                        replaced_any = true;
                        i = close + 1;
                        continue;
                    }
                    _ => {
                        return Err(Error::config(format!(
                            "malformed reference `${{{inner}}}` (expected `svc.attr`)"
                        )));
                    }
                }
            }
        }
        out.push(chars[i]);
        i += 1;
    }
    Ok((out, replaced_any))
}

/// Render a `$name`/`${name}` template against `bag`.
///
/// Grammar: `$name` or `${name}` substitutes the attribute value; `$$` is a
/// literal `$`. An undefined name is a [`Error::ConfigError`].
pub fn render_template(template: &str, bag: &AttrBag) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let chars: Vec<char> = template.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] != '$' {
            out.push(chars[i]);
            i += 1;
            continue;
        }
        match chars.get(i + 1) {
            Some('$') => {
                out.push('$');
                i += 2;
            }
            Some('{') => {
                let start = i + 2;
                let end = chars[start..]
                    .iter()
                    .position(|&c| c == '}')
                    .map(|p| start + p);
                match end {
                    Some(end) => {
                        let name: String = chars[start..end].iter().collect();
                        out.push_str(lookup(&name, bag)?.as_str());
                        i = end + 1;
                    }
                    None => {
                        return Err(Error::config(format!(
                            "unterminated `${{` placeholder in template at position {i}"
                        )));
                    }
                }
            }
            Some(c) if is_name_start(*c) => {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && is_name_char(chars[end]) {
                    end += 1;
                }
                let name: String = chars[start..end].iter().collect();
                out.push_str(lookup(&name, bag)?.as_str());
                i = end;
            }
            _ => {
                out.push('$');
                i += 1;
            }
        }
    }
    Ok(out)
}

fn lookup<'a>(name: &str, bag: &'a AttrBag) -> Result<&'a String> {
    bag.get(name)
        .ok_or_else(|| Error::config(format!("undefined template name `{name}`")))
}

fn is_name_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Render the same attribute map as shell `export K="V"` lines, for the boot
/// program's environment (the companion file described alongside template
/// rendering).
pub fn render_env_exports(bag: &AttrBag) -> String {
    let mut out = String::new();
    for (key, value) in bag {
        out.push_str("export ");
        out.push_str(key);
        out.push_str("=\"");
        out.push_str(&value.replace('\\', "\\\\").replace('"', "\\\""));
        out.push_str("\"\n");
    }
    out
}
