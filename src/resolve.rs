/*!
 * Command resolution
 *
 * Turns a process's command template into the command line that is executed,
 * applying selected variants and parameter layers. Substitution is a narrow
 * `{name}` replacement: `{{` and `}}` produce literal braces and shell
 * expansions such as `${HOME}` pass through untouched.
 */

use crate::error::{ConcertError, Result};
use crate::graph::{GraphContext, Params, ProcessSpec};
use regex::{Captures, Regex};
use std::borrow::Cow;
use std::sync::LazyLock;

/// Reserved placeholder referring to the command a choice override replaces
const WRAP_POINT: &str = "cmd";

/// Fully resolved command lines of one process
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Resolution {
    /// Command to launch; `None` for pure groups
    pub command: Option<String>,
    /// Readiness probe with parameters substituted
    pub ready_check: Option<String>,
    /// Effective parameter mapping after all layers were merged
    pub params: Params,
}

static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{|\}\}|\$\{[^}]*\}|\{([A-Za-z_][A-Za-z0-9_]*)\}")
        .expect("placeholder regex is valid")
});

/// Resolve the effective command of `spec`
///
/// Parameter precedence, lowest to highest: graph-level params, params of the
/// selected variant choices (later variants win), `overrides`.
pub fn resolve<S: AsRef<str>>(
    context: &GraphContext,
    spec: &ProcessSpec,
    selection: &[S],
    overrides: &Params,
) -> Result<Resolution> {
    let mut params = context.params.clone();
    let mut command = spec.cmd.clone();

    for variant in &spec.variants {
        let Some(choice) = variant.selected(selection) else {
            continue;
        };
        params.extend(choice.params.iter().map(|(k, v)| (k.clone(), v.clone())));
        if let Some(replacement) = &choice.cmd {
            command = Some(match &command {
                Some(previous) => wrap_command(replacement, previous),
                None => replacement.clone(),
            });
        }
    }

    params.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));

    let command = command
        .map(|c| substitute(&c, &params, &spec.name))
        .transpose()?;
    let ready_check = spec
        .ready_check
        .as_deref()
        .map(|c| substitute(c, &params, &spec.name))
        .transpose()?;

    Ok(Resolution {
        command,
        ready_check,
        params,
    })
}

/// Replace `{cmd}` in `replacement` with the raw `previous` template
///
/// Everything else is left for the final substitution pass.
fn wrap_command(replacement: &str, previous: &str) -> String {
    PLACEHOLDER_RE
        .replace_all(replacement, |caps: &Captures| -> String {
            match caps.get(1) {
                Some(key) if key.as_str() == WRAP_POINT => previous.to_string(),
                _ => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Substitute every `{name}` placeholder of `template` from `params`
///
/// A placeholder without a value is a configuration error naming the key.
pub fn substitute(template: &str, params: &Params, process: &str) -> Result<String> {
    let mut missing: Option<String> = None;
    let out = PLACEHOLDER_RE.replace_all(template, |caps: &Captures| -> String {
        let Some(key) = caps.get(1) else {
            return match &caps[0] {
                "{{" => "{".to_string(),
                "}}" => "}".to_string(),
                other => other.to_string(),
            };
        };
        match params.get(key.as_str()) {
            Some(value) => value.clone(),
            None => {
                missing.get_or_insert_with(|| key.as_str().to_string());
                String::new()
            }
        }
    });

    match missing {
        Some(key) => Err(ConcertError::MissingParameter {
            process: process.to_string(),
            key,
        }),
        None => Ok(out.into_owned()),
    }
}

/// Quote `text` as one shell word
///
/// Words made only of safe characters come back unchanged; anything else is
/// single quoted, with embedded quotes spliced in.
pub fn quote(text: &str) -> String {
    shell_escape::unix::escape(Cow::Borrowed(text)).into_owned()
}

/// Wrap `command` so it runs in an interactive bash, sourcing the user's rc files
pub fn interactive(command: &str) -> String {
    format!("bash -ic {}", quote(command))
}
