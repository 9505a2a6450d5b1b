//! YAML loading and whole-document validation

use super::{
    Choice, GraphContext, Machine, Params, ProcessGraph, ProcessSpec, RemoteHost, Variant,
    LOCAL_HOST,
};
use crate::error::{ConcertError, Result};
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use std::path::Path;
use tracing::debug;

/// Reserved top-level key holding the graph context
const CONTEXT_KEY: &str = "context";

/// Placeholder that refers to the command a choice override replaces
pub(crate) const CMD_PLACEHOLDER: &str = "cmd";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawContext {
    session: Option<String>,
    #[serde(default)]
    params: Mapping,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawProcess {
    machine: Option<String>,
    cmd: Option<String>,
    ready_check: Option<String>,
    #[serde(default = "default_persistent")]
    persistent: bool,
    session: Option<String>,
    #[serde(default)]
    depends: Vec<String>,
    #[serde(default)]
    variants: Mapping,
    #[serde(default)]
    force_sigquit: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawChoice {
    #[serde(default)]
    params: Mapping,
    cmd: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawVariant {
    Multi {
        choices: Mapping,
    },
    Single(RawChoice),
}

fn default_persistent() -> bool {
    true
}

/// Read and validate the configuration document at `path`
pub fn load_graph(path: &Path) -> Result<ProcessGraph> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        ConcertError::Config(format!("cannot read {}: {}", path.display(), e))
    })?;
    let graph = parse_document(&text)?;
    debug!(
        "Loaded {} processes from {}",
        graph.len(),
        path.display()
    );
    Ok(graph)
}

pub(super) fn parse_document(text: &str) -> Result<ProcessGraph> {
    let document: Mapping = serde_yaml::from_str(text)?;

    let raw_context = match document.get(CONTEXT_KEY) {
        Some(value) => serde_yaml::from_value::<RawContext>(value.clone())
            .map_err(|e| ConcertError::Config(format!("context: {}", e)))?,
        None => {
            return Err(ConcertError::Config(
                "missing required 'context' section".to_string(),
            ))
        }
    };

    let session = raw_context
        .session
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ConcertError::Config("context.session is required".to_string()))?;
    let context = GraphContext {
        params: scalar_params(&raw_context.params, "context.params")?,
        session,
    };

    let mut processes = Vec::with_capacity(document.len().saturating_sub(1));
    for (key, value) in &document {
        let name = key_string(key, "process name")?;
        if name == CONTEXT_KEY {
            continue;
        }
        let raw: RawProcess = serde_yaml::from_value(value.clone())
            .map_err(|e| ConcertError::Config(format!("process '{}': {}", name, e)))?;
        processes.push(build_process(name, raw, &context)?);
    }

    ProcessGraph::new(context, processes)
}

fn build_process(name: String, raw: RawProcess, context: &GraphContext) -> Result<ProcessSpec> {
    let machine = match raw.machine.as_deref() {
        None => Machine::Local,
        Some(text) => parse_machine(text)
            .map_err(|reason| ConcertError::Config(format!("process '{}': {}", name, reason)))?,
    };

    let mut variants = Vec::with_capacity(raw.variants.len());
    for (key, value) in &raw.variants {
        let variant_name = key_string(key, "variant name")?;
        let raw_variant: RawVariant = serde_yaml::from_value(value.clone()).map_err(|e| {
            ConcertError::Config(format!(
                "process '{}', variant '{}': {}",
                name, variant_name, e
            ))
        })?;
        variants.push(build_variant(&name, variant_name, raw_variant)?);
    }

    Ok(ProcessSpec {
        session: raw.session.unwrap_or_else(|| context.session.clone()),
        machine,
        cmd: raw.cmd,
        ready_check: raw.ready_check,
        persistent: raw.persistent,
        depends: raw.depends,
        variants,
        force_sigquit: raw.force_sigquit,
        name,
    })
}

fn build_variant(process: &str, name: String, raw: RawVariant) -> Result<Variant> {
    let build_choice = |choice_name: String, raw: RawChoice| -> Result<Choice> {
        let what = format!("process '{}', choice '{}'", process, choice_name);
        Ok(Choice {
            params: scalar_params(&raw.params, &what)?,
            cmd: raw.cmd,
            name: choice_name,
        })
    };

    let choices = match raw {
        RawVariant::Single(choice) => vec![build_choice(name.clone(), choice)?],
        RawVariant::Multi { choices } => {
            if choices.is_empty() {
                return Err(ConcertError::Config(format!(
                    "process '{}', variant '{}': choices must not be empty",
                    process, name
                )));
            }
            let mut built = Vec::with_capacity(choices.len());
            for (key, value) in &choices {
                let choice_name = key_string(key, "choice name")?;
                let raw_choice: RawChoice = serde_yaml::from_value(value.clone()).map_err(|e| {
                    ConcertError::Config(format!(
                        "process '{}', choice '{}': {}",
                        process, choice_name, e
                    ))
                })?;
                built.push(build_choice(choice_name, raw_choice)?);
            }
            built
        }
    };

    Ok(Variant { name, choices })
}

/// Parse a `machine` value: "local" or `[user@]host[:port]`
pub fn parse_machine(text: &str) -> std::result::Result<Machine, String> {
    let text = text.trim();
    if text.is_empty() {
        return Err("machine must not be empty".to_string());
    }
    if text == LOCAL_HOST {
        return Ok(Machine::Local);
    }

    let (user, rest) = match text.split_once('@') {
        Some((user, rest)) if !user.is_empty() => (Some(user.to_string()), rest),
        Some(_) => return Err(format!("invalid machine '{}': empty user", text)),
        None => (None, text),
    };

    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| format!("invalid machine '{}': bad port '{}'", text, port))?;
            (host, Some(port))
        }
        None => (rest, None),
    };

    if host.is_empty() || host.contains('@') {
        return Err(format!("invalid machine '{}': expected user@host[:port]", text));
    }

    Ok(Machine::Remote(RemoteHost::new(user, host, port)))
}

fn key_string(key: &Value, what: &str) -> Result<String> {
    match key {
        Value::String(s) => Ok(s.clone()),
        other => Err(ConcertError::Config(format!(
            "{} must be a string, got {:?}",
            what, other
        ))),
    }
}

fn scalar_params(mapping: &Mapping, what: &str) -> Result<Params> {
    let mut params = Params::new();
    for (key, value) in mapping {
        let key = key_string(key, "parameter name")?;
        let value = match value {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            _ => {
                return Err(ConcertError::Config(format!(
                    "{}: parameter '{}' must be a scalar",
                    what, key
                )))
            }
        };
        params.insert(key, value);
    }
    Ok(params)
}

/// Names end up as tmux window and session names and in file paths
fn valid_process_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Whole-document checks run before anything is executed
pub(super) fn validate(graph: &ProcessGraph) -> Result<()> {
    if graph.context.params.contains_key(CMD_PLACEHOLDER) {
        return Err(reserved_param("context.params"));
    }

    for spec in &graph.processes {
        if !valid_process_name(&spec.name) {
            return Err(ConcertError::Config(format!(
                "process name '{}' may only contain letters, digits, '_' and '-'",
                spec.name
            )));
        }
        if !valid_process_name(&spec.session) {
            return Err(ConcertError::Config(format!(
                "process '{}': session '{}' may only contain letters, digits, '_' and '-'",
                spec.name, spec.session
            )));
        }
        if spec.persistent && spec.cmd.is_none() {
            return Err(ConcertError::Config(format!(
                "process '{}': persistent processes require 'cmd'",
                spec.name
            )));
        }
        if spec.is_group() && spec.ready_check.is_some() {
            return Err(ConcertError::Config(format!(
                "process '{}': a group without 'cmd' cannot have a ready_check",
                spec.name
            )));
        }
        for dep in &spec.depends {
            if !graph.contains(dep) {
                return Err(ConcertError::Config(format!(
                    "process '{}' depends on unknown process '{}'",
                    spec.name, dep
                )));
            }
        }
        for choice in spec.variants.iter().flat_map(|v| v.choices.iter()) {
            if choice.params.contains_key(CMD_PLACEHOLDER) {
                return Err(reserved_param(&format!(
                    "process '{}', choice '{}'",
                    spec.name, choice.name
                )));
            }
        }
    }

    if let Some(cycle) = find_cycle(graph) {
        return Err(ConcertError::DependencyCycle(cycle));
    }

    Ok(())
}

fn reserved_param(what: &str) -> ConcertError {
    ConcertError::Config(format!(
        "{}: '{}' is reserved and cannot be used as a parameter name",
        what, CMD_PLACEHOLDER
    ))
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Depth-first search with colouring; returns the cycle path (first == last)
fn find_cycle(graph: &ProcessGraph) -> Option<Vec<String>> {
    let mut marks = vec![Mark::Unvisited; graph.processes.len()];
    let mut stack = Vec::new();
    for i in 0..graph.processes.len() {
        if marks[i] == Mark::Unvisited {
            if let Some(cycle) = visit(graph, i, &mut marks, &mut stack) {
                return Some(cycle);
            }
        }
    }
    None
}

fn visit(
    graph: &ProcessGraph,
    i: usize,
    marks: &mut [Mark],
    stack: &mut Vec<usize>,
) -> Option<Vec<String>> {
    marks[i] = Mark::InProgress;
    stack.push(i);

    for dep in &graph.processes[i].depends {
        let Some(j) = graph.index_of(dep) else {
            continue;
        };
        match marks[j] {
            Mark::InProgress => {
                let start = stack.iter().position(|&k| k == j).unwrap_or(0);
                let mut path: Vec<String> = stack[start..]
                    .iter()
                    .map(|&k| graph.processes[k].name.clone())
                    .collect();
                path.push(graph.processes[j].name.clone());
                return Some(path);
            }
            Mark::Unvisited => {
                if let Some(cycle) = visit(graph, j, marks, stack) {
                    return Some(cycle);
                }
            }
            Mark::Done => {}
        }
    }

    stack.pop();
    marks[i] = Mark::Done;
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const DEMO: &str = r#"
context:
  session: demo
  params: {robot: alpha, rate: 10, sim: false}
roscore:
  cmd: roscore
  ready_check: rostopic list
bringup:
  machine: user@robot:2222
  cmd: roslaunch bringup {robot}.launch
  depends: [roscore]
  session: robot
  force_sigquit: true
  variants:
    verbose:
      cmd: "{cmd} --screen"
    sim:
      choices:
        gazebo: {params: {robot: sim_alpha}}
        stage:  {params: {robot: stage_alpha}}
all:
  persistent: false
  depends: [bringup]
"#;

    #[test]
    fn test_parse_full_document() {
        let graph = ProcessGraph::from_yaml_str(DEMO).unwrap();
        assert_eq!(graph.context().session, "demo");
        assert_eq!(graph.context().params["rate"], "10");
        assert_eq!(graph.context().params["sim"], "false");
        assert_eq!(
            graph.names().collect::<Vec<_>>(),
            vec!["roscore", "bringup", "all"]
        );

        let roscore = graph.get("roscore").unwrap();
        assert_eq!(roscore.machine, Machine::Local);
        assert!(roscore.persistent);
        assert_eq!(roscore.session, "demo");
        assert_eq!(roscore.ready_check.as_deref(), Some("rostopic list"));

        let bringup = graph.get("bringup").unwrap();
        assert_eq!(bringup.machine.host_id(), "user@robot:2222");
        assert_eq!(bringup.session, "robot");
        assert!(bringup.force_sigquit);
        assert_eq!(bringup.variants.len(), 2);
        assert_eq!(bringup.variants[0].name, "verbose");
        assert_eq!(bringup.variants[0].choices[0].name, "verbose");
        assert_eq!(
            bringup.variants[0].choices[0].cmd.as_deref(),
            Some("{cmd} --screen")
        );
        let sim = &bringup.variants[1];
        assert_eq!(sim.choices.len(), 2);
        assert_eq!(sim.choices[1].params["robot"], "stage_alpha");

        assert!(graph.get("all").unwrap().is_group());
    }

    #[test]
    fn test_missing_context_session() {
        let err = ProcessGraph::from_yaml_str("context: {params: {a: 1}}\np: {cmd: x}\n")
            .unwrap_err();
        assert!(err.to_string().contains("context.session"));

        let err = ProcessGraph::from_yaml_str("p: {cmd: x}\n").unwrap_err();
        assert!(err.to_string().contains("context"));
    }

    #[test]
    fn test_persistent_requires_cmd() {
        let err = ProcessGraph::from_yaml_str("context: {session: s}\np: {machine: local}\n")
            .unwrap_err();
        assert!(err.to_string().contains("require 'cmd'"));
    }

    #[test]
    fn test_unknown_dependency() {
        let err =
            ProcessGraph::from_yaml_str("context: {session: s}\np: {cmd: x, depends: [q]}\n")
                .unwrap_err();
        assert!(err.to_string().contains("unknown process 'q'"));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = ProcessGraph::from_yaml_str("context: {session: s}\np: {cmd: x, persistant: false}\n")
            .unwrap_err();
        assert!(err.to_string().contains("process 'p'"));
    }

    #[test]
    fn test_cycle_rejected_with_path() {
        let doc = r#"
context: {session: s}
a: {cmd: a, depends: [b]}
b: {cmd: b, depends: [c]}
c: {cmd: c, depends: [a]}
"#;
        match ProcessGraph::from_yaml_str(doc) {
            Err(ConcertError::DependencyCycle(path)) => {
                assert_eq!(path, vec!["a", "b", "c", "a"]);
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let err = ProcessGraph::from_yaml_str("context: {session: s}\na: {cmd: a, depends: [a]}\n")
            .unwrap_err();
        assert!(matches!(err, ConcertError::DependencyCycle(ref p) if p == &["a", "a"]));
    }

    #[test]
    fn test_diamond_with_duplicates_is_not_cycle() {
        let doc = r#"
context: {session: s}
top: {cmd: t, depends: [left, right, left]}
left: {cmd: l, depends: [base]}
right: {cmd: r, depends: [base]}
base: {cmd: b}
"#;
        assert!(ProcessGraph::from_yaml_str(doc).is_ok());
    }

    #[test]
    fn test_non_scalar_param_rejected() {
        let err = ProcessGraph::from_yaml_str("context: {session: s, params: {a: [1, 2]}}\n")
            .unwrap_err();
        assert!(err.to_string().contains("must be a scalar"));
    }

    #[test]
    fn test_reserved_cmd_param_rejected() {
        let err = ProcessGraph::from_yaml_str("context: {session: s, params: {cmd: x}}\n")
            .unwrap_err();
        assert!(err.to_string().contains("reserved"));
    }

    #[test]
    fn test_invalid_process_name() {
        let err = ProcessGraph::from_yaml_str("context: {session: s}\n\"a:b\": {cmd: x}\n")
            .unwrap_err();
        assert!(err.to_string().contains("may only contain"));
    }

    #[test]
    fn test_invalid_session_name() {
        let err = ProcessGraph::from_yaml_str("context: {session: 'my demo'}
a: {cmd: x}
")
            .unwrap_err();
        assert!(err.to_string().contains("session 'my demo'"));
    }

    #[test]
    fn test_empty_choices_rejected() {
        let doc = "context: {session: s}\np: {cmd: x, variants: {v: {choices: {}}}}\n";
        let err = ProcessGraph::from_yaml_str(doc).unwrap_err();
        assert!(err.to_string().contains("choices must not be empty"));
    }

    #[test]
    fn test_parse_machine() {
        assert_eq!(parse_machine("local").unwrap(), Machine::Local);
        match parse_machine("bob@host").unwrap() {
            Machine::Remote(r) => {
                assert_eq!(r.user.as_deref(), Some("bob"));
                assert_eq!(r.host, "host");
                assert_eq!(r.port, None);
            }
            other => panic!("unexpected {:?}", other),
        }
        match parse_machine("host:2200").unwrap() {
            Machine::Remote(r) => {
                assert_eq!(r.user, None);
                assert_eq!(r.port, Some(2200));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(parse_machine("bob@host:port").is_err());
        assert!(parse_machine("@host").is_err());
        assert!(parse_machine("").is_err());
    }

    #[test]
    fn test_load_graph_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(DEMO.as_bytes()).unwrap();
        let graph = load_graph(file.path()).unwrap();
        assert_eq!(graph.len(), 3);

        let err = load_graph(Path::new("/nonexistent/concert.yaml")).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("cannot read"));
    }
}
