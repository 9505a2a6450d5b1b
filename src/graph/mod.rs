/*!
 * Typed process graph
 *
 * A `ProcessGraph` is built once per invocation from the YAML document and is
 * read-only afterwards. Every dependency name it holds is known to resolve and
 * the dependency relation is acyclic.
 */

mod loader;

pub use loader::{load_graph, parse_machine};

use crate::error::{ConcertError, Result};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Parameter mapping (name -> value) used for template substitution
pub type Params = BTreeMap<String, String>;

/// Host identity of the pseudo-host that runs commands as local subprocesses
pub const LOCAL_HOST: &str = "local";

/// Where a process runs
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Machine {
    /// The machine running concert itself
    Local,
    /// A machine reached over SSH
    Remote(RemoteHost),
}

impl Machine {
    /// Key used to pool connections: "local" or the `user@host[:port]` string
    pub fn host_id(&self) -> &str {
        match self {
            Machine::Local => LOCAL_HOST,
            Machine::Remote(remote) => &remote.identity,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Machine::Local)
    }
}

impl fmt::Display for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.host_id())
    }
}

/// SSH destination parsed from `[user@]host[:port]`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteHost {
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    identity: String,
}

impl RemoteHost {
    pub fn new(user: Option<String>, host: impl Into<String>, port: Option<u16>) -> Self {
        let host = host.into();
        let mut identity = match &user {
            Some(user) => format!("{}@{}", user, host),
            None => host.clone(),
        };
        if let Some(port) = port {
            identity.push_str(&format!(":{}", port));
        }
        Self {
            user,
            host,
            port,
            identity,
        }
    }

    /// The original `[user@]host[:port]` string
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Destination argument for the `ssh` command line tool
    pub fn ssh_destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }
}

/// Graph-level defaults shared by every process
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphContext {
    /// Session used by processes that do not name their own
    pub session: String,
    /// Global parameters, lowest precedence during resolution
    pub params: Params,
}

/// One selectable alternative of a variant
#[derive(Debug, Clone, PartialEq)]
pub struct Choice {
    pub name: String,
    pub params: Params,
    /// Replacement command; `{cmd}` inside it stands for the command it replaces
    pub cmd: Option<String>,
}

/// A named choice point of a process
///
/// A single-choice variant has exactly one choice carrying the variant's own
/// name, so selecting the variant by name selects that choice.
#[derive(Debug, Clone, PartialEq)]
pub struct Variant {
    pub name: String,
    pub choices: Vec<Choice>,
}

impl Variant {
    /// The choice picked by the caller's selection, if any
    ///
    /// When several selected names match, the first choice in document order
    /// wins.
    pub fn selected<'a, S: AsRef<str>>(&'a self, selection: &[S]) -> Option<&'a Choice> {
        self.choices
            .iter()
            .find(|c| selection.iter().any(|s| s.as_ref() == c.name))
    }
}

/// A named unit of the graph
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSpec {
    pub name: String,
    pub machine: Machine,
    pub cmd: Option<String>,
    pub ready_check: Option<String>,
    pub persistent: bool,
    pub session: String,
    pub depends: Vec<String>,
    pub variants: Vec<Variant>,
    pub force_sigquit: bool,
}

impl ProcessSpec {
    /// Non-persistent process without a command: only cascades to its dependencies
    pub fn is_group(&self) -> bool {
        !self.persistent && self.cmd.is_none()
    }

    pub fn depends_on(&self, name: &str) -> bool {
        self.depends.iter().any(|d| d == name)
    }

    /// File on the target host that `watch` follows
    pub fn stdout_path(&self) -> String {
        format!("/tmp/{}.stdout", self.name)
    }
}

/// The validated configuration document
#[derive(Debug, Clone)]
pub struct ProcessGraph {
    context: GraphContext,
    processes: Vec<ProcessSpec>,
    index: HashMap<String, usize>,
}

impl ProcessGraph {
    /// Parse and validate a YAML document
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        loader::parse_document(text)
    }

    /// Build a graph from already-typed parts, validating it as a whole
    pub fn new(context: GraphContext, processes: Vec<ProcessSpec>) -> Result<Self> {
        let mut index = HashMap::with_capacity(processes.len());
        for (i, spec) in processes.iter().enumerate() {
            if index.insert(spec.name.clone(), i).is_some() {
                return Err(ConcertError::Config(format!(
                    "process '{}' is defined twice",
                    spec.name
                )));
            }
        }

        let graph = Self {
            context,
            processes,
            index,
        };
        loader::validate(&graph)?;
        Ok(graph)
    }

    pub fn context(&self) -> &GraphContext {
        &self.context
    }

    /// Look up a process, failing with `UnknownProcess`
    pub fn get(&self, name: &str) -> Result<&ProcessSpec> {
        self.index
            .get(name)
            .map(|&i| &self.processes[i])
            .ok_or_else(|| ConcertError::UnknownProcess(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Processes in document order
    pub fn iter(&self) -> impl Iterator<Item = &ProcessSpec> {
        self.processes.iter()
    }

    /// Process names in document order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.processes.iter().map(|p| p.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    /// Every other process listing `name` in its `depends`
    pub fn dependents_of<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a ProcessSpec> {
        self.processes
            .iter()
            .filter(move |p| p.name != name && p.depends_on(name))
    }

    /// All processes in dependency order (dependencies before dependents),
    /// each exactly once
    pub fn dependency_order(&self) -> Vec<&ProcessSpec> {
        let mut visited = vec![false; self.processes.len()];
        let mut order = Vec::with_capacity(self.processes.len());
        for i in 0..self.processes.len() {
            self.visit_post_order(i, &mut visited, &mut order);
        }
        order
    }

    /// `name` and everything it transitively depends on, dependencies first
    pub fn dependency_closure(&self, name: &str) -> Result<Vec<&ProcessSpec>> {
        let i = self
            .index_of(name)
            .ok_or_else(|| ConcertError::UnknownProcess(name.to_string()))?;
        let mut visited = vec![false; self.processes.len()];
        let mut order = Vec::new();
        self.visit_post_order(i, &mut visited, &mut order);
        Ok(order)
    }

    fn visit_post_order<'a>(
        &'a self,
        i: usize,
        visited: &mut [bool],
        order: &mut Vec<&'a ProcessSpec>,
    ) {
        if visited[i] {
            return;
        }
        visited[i] = true;
        for dep in &self.processes[i].depends {
            if let Some(&j) = self.index.get(dep) {
                self.visit_post_order(j, visited, order);
            }
        }
        order.push(&self.processes[i]);
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }
}
