/*!
 * Per-process progress reporting
 *
 * User-facing output of `run` and `kill`: one line per event, prefixed with
 * `..` per dependency level and tagged with the process name.
 */

use console::{style, StyledObject};
use std::sync::{Arc, Mutex};

/// Styling for progress and status output
pub struct Theme;

impl Theme {
    /// Process names (cyan)
    pub fn name<D: std::fmt::Display>(text: D) -> StyledObject<D> {
        style(text).cyan()
    }

    /// Success color (green)
    pub fn success<D: std::fmt::Display>(text: D) -> StyledObject<D> {
        style(text).green()
    }

    /// Error color (red)
    pub fn error<D: std::fmt::Display>(text: D) -> StyledObject<D> {
        style(text).red()
    }

    /// Muted/secondary text (dim)
    pub fn muted<D: std::fmt::Display>(text: D) -> StyledObject<D> {
        style(text).dim()
    }
}

#[derive(Clone)]
enum Sink {
    Stdout,
    Quiet,
    Capture(Arc<Mutex<Vec<String>>>),
}

/// Progress printer shared by every task of one invocation
#[derive(Clone)]
pub struct Progress {
    sink: Sink,
}

impl Default for Progress {
    fn default() -> Self {
        Self::stdout()
    }
}

impl Progress {
    pub fn stdout() -> Self {
        Self { sink: Sink::Stdout }
    }

    pub fn quiet() -> Self {
        Self { sink: Sink::Quiet }
    }

    /// Record plain lines in memory instead of printing them
    pub fn capture() -> Self {
        Self {
            sink: Sink::Capture(Arc::new(Mutex::new(Vec::new()))),
        }
    }

    /// Lines recorded by a capturing reporter
    pub fn captured(&self) -> Vec<String> {
        match &self.sink {
            Sink::Capture(lines) => lines.lock().map(|l| l.clone()).unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    /// Report `text` for `process` at dependency depth `depth`
    pub fn report(&self, process: &str, depth: usize, text: &str) {
        match &self.sink {
            Sink::Quiet => {}
            Sink::Stdout => {
                let tagged = format!("[{}] {}", Theme::name(process), text);
                println!("{}", indent(&tagged, depth));
            }
            Sink::Capture(lines) => {
                if let Ok(mut lines) = lines.lock() {
                    lines.push(format_line(process, depth, text));
                }
            }
        }
    }

    /// Reporter bound to one process and depth
    pub fn scoped<'a>(&'a self, process: &'a str, depth: usize) -> Scoped<'a> {
        Scoped {
            progress: self,
            process,
            depth,
        }
    }
}

/// Plain (unstyled) progress line
pub fn format_line(process: &str, depth: usize, text: &str) -> String {
    indent(&format!("[{}] {}", process, text), depth)
}

fn indent(text: &str, depth: usize) -> String {
    if depth == 0 {
        return text.to_string();
    }
    textwrap::indent(text, &"..".repeat(depth))
        .trim_end_matches('\n')
        .to_string()
}

/// Progress reporter for one process
#[derive(Clone, Copy)]
pub struct Scoped<'a> {
    progress: &'a Progress,
    process: &'a str,
    depth: usize,
}

impl Scoped<'_> {
    pub fn say(&self, text: &str) {
        self.progress.report(self.process, self.depth, text);
    }
}
