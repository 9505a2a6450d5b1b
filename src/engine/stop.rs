//! Stop path: dependents first, then signal with escalation

use futures::future::join_all;
use futures::FutureExt;
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{info, warn};

use super::{join_outcomes, Engine, Memo, Outcome, Step};
use crate::error::Result;
use crate::graph::ProcessSpec;
use crate::progress::Scoped;
use crate::session::{Signal, Tmux};

pub(super) struct StopRun<'e> {
    engine: &'e Engine,
    force: bool,
    memo: Memo,
}

impl<'e> StopRun<'e> {
    pub(super) fn new(engine: &'e Engine, force: bool) -> Self {
        Self {
            engine,
            force,
            memo: Memo::default(),
        }
    }

    pub(super) fn stop(&self, name: String, depth: usize) -> Step<'_> {
        async move {
            self.memo
                .once(&name, || async {
                    self.drive(&name, depth).await.map_err(Arc::new)
                })
                .await
        }
        .boxed()
    }

    /// Stop several processes concurrently and wait for all of them
    async fn stop_all(&self, names: &[&str], depth: usize) -> Result<bool> {
        let outcomes: Vec<Outcome> =
            join_all(names.iter().map(|n| self.stop(n.to_string(), depth))).await;
        join_outcomes(names.iter().copied(), outcomes)
    }

    async fn drive(&self, name: &str, depth: usize) -> Result<bool> {
        let spec = self.engine.graph.get(name)?;
        let say = self.engine.progress.scoped(&spec.name, depth);

        let dependents: Vec<&str> = self
            .engine
            .graph
            .dependents_of(&spec.name)
            .filter(|p| p.persistent)
            .map(|p| p.name.as_str())
            .collect();
        for dependent in &dependents {
            say.say(&format!("found dependant process {}", dependent));
        }
        let dependents_ok = self.stop_all(&dependents, depth + 1).await?;

        if !spec.persistent {
            // Group semantics: no window of its own, cascade to what it depends on
            let mut depends: Vec<&str> = Vec::with_capacity(spec.depends.len());
            for dep in &spec.depends {
                if !depends.contains(&dep.as_str()) {
                    depends.push(dep);
                }
            }
            let depends_ok = self.stop_all(&depends, depth + 1).await?;
            return Ok(dependents_ok && depends_ok);
        }

        self.terminate(spec, &say).await?;
        Ok(dependents_ok)
    }

    /// Signal the window and wait for it to die, escalating once
    async fn terminate(&self, spec: &ProcessSpec, say: &Scoped<'_>) -> Result<()> {
        let channel = self.engine.pool.get(&spec.machine).await?;
        let tmux = Tmux::new(channel, &self.engine.config.helper_dir);

        match tmux.window(&spec.session, &spec.name).await? {
            None => {
                say.say("not running");
                return Ok(());
            }
            Some(window) if window.dead => {
                say.say("already dead");
                return Ok(());
            }
            Some(_) => {}
        }

        let signal = if self.force || spec.force_sigquit {
            Signal::Kill
        } else {
            Signal::Interrupt
        };
        say.say(&format!("killing with {}", signal.name()));
        tmux.send_signal(&spec.session, &spec.name, signal).await?;

        let config = &self.engine.config;
        let mut attempts: u32 = 0;
        loop {
            sleep(config.stop_poll_interval()).await;
            if !tmux.alive(&spec.session, &spec.name).await? {
                break;
            }
            attempts += 1;
            if attempts == config.escalate_after {
                warn!(
                    "{} still alive after {} polls, escalating",
                    spec.name, attempts
                );
                say.say(&format!("still alive, killing with {}", Signal::Kill.name()));
                tmux.send_signal(&spec.session, &spec.name, Signal::Kill)
                    .await?;
            }
        }

        info!("{} stopped", spec.name);
        say.say("stopped");
        Ok(())
    }
}
