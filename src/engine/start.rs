//! Start path: dependencies first, then launch and wait for readiness

use concert_core_interface::RemoteChannel;
use futures::future::join_all;
use futures::FutureExt;
use std::sync::Arc;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use super::{create_marker, join_outcomes, remove_marker, Engine, Memo, Outcome, Step};
use crate::error::{ConcertError, Result};
use crate::graph::{Params, ProcessSpec};
use crate::progress::Scoped;
use crate::resolve::{interactive, resolve};
use crate::session::Tmux;

/// Caller-supplied inputs of `run`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StartRequest {
    /// Highest-precedence parameter overrides (`--params k:=v`)
    pub params: Params,
    /// Selected variant or choice names (`--variants name`)
    pub variants: Vec<String>,
}

impl StartRequest {
    /// Parse `k:=v` pairs
    pub fn parse_params<S: AsRef<str>>(pairs: &[S]) -> Result<Params> {
        let mut params = Params::new();
        for pair in pairs {
            let pair = pair.as_ref();
            let (key, value) = pair.split_once(":=").ok_or_else(|| {
                ConcertError::Config(format!("parameter '{}' is not of the form key:=value", pair))
            })?;
            if key.is_empty() {
                return Err(ConcertError::Config(format!(
                    "parameter '{}' has an empty key",
                    pair
                )));
            }
            params.insert(key.to_string(), value.to_string());
        }
        Ok(params)
    }
}

pub(super) struct StartRun<'e> {
    engine: &'e Engine,
    request: &'e StartRequest,
    memo: Memo,
}

impl<'e> StartRun<'e> {
    pub(super) fn new(engine: &'e Engine, request: &'e StartRequest) -> Self {
        Self {
            engine,
            request,
            memo: Memo::default(),
        }
    }

    pub(super) fn start(&self, name: String, depth: usize) -> Step<'_> {
        async move {
            self.memo
                .once(&name, || async {
                    self.drive(&name, depth).await.map_err(Arc::new)
                })
                .await
        }
        .boxed()
    }

    async fn drive(&self, name: &str, depth: usize) -> Result<bool> {
        let spec = self.engine.graph.get(name)?;
        let say = self.engine.progress.scoped(&spec.name, depth);
        let resolution = resolve(
            self.engine.graph.context(),
            spec,
            &self.request.variants,
            &self.request.params,
        )?;

        let channel = self.engine.pool.get(&spec.machine).await?;
        let marker = self.engine.marker_path(spec);
        create_marker(channel.as_ref(), &marker).await?;

        let result = async {
            let deps_ok = self.start_dependencies(spec, depth, &say).await?;
            let own_ok = match &resolution.command {
                None => {
                    debug!("{} is a group, nothing to launch", spec.name);
                    true
                }
                Some(command) if !spec.persistent => {
                    self.run_once(channel.as_ref(), command, &say).await?
                }
                Some(command) => {
                    self.launch(
                        channel.clone(),
                        spec,
                        command,
                        resolution.ready_check.as_deref(),
                        &say,
                    )
                    .await?;
                    true
                }
            };
            Ok::<_, ConcertError>(deps_ok && own_ok)
        }
        .await;

        remove_marker(channel.as_ref(), &marker).await;
        result
    }

    /// Start every dependency concurrently and wait for all of them
    async fn start_dependencies(
        &self,
        spec: &ProcessSpec,
        depth: usize,
        say: &Scoped<'_>,
    ) -> Result<bool> {
        if spec.depends.is_empty() {
            return Ok(true);
        }
        for dep in &spec.depends {
            say.say(&format!("depends on {}", dep));
        }

        let outcomes: Vec<Outcome> = join_all(
            spec.depends
                .iter()
                .map(|dep| self.start(dep.clone(), depth + 1)),
        )
        .await;
        let ok = join_outcomes(spec.depends.iter().map(String::as_str), outcomes)?;
        if !ok {
            say.say("some dependencies failed");
        }
        Ok(ok)
    }

    /// One-shot command: run it, echo its output, report the exit code
    async fn run_once(
        &self,
        channel: &dyn RemoteChannel,
        command: &str,
        say: &Scoped<'_>,
    ) -> Result<bool> {
        say.say("running command");
        let output = channel.run(&interactive(command)).await?;
        for line in output.stdout.lines() {
            say.say(&format!("[stdout] {}", line));
        }
        if output.success() {
            say.say("success");
            Ok(true)
        } else {
            say.say(&format!("failed (exit code {})", output.exit_code));
            Ok(false)
        }
    }

    /// Persistent process: spawn unless alive, then wait for readiness
    async fn launch(
        &self,
        channel: Arc<dyn RemoteChannel>,
        spec: &ProcessSpec,
        command: &str,
        ready_check: Option<&str>,
        say: &Scoped<'_>,
    ) -> Result<()> {
        let tmux = Tmux::new(channel.clone(), &self.engine.config.helper_dir);

        if tmux.alive(&spec.session, &spec.name).await? {
            say.say("exists");
        } else {
            say.say("running process");
            tmux.spawn_or_respawn(&spec.session, &spec.name, command)
                .await?;
        }

        if let Some(check) = ready_check {
            say.say("checking for readiness");
            self.wait_ready(channel.as_ref(), &tmux, spec, check).await?;
        }

        info!("{} ready", spec.name);
        say.say("ready");
        Ok(())
    }

    /// Poll `check` until it exits 0, failing if the window dies meanwhile
    async fn wait_ready(
        &self,
        channel: &dyn RemoteChannel,
        tmux: &Tmux,
        spec: &ProcessSpec,
        check: &str,
    ) -> Result<()> {
        let interval = self.engine.config.ready_poll_interval();
        let probe = interactive(check);
        loop {
            let started = Instant::now();

            if !tmux.alive(&spec.session, &spec.name).await? {
                return Err(ConcertError::ReadinessFailed {
                    session: spec.session.clone(),
                    window: spec.name.clone(),
                });
            }

            let output = channel.run(&probe).await?;
            if output.success() {
                debug!("ready check for {} returned 0", spec.name);
                return Ok(());
            }
            debug!(
                "ready check for {} returned {}",
                spec.name, output.exit_code
            );

            sleep(interval.saturating_sub(started.elapsed())).await;
        }
    }
}
