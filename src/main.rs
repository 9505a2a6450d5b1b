/*!
 * Concert CLI - Command Line Interface
 *
 * Loads the process graph once, wires the engine to the system connector
 * and maps every verb onto an engine operation.
 */

use clap::{Parser, Subcommand, ValueEnum};
use concert::{
    config::{EngineConfig, LogLevel, SshSettings},
    error::{ConcertError, Result, EXIT_FAILURE, EXIT_SUCCESS},
    load_graph, logging, monitor,
    progress::Theme,
    ConnectionPool, Engine, HelperResources, ProcessStatus, Progress, StartRequest,
    StatusOptions, SystemConnector,
};
use console::Term;
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "concert")]
#[command(version, about = "Dependency-aware process launcher over tmux, locally and over SSH", long_about = None)]
struct Cli {
    /// Process graph (YAML)
    #[arg(short = 'c', long, value_name = "PATH", env = "CONCERT_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Log level
    #[arg(short = 'l', long, value_enum, default_value = "warn", global = true)]
    log_level: LogLevelArg,

    /// Write JSON logs to this file instead of stderr
    #[arg(long, value_name = "FILE", global = true)]
    log_file: Option<PathBuf>,

    /// Enable verbose logging (equivalent to --log-level=debug)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// SSH private key tried after the agent
    #[arg(long, value_name = "PATH", global = true)]
    identity: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a process and everything it depends on
    Run {
        process: String,

        /// Parameter overrides as key:=value
        #[arg(long, num_args = 1.., value_name = "KEY:=VALUE")]
        params: Vec<String>,

        /// Variants or choices to select
        #[arg(long, num_args = 1.., value_name = "NAME")]
        variants: Vec<String>,

        /// Also open the monitor session for the process
        #[arg(long)]
        monitor: bool,
    },

    /// Stop a process and everything depending on it
    Kill {
        process: Option<String>,

        /// Stop every process
        #[arg(long, conflicts_with = "process")]
        all: bool,

        /// Use the forced signal from the start
        #[arg(long)]
        force: bool,
    },

    /// Show the state of every persistent process
    Status {
        /// Redraw every second until interrupted
        #[arg(long)]
        watch: bool,

        /// Show the process tree under every running process
        #[arg(long)]
        pstree: bool,

        /// Print JSON instead of status lines
        #[arg(long, conflicts_with = "watch")]
        json: bool,
    },

    /// Follow the output of a process
    Watch {
        process: String,

        /// Lines of history shown first
        #[arg(short = 'n', long, default_value = "20")]
        num_lines: usize,
    },

    /// Open the tiled monitor session
    Mon {
        /// Recreate the monitor session when it already exists
        #[arg(long)]
        replace: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevelArg {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevelArg> for LogLevel {
    fn from(arg: LogLevelArg) -> Self {
        match arg {
            LogLevelArg::Error => LogLevel::Error,
            LogLevelArg::Warn => LogLevel::Warn,
            LogLevelArg::Info => LogLevel::Info,
            LogLevelArg::Debug => LogLevel::Debug,
            LogLevelArg::Trace => LogLevel::Trace,
        }
    }
}

fn main() {
    let code = match run() {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(category = %e.category(), exit_code = e.exit_code(), "{}", e);
            eprintln!("{} {}", Theme::error("Error:"), error_message(&e));
            e.exit_code()
        }
    };
    std::process::exit(code);
}

/// One-line report of a failed invocation, naming the error's category
fn error_message(e: &ConcertError) -> String {
    format!("{} ({} error)", e, e.category())
}

fn run() -> Result<i32> {
    let cli = Cli::parse();

    if let Err(e) = logging::init_logging(cli.log_level.into(), cli.verbose, cli.log_file.as_deref()) {
        eprintln!("Warning: Failed to initialize logging: {}", e);
    }

    let config_path = cli.config.clone().ok_or_else(|| {
        ConcertError::Config("no process graph given: pass --config or set CONCERT_CONFIG".to_string())
    })?;
    let graph = Arc::new(load_graph(&config_path)?);

    let config = EngineConfig::default();
    let ssh = SshSettings {
        identity: cli.identity.clone(),
        ..SshSettings::default()
    };
    let pool = Arc::new(ConnectionPool::new(
        Arc::new(SystemConnector::new(ssh)),
        HelperResources::new(config.helper_dir.clone()),
    ));
    let progress = if config.quiet {
        Progress::quiet()
    } else {
        Progress::stdout()
    };
    let engine = Engine::new(graph, pool, config, progress);

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(dispatch(&engine, cli.command))
}

async fn dispatch(engine: &Engine, command: Commands) -> Result<i32> {
    match command {
        Commands::Run {
            process,
            params,
            variants,
            monitor: open_monitor,
        } => {
            let request = StartRequest {
                params: StartRequest::parse_params(&params)?,
                variants,
            };
            if open_monitor {
                monitor::open(engine, Some(&process), false).await?;
            }
            let ok = engine.start(&process, &request).await?;
            Ok(exit_for(ok))
        }
        Commands::Kill {
            process,
            all,
            force,
        } => {
            if process.is_none() && !all {
                return Err(ConcertError::Config(
                    "name a process to stop or pass --all".to_string(),
                ));
            }
            let ok = engine.stop(process.as_deref(), force).await?;
            Ok(exit_for(ok))
        }
        Commands::Status {
            watch,
            pstree,
            json,
        } => {
            let options = StatusOptions { pstree };
            if watch {
                watch_status(engine, options).await?;
            } else {
                let statuses = engine.status(options).await?;
                if json {
                    let text = serde_json::to_string_pretty(&statuses)
                        .map_err(|e| ConcertError::Config(e.to_string()))?;
                    println!("{}", text);
                } else {
                    print_statuses(&statuses);
                }
            }
            Ok(EXIT_SUCCESS)
        }
        Commands::Watch { process, num_lines } => {
            let mut lines = engine.watch(&process, num_lines).await?;
            loop {
                tokio::select! {
                    line = lines.next() => match line {
                        Some(line) => println!("{}", line?),
                        None => break,
                    },
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
            Ok(EXIT_SUCCESS)
        }
        Commands::Mon { replace } => {
            monitor::open(engine, None, replace).await?;
            Ok(EXIT_SUCCESS)
        }
    }
}

fn exit_for(ok: bool) -> i32 {
    if ok {
        EXIT_SUCCESS
    } else {
        EXIT_FAILURE
    }
}

fn print_statuses(statuses: &[ProcessStatus]) {
    for status in statuses {
        let line = status.line();
        if status.is_running() {
            println!("{}", Theme::success(line));
        } else {
            println!("{}", Theme::error(line));
        }
        if let Some(tree) = &status.pstree {
            println!("{}", Theme::muted(textwrap::indent(tree, "    ").trim_end()));
        }
    }
}

async fn watch_status(engine: &Engine, options: StatusOptions) -> Result<()> {
    let term = Term::stdout();
    loop {
        let statuses = engine.status(options).await?;
        term.clear_screen()?;
        print_statuses(&statuses);
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}
