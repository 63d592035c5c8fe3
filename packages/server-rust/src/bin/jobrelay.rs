//! `jobrelay` - standalone dispatcher driven over stdin/stdout.
//!
//! Reads one JSON command per stdin line and writes one JSON object per
//! stdout line for every result and dispatcher event, so a host application
//! written in any language can drive the dispatcher through pipes.
//!
//! ```text
//! {"command":"register","function":"lint","language":"Python3","module_path":"/plugins/lint","module_name":"Linter"}
//! {"command":"enqueue","function":"lint","language":"Python3","id":"/a.py","data":["code..."]}
//! {"event":"result","function":"lint","language":"Python3","job_id":"/a.py","data":[]}
//! ```

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use jobrelay_core::{ServiceKey, WorkerLanguage};
use jobrelay_server::logging::{self, LogConfig, LogFormat};
use jobrelay_server::network::ListenerConfig;
use jobrelay_server::service::metrics;
use jobrelay_server::{
    AutoRecovery, DispatchError, DispatcherConfig, DispatcherEvent, DispatcherHandle,
    DispatcherService, FaultChoice, LanguageConfig, ServiceRegistration,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

/// Runs remote functions in long-lived worker processes.
#[derive(Parser, Debug)]
#[command(name = "jobrelay", version)]
#[command(about = "Job dispatcher for long-lived worker processes", long_about = None)]
struct Args {
    /// Interpreter for a language, as LANG=PATH. Repeatable.
    #[arg(long = "interpreter", value_name = "LANG=PATH", value_parser = parse_interpreter)]
    interpreters: Vec<LanguageConfig>,

    /// Worker program passed to every interpreter, followed by host and port.
    #[arg(long, env = "JOBRELAY_WORKER_ENTRY")]
    worker_entry: PathBuf,

    /// Interface preference: "all" or an IPv4 address selects 127.0.0.1,
    /// anything else selects ::1.
    #[arg(long, default_value = "all")]
    network_interface: String,

    /// Port workers connect back to (0 picks a free port).
    #[arg(long, default_value_t = 0)]
    port: u16,

    /// How long a new connection may take to announce its language.
    #[arg(long, default_value_t = 1000)]
    handshake_timeout_ms: u64,

    /// Log output format: pretty, compact or json.
    #[arg(long)]
    log_format: Option<LogFormat>,

    /// Serve Prometheus metrics on this address.
    #[arg(long, env = "JOBRELAY_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    /// What to do when a worker raises: resume, retry or disable.
    #[arg(long, default_value = "resume")]
    on_fault: FaultChoice,

    /// Leave a worker down after it disconnects unexpectedly.
    #[arg(long)]
    no_restart_on_disconnect: bool,
}

impl Args {
    fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            listener: ListenerConfig {
                network_interface: self.network_interface.clone(),
                port: self.port,
                handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
                ..ListenerConfig::default()
            },
            worker_entry_point: self.worker_entry.clone(),
            languages: self.interpreters.clone(),
            ..DispatcherConfig::default()
        }
    }

    fn recovery(&self) -> AutoRecovery {
        AutoRecovery {
            on_fault: self.on_fault,
            restart_on_disconnect: !self.no_restart_on_disconnect,
        }
    }
}

fn parse_interpreter(s: &str) -> Result<LanguageConfig, String> {
    let (language, path) = s
        .split_once('=')
        .ok_or_else(|| format!("expected LANG=PATH, got '{s}'"))?;
    if language.is_empty() {
        return Err(format!("missing language in '{s}'"));
    }
    Ok(LanguageConfig::new(language, path))
}

// ---------------------------------------------------------------------------
// Host protocol
// ---------------------------------------------------------------------------

/// One stdin line.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "command", rename_all = "snake_case")]
enum HostCommand {
    Register {
        function: String,
        language: WorkerLanguage,
        module_path: String,
        module_name: String,
    },
    Unregister {
        function: String,
        language: WorkerLanguage,
    },
    Enqueue {
        function: String,
        language: WorkerLanguage,
        id: String,
        #[serde(default)]
        data: Value,
    },
    Cancel {
        function: String,
        language: WorkerLanguage,
    },
    Restart {
        language: WorkerLanguage,
        #[serde(default)]
        force: bool,
    },
    Reconfigure {
        interpreters: BTreeMap<WorkerLanguage, String>,
    },
    Shutdown,
}

/// Lines written to stdout besides [`DispatcherEvent`]s.
#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum HostOutput<'a> {
    Ready {
        port: u16,
    },
    Result {
        function: &'a str,
        language: &'a WorkerLanguage,
        job_id: &'a str,
        data: &'a Value,
    },
    Error {
        message: String,
    },
}

type Output = mpsc::UnboundedSender<String>;

fn emit(out: &Output, value: &impl Serialize) {
    match serde_json::to_string(value) {
        Ok(line) => {
            let _ = out.send(line);
        }
        Err(err) => warn!(error = %err, "failed to serialize output line"),
    }
}

/// Applies one stdin line. Returns `false` once the host asked to stop.
fn apply_line(handle: &DispatcherHandle, out: &Output, line: &str) -> Result<bool, DispatchError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(true);
    }
    let command: HostCommand = match serde_json::from_str(line) {
        Ok(command) => command,
        Err(err) => {
            emit(
                out,
                &HostOutput::Error {
                    message: format!("invalid command: {err}"),
                },
            );
            return Ok(true);
        }
    };

    match command {
        HostCommand::Register {
            function,
            language,
            module_path,
            module_name,
        } => {
            let key = ServiceKey::new(function.clone(), language.clone());
            let out = out.clone();
            let registration =
                ServiceRegistration::new(module_path, module_name, move |job_id, data| {
                    emit(
                        &out,
                        &HostOutput::Result {
                            function: &function,
                            language: &language,
                            job_id,
                            data,
                        },
                    );
                });
            handle.register(key, registration)?;
        }
        HostCommand::Unregister { function, language } => {
            handle.unregister(ServiceKey::new(function, language))?;
        }
        HostCommand::Enqueue {
            function,
            language,
            id,
            data,
        } => handle.enqueue(function, language, id, data)?,
        HostCommand::Cancel { function, language } => handle.request_cancel(function, language)?,
        HostCommand::Restart { language, force } => handle.restart_service(language, force)?,
        HostCommand::Reconfigure { interpreters } => handle.reconfigure(
            interpreters
                .into_iter()
                .map(|(language, interpreter)| LanguageConfig::new(language, interpreter))
                .collect(),
        )?,
        HostCommand::Shutdown => return Ok(false),
    }
    Ok(true)
}

async fn forward_events(mut events: broadcast::Receiver<DispatcherEvent>, out: Output) {
    loop {
        match events.recv().await {
            Ok(event) => emit(&out, &event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "event output fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn write_lines(mut lines: mpsc::UnboundedReceiver<String>) {
    let mut stdout = tokio::io::stdout();
    while let Some(mut line) = lines.recv().await {
        line.push('\n');
        if stdout.write_all(line.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
            break;
        }
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut log_config = LogConfig::default().with_env_overrides();
    if let Some(format) = args.log_format {
        log_config = log_config.with_format(format);
    }
    logging::init(&log_config);

    if let Some(addr) = args.metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to install Prometheus exporter")?;
        info!(%addr, "serving metrics");
    }
    metrics::describe();

    let service = DispatcherService::start(args.dispatcher_config(), Arc::new(args.recovery()))
        .await
        .context("failed to start dispatcher")?;
    let handle = service.handle();

    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_lines(out_rx));
    tokio::spawn(forward_events(handle.subscribe(), out_tx.clone()));
    emit(
        &out_tx,
        &HostOutput::Ready {
            port: handle.addr().port(),
        },
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if !apply_line(&handle, &out_tx, &line)? {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, "failed to read stdin");
                    break;
                }
            },
            _ = &mut ctrl_c => {
                info!("interrupted");
                break;
            }
        }
    }

    handle.shutdown().await?;
    drop(handle);
    service.wait().await?;
    drop(out_tx);
    let _ = writer.await;
    Ok(())
}
