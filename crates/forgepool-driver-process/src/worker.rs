use base64::Engine;
use std::process::Stdio;
use std::sync::Arc;

use forgepool_core::driver::{DriverCapabilities, GenerateOutcome, GenerationError, GenerationEvent, InitError, PleaseRedirect};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::protocol::{WireCommand, WireEvent};

/// How to spawn one worker process (spec §4.1 "out-of-process inference
/// engine").
#[derive(Debug, Clone)]
pub struct ProcessDriverConfig {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<std::path::PathBuf>,
}

enum WorkerCommand {
    Init(oneshot::Sender<Result<DriverCapabilities, InitError>>),
    Shutdown(oneshot::Sender<()>),
    LoadModel(String, oneshot::Sender<bool>),
    Generate {
        input: serde_json::Value,
        batch_id: u64,
        event_tx: mpsc::UnboundedSender<GenerationEvent>,
        done_tx: oneshot::Sender<Result<(), GenerateOutcome>>,
    },
}

/// Owns one worker process's stdio and serializes every command against it.
/// A single backend handles one generation at a time (`maxUsages` is
/// typically 1), so a strict request/response alternation over a single
/// command channel is sufficient — mirrors the teacher's single-worker
/// engine pattern (`engine::ggml::diffusion::backend::DiffusionWorker`,
/// which also owns its process/engine state with no shared mutex) adapted
/// from an in-process channel to stdio framing.
pub struct ProcessWorkerHandle {
    tx: mpsc::UnboundedSender<WorkerCommand>,
}

impl ProcessWorkerHandle {
    pub fn spawn(config: ProcessDriverConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(config, rx));
        Self { tx }
    }

    pub async fn init(&self) -> Result<DriverCapabilities, InitError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(WorkerCommand::Init(reply_tx)).is_err() {
            return Err(InitError::Transient("worker task is gone".into()));
        }
        reply_rx
            .await
            .unwrap_or_else(|_| Err(InitError::Transient("worker task dropped reply".into())))
    }

    pub async fn shutdown_now(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(WorkerCommand::Shutdown(reply_tx)).is_ok() {
            let _ = reply_rx.await;
        }
    }

    pub async fn load_model(&self, model: &str) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(WorkerCommand::LoadModel(model.to_owned(), reply_tx))
            .is_err()
        {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }

    pub async fn generate_live(
        &self,
        input: serde_json::Value,
        batch_id: u64,
        on_event: &mut (dyn FnMut(GenerationEvent) + Send),
    ) -> Result<(), GenerateOutcome> {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (done_tx, mut done_rx) = oneshot::channel();
        if self
            .tx
            .send(WorkerCommand::Generate {
                input,
                batch_id,
                event_tx,
                done_tx,
            })
            .is_err()
        {
            return Err(GenerateOutcome::Failed(GenerationError(
                "worker task is gone".into(),
            )));
        }

        // Drain events as they arrive rather than waiting for `done_rx`
        // first, since the worker streams them while the generation runs.
        loop {
            tokio::select! {
                maybe_event = event_rx.recv() => {
                    match maybe_event {
                        Some(event) => on_event(event),
                        None => continue,
                    }
                }
                result = &mut done_rx => {
                    return result.unwrap_or_else(|_| {
                        Err(GenerateOutcome::Failed(GenerationError(
                            "worker task dropped reply".into(),
                        )))
                    });
                }
            }
        }
    }
}

async fn run_worker(config: ProcessDriverConfig, mut rx: mpsc::UnboundedReceiver<WorkerCommand>) {
    let mut child: Option<ChildIo> = None;
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WorkerCommand::Init(reply) => {
                let result = ensure_spawned(&config, &mut child)
                    .await
                    .map_err(InitError::Transient);
                let result = match result {
                    Ok(()) => send_and_await_init(child.as_mut().expect("just spawned")).await,
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            WorkerCommand::Shutdown(reply) => {
                if let Some(mut io) = child.take() {
                    let _ = io.send(&WireCommand::Shutdown).await;
                    let _ = io.child.kill().await;
                }
                let _ = reply.send(());
            }
            WorkerCommand::LoadModel(model, reply) => {
                let ok = if let Some(io) = child.as_mut() {
                    if io.send(&WireCommand::LoadModel { model }).await.is_ok() {
                        matches!(
                            io.read_terminal().await,
                            Ok(WireEvent::ModelLoaded { ok: true })
                        )
                    } else {
                        false
                    }
                } else {
                    false
                };
                let _ = reply.send(ok);
            }
            WorkerCommand::Generate {
                input,
                batch_id,
                event_tx,
                done_tx,
            } => {
                let outcome = run_generate(child.as_mut(), input, batch_id, &event_tx).await;
                let _ = done_tx.send(outcome);
            }
        }
    }
    if let Some(mut io) = child {
        let _ = io.child.kill().await;
    }
}

async fn send_and_await_init(io: &mut ChildIo) -> Result<DriverCapabilities, InitError> {
    io.send(&WireCommand::Init)
        .await
        .map_err(|e| InitError::Transient(e.to_string()))?;
    match io.read_terminal().await {
        Ok(WireEvent::Ready {
            models_by_category,
            can_load_models,
            max_usages,
        }) => Ok(DriverCapabilities {
            models_by_category,
            can_load_models,
            max_usages,
        }),
        Ok(WireEvent::Refused { message }) => Err(InitError::Refused(message)),
        Ok(WireEvent::Transient { message }) => Err(InitError::Transient(message)),
        Ok(WireEvent::Error { message }) => Err(InitError::Transient(message)),
        Ok(_) => Err(InitError::Transient("unexpected event answering init".into())),
        Err(e) => Err(InitError::Transient(e)),
    }
}

async fn run_generate(
    io: Option<&mut ChildIo>,
    input: serde_json::Value,
    batch_id: u64,
    event_tx: &mpsc::UnboundedSender<GenerationEvent>,
) -> Result<(), GenerateOutcome> {
    let Some(io) = io else {
        return Err(GenerateOutcome::Failed(GenerationError(
            "backend process is not running".into(),
        )));
    };
    io.send(&WireCommand::Generate { input, batch_id })
        .await
        .map_err(|e| GenerateOutcome::Failed(GenerationError(e.to_string())))?;

    loop {
        match io.read_event().await {
            Ok(WireEvent::Progress { step, total }) => {
                let _ = event_tx.send(GenerationEvent::Progress { step, total });
            }
            Ok(WireEvent::Image { data_base64 }) => {
                match base64::engine::general_purpose::STANDARD.decode(data_base64) {
                    Ok(bytes) => {
                        let _ = event_tx.send(GenerationEvent::Image { bytes: Arc::from(bytes) });
                    }
                    Err(e) => {
                        return Err(GenerateOutcome::Failed(GenerationError(format!(
                            "malformed image payload: {e}"
                        ))));
                    }
                }
            }
            Ok(WireEvent::Done) => return Ok(()),
            Ok(WireEvent::Redirect { message }) => {
                return Err(GenerateOutcome::Redirect(PleaseRedirect(message)));
            }
            Ok(WireEvent::Error { message }) => {
                return Err(GenerateOutcome::Failed(GenerationError(message)));
            }
            Ok(other) => {
                warn!(?other, "unexpected event during generation, ignoring");
            }
            Err(e) => return Err(GenerateOutcome::Failed(GenerationError(e))),
        }
    }
}

struct ChildIo {
    child: Child,
    stdin: tokio::process::ChildStdin,
    lines: tokio::io::Lines<BufReader<tokio::process::ChildStdout>>,
}

impl ChildIo {
    async fn send(&mut self, command: &WireCommand) -> std::io::Result<()> {
        let mut line = serde_json::to_string(command).expect("WireCommand always serializes");
        line.push('\n');
        self.stdin.write_all(line.as_bytes()).await
    }

    async fn read_event(&mut self) -> Result<WireEvent, String> {
        match self.lines.next_line().await {
            Ok(Some(line)) => serde_json::from_str(&line)
                .map_err(|e| format!("malformed worker output ({e}): {line}")),
            Ok(None) => Err("worker closed stdout".to_string()),
            Err(e) => Err(e.to_string()),
        }
    }

    /// Read until a terminal (non-`Progress`/`Image`) event; only used for
    /// init/load_model which never stream progress.
    async fn read_terminal(&mut self) -> Result<WireEvent, String> {
        self.read_event().await
    }
}

async fn ensure_spawned(config: &ProcessDriverConfig, child: &mut Option<ChildIo>) -> Result<(), String> {
    if child.is_some() {
        return Ok(());
    }
    let mut command = Command::new(&config.program);
    command
        .args(&config.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());
    if let Some(dir) = &config.working_dir {
        command.current_dir(dir);
    }
    let mut spawned = command.spawn().map_err(|e| e.to_string())?;
    let stdin = spawned.stdin.take().expect("stdin was piped");
    let stdout = spawned.stdout.take().expect("stdout was piped");
    info!(program = %config.program, "spawned backend worker process");
    *child = Some(ChildIo {
        child: spawned,
        stdin,
        lines: BufReader::new(stdout).lines(),
    });
    Ok(())
}
