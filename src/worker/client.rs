use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::error::{Result, ShardingError};
use crate::protocol::{ClientMessage, InitMessage, ServerMessage, StepCompleteMessage};
use crate::scheduler::RepoState;
use crate::worker::runner::TaskRunner;
use crate::worker::schema::Schema;

/// How a worker session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// Every step of the cohort completed.
    SchemaComplete,
    /// The coordinator aborted the cohort.
    Aborted,
    /// A step assigned to this worker failed; the coordinator was told and
    /// will hand it to someone else.
    StepFailed(usize),
    /// Local shutdown was requested.
    Interrupted,
}

impl WorkerOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, WorkerOutcome::SchemaComplete)
    }
}

struct RunningStep {
    step_id: usize,
    handle: JoinHandle<()>,
}

/// One worker session: connect, send INIT, run whatever steps arrive.
pub struct WorkerClient<R> {
    config: WorkerConfig,
    schema: Schema,
    repo_state: RepoState,
    runner: Arc<R>,
}

impl<R: TaskRunner> WorkerClient<R> {
    pub fn new(config: WorkerConfig, schema: Schema, repo_state: RepoState, runner: R) -> Self {
        Self {
            config,
            schema,
            repo_state,
            runner: Arc::new(runner),
        }
    }

    pub fn init_message(&self) -> InitMessage {
        InitMessage {
            cache_id: self.config.cache_id.clone(),
            schema_id: self.schema.name.clone(),
            total_steps: self.schema.total_steps(),
            repo_state: self.repo_state.clone(),
            complex_patchset: self.config.complex_patchset,
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) -> Result<WorkerOutcome> {
        let endpoint = self.config.endpoint();
        let (socket, _) = connect_async(endpoint.as_str()).await?;
        tracing::info!(
            endpoint = %endpoint,
            client_id = %self.config.client_id,
            schema = %self.schema.name,
            "Connected to coordinator"
        );

        let (mut sink, mut stream) = socket.split();
        let init = ClientMessage::Init(self.init_message());
        sink.send(Message::Text(init.encode()?.into())).await?;

        let (done_tx, mut done_rx) = mpsc::channel::<(usize, bool)>(1);
        let mut running: Option<RunningStep> = None;

        let outcome = loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.abort_running(&mut running);
                    break Ok(WorkerOutcome::Interrupted);
                }
                Some((step_id, success)) = done_rx.recv() => {
                    running = None;
                    let reply = ClientMessage::StepComplete(StepCompleteMessage {
                        schema_id: self.schema.name.clone(),
                        step_id,
                        step_success: success,
                    });
                    tracing::info!(step_id, success, "Reporting step");
                    sink.send(Message::Text(reply.encode()?.into())).await?;
                    if !success {
                        break Ok(WorkerOutcome::StepFailed(step_id));
                    }
                }
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        let message = ServerMessage::decode(text.as_str())?;
                        match self.handle_instruction(message, &mut running, &done_tx) {
                            Ok(Some(done)) => break Ok(done),
                            Ok(None) => {}
                            Err(e) => {
                                self.abort_running(&mut running);
                                break Err(e);
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        self.abort_running(&mut running);
                        break Err(ShardingError::ConnectionClosed);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        self.abort_running(&mut running);
                        break Err(e.into());
                    }
                },
            }
        };

        if let Err(e) = sink.close().await {
            tracing::debug!(error = %e, "Closing socket failed");
        }
        tracing::info!(outcome = ?outcome, "Worker session ended");
        outcome
    }

    /// Apply one coordinator message. `Some` ends the session.
    fn handle_instruction(
        &self,
        message: ServerMessage,
        running: &mut Option<RunningStep>,
        done_tx: &mpsc::Sender<(usize, bool)>,
    ) -> Result<Option<WorkerOutcome>> {
        if message.schema_id() != self.schema.name {
            return Err(ShardingError::SchemaMismatch {
                expected: self.schema.name.clone(),
                received: message.schema_id().to_string(),
            });
        }

        match message {
            ServerMessage::BuildInstruction { step_id, .. } => {
                if running.is_some() {
                    return Err(ShardingError::UnexpectedMessage {
                        expected: "no instruction while a step is running",
                        received: "BUILD_INSTRUCTION",
                    });
                }
                let step = self.schema.step(step_id).cloned().ok_or_else(|| {
                    ShardingError::InvalidPlan(format!(
                        "step {} is outside schema {} ({} steps)",
                        step_id,
                        self.schema.name,
                        self.schema.total_steps()
                    ))
                })?;

                tracing::info!(step_id, "Received build instruction");
                let runner = self.runner.clone();
                let done = done_tx.clone();
                let handle = tokio::spawn(async move {
                    let success = runner.run(step_id, &step).await;
                    let _ = done.send((step_id, success)).await;
                });
                *running = Some(RunningStep { step_id, handle });
                Ok(None)
            }
            ServerMessage::SchemaComplete { .. } => {
                self.abort_running(running);
                tracing::info!(schema = %self.schema.name, "Schema complete");
                Ok(Some(WorkerOutcome::SchemaComplete))
            }
            ServerMessage::AbortStep { .. } => {
                self.abort_running(running);
                tracing::warn!(schema = %self.schema.name, "Coordinator aborted the schema");
                Ok(Some(WorkerOutcome::Aborted))
            }
        }
    }

    fn abort_running(&self, running: &mut Option<RunningStep>) {
        if let Some(step) = running.take() {
            tracing::info!(step_id = step.step_id, "Aborting current step");
            self.runner.abort();
            step.handle.abort();
        }
    }
}
