use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

use crate::brain::ActionSuggester;
use crate::capture::UiStateCapturer;
use crate::config::PilotConfig;
use crate::dom::PageDriver;
use crate::error::AbortReason;
use crate::executor::ActionExecutor;
use crate::retrieval::{ExampleRetriever, NoExamples};
use crate::types::{ActionSuggestion, ExecutionResult, HistoryEntry, UiState};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopState {
    Running(usize),
    AwaitingManualInput,
    Finished,
    Aborted(AbortReason),
}

impl LoopState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LoopState::Finished | LoopState::Aborted(_))
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopState::Running(n) => write!(f, "running({})", n),
            LoopState::AwaitingManualInput => f.write_str("awaiting-manual-input"),
            LoopState::Finished => f.write_str("finished"),
            LoopState::Aborted(reason) => write!(f, "aborted({})", reason),
        }
    }
}

/// Progress notifications published while a run is in flight.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LoopEvent {
    Started { instruction: String },
    Step { number: usize, action: ActionSuggestion },
    StepResult { number: usize, success: bool, message: String },
    AwaitingOperator { step: usize },
    Resumed { step: usize },
    Finished { steps: usize },
    Aborted { reason: String },
}

impl LoopEvent {
    pub fn name(&self) -> &'static str {
        match self {
            LoopEvent::Started { .. } => "started",
            LoopEvent::Step { .. } => "step",
            LoopEvent::StepResult { .. } => "step_result",
            LoopEvent::AwaitingOperator { .. } => "awaiting_operator",
            LoopEvent::Resumed { .. } => "resumed",
            LoopEvent::Finished { .. } => "finished",
            LoopEvent::Aborted { .. } => "aborted",
        }
    }
}

/// How a manual-intervention pause ends.
#[derive(Debug)]
pub enum ResumePolicy {
    /// Poll the page for this text, giving up after `timeout`.
    Indicator { text: String, timeout: Duration },
    /// Wait for an operator acknowledgment. A closed channel counts as one.
    Operator {
        rx: mpsc::Receiver<()>,
        timeout: Option<Duration>,
    },
    /// Fixed advisory pause.
    Sleep(Duration),
}

impl ResumePolicy {
    pub fn from_config(config: &PilotConfig) -> Self {
        match &config.success_indicator {
            Some(text) => ResumePolicy::Indicator {
                text: text.clone(),
                timeout: config.manual_timeout,
            },
            None => ResumePolicy::Sleep(config.manual_timeout),
        }
    }
}

/// Outcome of one run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub state: LoopState,
    pub history: Vec<HistoryEntry>,
    pub log: Vec<String>,
}

impl RunReport {
    pub fn is_finished(&self) -> bool {
        self.state == LoopState::Finished
    }
}

/// Releases the page exactly once, on the normal path or while unwinding.
struct PageGuard {
    page: Arc<dyn PageDriver>,
    released: bool,
}

impl PageGuard {
    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.page.release();
        }
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Drives capture, suggest and execute until the task finishes or aborts.
///
/// Owns the page for the whole run; [`Orchestrator::run`] consumes it so the
/// page cannot be driven again after release.
pub struct Orchestrator {
    guard: PageGuard,
    capturer: UiStateCapturer,
    suggester: ActionSuggester,
    executor: ActionExecutor,
    retriever: Arc<dyn ExampleRetriever>,
    resume: ResumePolicy,
    max_steps: usize,
    action_delay: Duration,
    events: broadcast::Sender<LoopEvent>,
}

impl Orchestrator {
    pub fn new(
        page: Arc<dyn PageDriver>,
        suggester: ActionSuggester,
        config: &PilotConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            guard: PageGuard {
                page,
                released: false,
            },
            capturer: UiStateCapturer::new(&config.screenshots_dir, config.max_ui_elements),
            suggester,
            executor: ActionExecutor::new(config.explicit_wait),
            retriever: Arc::new(NoExamples),
            resume: ResumePolicy::from_config(config),
            max_steps: config.max_steps,
            action_delay: config.action_delay,
            events,
        }
    }

    pub fn with_retriever(mut self, retriever: Arc<dyn ExampleRetriever>) -> Self {
        self.retriever = retriever;
        self
    }

    pub fn with_resume_policy(mut self, resume: ResumePolicy) -> Self {
        self.resume = resume;
        self
    }

    /// Publish events on an existing channel instead of a private one.
    pub fn with_events(mut self, events: broadcast::Sender<LoopEvent>) -> Self {
        self.events = events;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LoopEvent> {
        self.events.subscribe()
    }

    pub async fn run(mut self, instruction: &str) -> RunReport {
        info!(%instruction, max_steps = self.max_steps, "starting run");
        self.emit(LoopEvent::Started {
            instruction: instruction.to_string(),
        });

        let examples = self.retriever.retrieve(instruction);
        let mut history: Vec<HistoryEntry> = Vec::new();
        let mut log = Vec::new();
        let mut state = LoopState::Running(0);

        while let LoopState::Running(done) = state {
            if done >= self.max_steps {
                warn!("reached maximum steps ({})", self.max_steps);
                state = LoopState::Aborted(AbortReason::StepLimitExceeded);
                break;
            }
            let step = done + 1;
            state = LoopState::Running(step);
            info!("--- step {} ---", step);

            let ui = self.capture(step).await;
            let action = self
                .suggester
                .suggest(instruction, &ui, &history, &examples)
                .await;
            log.push(format!("step {}: {}", step, action));
            self.emit(LoopEvent::Step {
                number: step,
                action: action.clone(),
            });

            match action {
                ActionSuggestion::Finish => {
                    info!("task marked complete");
                    state = LoopState::Finished;
                }
                ActionSuggestion::Wait => {
                    state = LoopState::AwaitingManualInput;
                    info!(%state, "manual intervention requested at step {}", step);
                    self.emit(LoopEvent::AwaitingOperator { step });
                    self.await_resume().await;
                    self.emit(LoopEvent::Resumed { step });
                    state = LoopState::Running(step);
                }
                action => {
                    let mut result = self.execute(action.clone()).await;
                    result.screenshot = ui.screenshot;
                    log.extend(result.trace.iter().cloned());
                    log.push(format!(
                        "step {} {}: {}",
                        step,
                        if result.success { "succeeded" } else { "failed" },
                        result.message
                    ));
                    history.push(HistoryEntry {
                        step,
                        action,
                        success: result.success,
                    });
                    self.emit(LoopEvent::StepResult {
                        number: step,
                        success: result.success,
                        message: result.message.clone(),
                    });

                    if result.success {
                        tokio::time::sleep(self.action_delay).await;
                    } else {
                        state = LoopState::Aborted(AbortReason::ActionFailed {
                            step,
                            message: result.message,
                        });
                    }
                }
            }
        }

        match &state {
            LoopState::Aborted(reason) => {
                error!("run aborted: {}", reason.describe());
                log.push(format!("aborted: {}", reason.describe()));
                self.emit(LoopEvent::Aborted {
                    reason: reason.to_string(),
                });
            }
            _ => {
                info!("run finished after {} actions", history.len());
                self.emit(LoopEvent::Finished {
                    steps: history.len(),
                });
            }
        }
        self.guard.release();

        RunReport {
            state,
            history,
            log,
        }
    }

    fn emit(&self, event: LoopEvent) {
        let _ = self.events.send(event);
    }

    async fn capture(&self, step: usize) -> UiState {
        let page = self.guard.page.clone();
        let capturer = self.capturer.clone();
        match tokio::task::spawn_blocking(move || capturer.capture(Some(page.as_ref()), step)).await
        {
            Ok(state) => state,
            Err(e) => {
                warn!("capture task failed: {}", e);
                UiState::empty()
            }
        }
    }

    async fn execute(&self, action: ActionSuggestion) -> ExecutionResult {
        let page = self.guard.page.clone();
        let executor = self.executor.clone();
        let executed =
            tokio::task::spawn_blocking(move || executor.execute(&action, page.as_ref())).await;
        match executed {
            Ok(result) => result,
            Err(e) => ExecutionResult::failed(format!("executor task failed: {}", e)),
        }
    }

    async fn await_resume(&mut self) {
        match &mut self.resume {
            ResumePolicy::Indicator { text, timeout } => {
                info!("waiting up to {:?} for '{}' to appear", timeout, text);
                let page = self.guard.page.clone();
                let text = text.clone();
                let timeout = *timeout;
                let seen =
                    tokio::task::spawn_blocking(move || page.wait_for_text(&text, timeout)).await;
                match seen {
                    Ok(Ok(true)) => info!("success indicator appeared"),
                    Ok(Ok(false)) => warn!("success indicator not seen, resuming anyway"),
                    Ok(Err(e)) => warn!("indicator poll failed: {:#}", e),
                    Err(e) => warn!("indicator poll task failed: {}", e),
                }
            }
            ResumePolicy::Operator { rx, timeout } => {
                // Acks sent before this pause belong to an earlier one.
                while rx.try_recv().is_ok() {}
                info!("waiting for operator to resume");
                let received = match timeout {
                    Some(limit) => match tokio::time::timeout(*limit, rx.recv()).await {
                        Ok(ack) => ack,
                        Err(_) => {
                            warn!("no operator acknowledgment within {:?}, resuming", limit);
                            return;
                        }
                    },
                    None => rx.recv().await,
                };
                match received {
                    Some(()) => info!("operator resumed the run"),
                    None => info!("operator channel closed, resuming"),
                }
            }
            ResumePolicy::Sleep(pause) => {
                info!("pausing {:?} for manual intervention", pause);
                tokio::time::sleep(*pause).await;
            }
        }
    }
}
