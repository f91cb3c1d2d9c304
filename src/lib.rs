//! Instruction-driven browser agent: observe the page, ask a completion
//! service for the next action, resolve it against the live DOM, act, repeat.

pub mod brain;
pub mod capture;
pub mod config;
pub mod dom;
pub mod error;
pub mod executor;
pub mod face;
pub mod hands;
pub mod orchestrator;
pub mod resolver;
pub mod retrieval;
pub mod types;

pub use brain::{ActionSuggester, CompletionService, OpenAiChat};
pub use capture::UiStateCapturer;
pub use config::PilotConfig;
pub use dom::{ElementProbe, PageDriver};
pub use error::{AbortReason, PilotError};
pub use executor::ActionExecutor;
pub use hands::ChromeSession;
pub use orchestrator::{LoopEvent, LoopState, Orchestrator, ResumePolicy, RunReport};
pub use resolver::{ElementResolver, Resolution};
pub use retrieval::{ExampleLibrary, ExampleRetriever, NoExamples};
pub use types::{ActionSuggestion, ExecutionResult, HistoryEntry, PageType, UiElement, UiState};
