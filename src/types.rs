use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// One interactive element as presented to the suggestion service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UiElement {
    #[serde(rename = "type")]
    pub kind: String,
    pub label: String,
    #[serde(rename = "coordinates")]
    pub center: (i64, i64),
}

/// Coarse classification of the page the browser is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageType {
    Gmail,
    SearchResults,
    SearchHome,
    Login,
    Form,
    Generic,
}

impl PageType {
    /// Classify a page from its URL and HTML source.
    pub fn detect(url: &str, html: &str) -> Self {
        let url = url.to_lowercase();
        let html = html.to_lowercase();

        if url.contains("gmail") || url.contains("mail.google") {
            PageType::Gmail
        } else if url.contains("google") && url.contains("search") {
            PageType::SearchResults
        } else if url.contains("google") {
            PageType::SearchHome
        } else if html.contains("login") || html.contains("sign in") {
            PageType::Login
        } else if html.contains("form") && (html.contains("submit") || html.contains("send")) {
            PageType::Form
        } else {
            PageType::Generic
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PageType::Gmail => "gmail",
            PageType::SearchResults => "search_results",
            PageType::SearchHome => "search_home",
            PageType::Login => "login",
            PageType::Form => "form",
            PageType::Generic => "generic",
        }
    }
}

impl fmt::Display for PageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Simplified snapshot of the page's interactive surface for one loop iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiState {
    pub url: String,
    pub title: String,
    pub page_type: PageType,
    pub elements: Vec<UiElement>,
    pub screenshot: Option<PathBuf>,
}

impl UiState {
    pub fn empty() -> Self {
        Self {
            url: String::new(),
            title: String::new(),
            page_type: PageType::Generic,
            elements: Vec::new(),
            screenshot: None,
        }
    }
}

/// The single next action decided for the current step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(into = "WireSuggestion")]
pub enum ActionSuggestion {
    Click { target: String },
    Type { target: String, text: String },
    Navigate { url: String },
    Wait,
    Finish,
}

/// Placeholder target used when the suggestion service names none.
pub const UNKNOWN_TARGET: &str = "unknown";

impl ActionSuggestion {
    pub fn kind(&self) -> &'static str {
        match self {
            ActionSuggestion::Click { .. } => "click",
            ActionSuggestion::Type { .. } => "type",
            ActionSuggestion::Navigate { .. } => "navigate",
            ActionSuggestion::Wait => "wait",
            ActionSuggestion::Finish => "finish",
        }
    }

    /// The element description this action aims at, if it aims at one.
    pub fn target(&self) -> Option<&str> {
        match self {
            ActionSuggestion::Click { target } | ActionSuggestion::Type { target, .. } => {
                Some(target)
            }
            _ => None,
        }
    }

    /// Free-form input carried by the action (typed text or URL).
    pub fn input(&self) -> Option<&str> {
        match self {
            ActionSuggestion::Type { text, .. } => Some(text),
            ActionSuggestion::Navigate { url } => Some(url),
            _ => None,
        }
    }
}

impl fmt::Display for ActionSuggestion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionSuggestion::Click { target } => write!(f, "click '{}'", target),
            ActionSuggestion::Type { target, text } => {
                write!(f, "type '{}' into '{}'", text, target)
            }
            ActionSuggestion::Navigate { url } => write!(f, "navigate to {}", url),
            ActionSuggestion::Wait => f.write_str("wait"),
            ActionSuggestion::Finish => f.write_str("finish"),
        }
    }
}

/// The loosely-typed JSON object exchanged with the suggestion service.
///
/// Only `brain` decodes this into an [`ActionSuggestion`]; nothing past the
/// decoder sees the raw payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireSuggestion {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_element: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_input: Option<String>,
}

impl From<ActionSuggestion> for WireSuggestion {
    fn from(action: ActionSuggestion) -> Self {
        let action_type = Some(action.kind().to_string());
        match action {
            ActionSuggestion::Click { target } => Self {
                action_type,
                target_element: Some(target),
                additional_input: None,
            },
            ActionSuggestion::Type { target, text } => Self {
                action_type,
                target_element: Some(target),
                additional_input: Some(text),
            },
            ActionSuggestion::Navigate { url } => Self {
                action_type,
                target_element: Some("browser".to_string()),
                additional_input: Some(url),
            },
            ActionSuggestion::Wait => Self {
                action_type,
                target_element: Some(UNKNOWN_TARGET.to_string()),
                additional_input: None,
            },
            ActionSuggestion::Finish => Self {
                action_type,
                target_element: Some("task".to_string()),
                additional_input: None,
            },
        }
    }
}

/// Record of one executed step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    pub step: usize,
    pub action: ActionSuggestion,
    pub success: bool,
}

/// Outcome of executing one action against the page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionResult {
    pub success: bool,
    pub message: String,
    pub screenshot: Option<PathBuf>,
    /// Diagnostic lines produced while executing (strategy attempts, fallbacks).
    pub trace: Vec<String>,
}

impl ExecutionResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_trace(mut self, trace: Vec<String>) -> Self {
        self.trace = trace;
        self
    }
}

/// A past task trace similar to the current instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedExample {
    pub query: String,
    pub steps: Vec<serde_json::Value>,
    pub similarity: f64,
}
