use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::PilotConfig;
use crate::error::PilotError;
use crate::types::{
    ActionSuggestion, HistoryEntry, RetrievedExample, UNKNOWN_TARGET, UiState, WireSuggestion,
};

/// History entries rendered into each prompt.
pub const HISTORY_IN_PROMPT: usize = 3;
/// Retrieved examples rendered into each prompt.
pub const EXAMPLES_IN_PROMPT: usize = 2;
const STEPS_PER_EXAMPLE: usize = 2;

pub const SYSTEM_PROMPT: &str = "You are a GUI automation agent driving a real web browser. \
Given a task instruction and the current UI state, decide the single next action. \
Respond with JSON only, containing action_type, target_element, and additional_input if needed.";

const SCHEMA_REMINDER: &str = r#"Respond with exactly one JSON object:
{"action_type": "click" | "type" | "navigate" | "wait" | "finish", "target_element": "<label of the element>", "additional_input": "<text to type or URL, if needed>"}
Pick exactly one action_type. Never combine actions (no "type_and_click", no lists of actions)."#;

/// A remote text-completion endpoint.
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, system: &str, user: &str) -> Result<String>;
}

/// OpenAI-compatible chat-completions client.
pub struct OpenAiChat {
    client: Client,
    api_url: String,
    api_key: String,
    model: String,
}

impl OpenAiChat {
    pub fn new(api_key: impl Into<String>, config: &PilotConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            api_url: config.api_url.clone(),
            api_key: api_key.into(),
            model: config.model.clone(),
        })
    }

    /// Build a client from `OPENAI_API_KEY`.
    pub fn from_env(config: &PilotConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY not set in environment"))?;
        Self::new(api_key, config)
    }
}

#[async_trait]
impl CompletionService for OpenAiChat {
    async fn complete(&self, system: &str, user: &str) -> Result<String> {
        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "messages": [
                    {"role": "system", "content": system},
                    {"role": "user", "content": user},
                ],
                "max_tokens": 200,
                "temperature": 0.1,
            }))
            .send()
            .await?;

        let status = response.status();
        let body: Value = response.json().await?;
        reply_content(status.is_success(), status.as_u16(), &body)
    }
}

fn reply_content(success: bool, status: u16, body: &Value) -> Result<String> {
    if !success {
        let message = body["error"]["message"]
            .as_str()
            .unwrap_or("Unknown API error");
        return Err(anyhow!("completion API error ({}): {}", status, message));
    }
    body["choices"][0]["message"]["content"]
        .as_str()
        .map(String::from)
        .ok_or_else(|| anyhow!("no content in completion response: {}", body))
}

/// Turns the loop's current context into one [`ActionSuggestion`].
#[derive(Clone)]
pub struct ActionSuggester {
    service: Arc<dyn CompletionService>,
}

impl ActionSuggester {
    pub fn new(service: Arc<dyn CompletionService>) -> Self {
        Self { service }
    }

    /// Ask for the next action. Any failure along the way yields `Wait`.
    pub async fn suggest(
        &self,
        instruction: &str,
        state: &UiState,
        history: &[HistoryEntry],
        examples: &[RetrievedExample],
    ) -> ActionSuggestion {
        let prompt = build_prompt(instruction, state, history, examples);
        match self.request(&prompt).await {
            Ok(action) => {
                info!(%action, "suggested action");
                action
            }
            Err(e) => {
                warn!("{}; defaulting to wait", e);
                ActionSuggestion::Wait
            }
        }
    }

    async fn request(&self, prompt: &str) -> Result<ActionSuggestion, PilotError> {
        let reply = self
            .service
            .complete(SYSTEM_PROMPT, prompt)
            .await
            .map_err(|e| PilotError::Suggestion(format!("{:#}", e)))?;
        debug!(%reply, "completion reply");
        parse_reply(&reply)
    }
}

/// Advisory notes derived from recent history. They shape the prompt only;
/// nothing here prevents a repeated action from being executed.
pub fn contextual_guidance(history: &[HistoryEntry], state: &UiState) -> Vec<String> {
    let mut notes = Vec::new();

    if let Some(ActionSuggestion::Type { target, .. }) = history.last().map(|e| &e.action) {
        if target.to_lowercase().contains("search") {
            let button = state.elements.iter().find(|el| {
                is_button_kind(&el.kind) && el.label.to_lowercase().contains("search")
            });
            if let Some(button) = button {
                notes.push(format!(
                    "You just typed into '{}'. The next action should probably be clicking the '{}' button to submit.",
                    target, button.label
                ));
            }
        }
    }

    if let [.., previous, last] = history {
        if let (Some(a), Some(b)) = (previous.action.target(), last.action.target()) {
            if a.trim().eq_ignore_ascii_case(b.trim()) {
                notes.push(format!(
                    "The last two actions both targeted '{}'. Do not repeat an action on '{}' again; pick a different element or action.",
                    b, b
                ));
            }
        }
    }

    notes
}

fn is_button_kind(kind: &str) -> bool {
    matches!(kind, "button" | "role_button" | "input_submit" | "input_button")
}

fn render_history(history: &[HistoryEntry]) -> String {
    let start = history.len().saturating_sub(HISTORY_IN_PROMPT);
    history[start..]
        .iter()
        .map(|entry| {
            let target = WireSuggestion::from(entry.action.clone()).target_element;
            let mut line = format!(
                "- step {} [{}] {} target='{}'",
                entry.step,
                if entry.success { "ok" } else { "failed" },
                entry.action.kind(),
                target.unwrap_or_default()
            );
            if let Some(input) = entry.action.input() {
                line.push_str(&format!(" input='{}'", input));
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_examples(examples: &[RetrievedExample]) -> String {
    examples
        .iter()
        .take(EXAMPLES_IN_PROMPT)
        .enumerate()
        .map(|(i, example)| {
            let mut block = format!(
                "Example {} (similarity {:.2}): {}",
                i + 1,
                example.similarity,
                example.query
            );
            for step in example.steps.iter().take(STEPS_PER_EXAMPLE) {
                let action = step.get("action").unwrap_or(step);
                block.push_str(&format!("\n  {}", action));
            }
            block
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn build_prompt(
    instruction: &str,
    state: &UiState,
    history: &[HistoryEntry],
    examples: &[RetrievedExample],
) -> String {
    let screenshot = state
        .screenshot
        .as_ref()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "none".to_string());
    let elements = serde_json::to_string(&state.elements).unwrap_or_else(|_| "[]".to_string());

    let mut prompt = format!(
        "Task: {}\n\nCurrent page: {} | title: {} | page type: {}\nScreenshot: {}\n\nUI elements:\n{}\n",
        instruction, state.url, state.title, state.page_type, screenshot, elements
    );

    if !history.is_empty() {
        prompt.push_str(&format!("\nRecent actions:\n{}\n", render_history(history)));
    }
    if !examples.is_empty() {
        prompt.push_str(&format!("\nSimilar examples:\n{}\n", render_examples(examples)));
    }
    let guidance = contextual_guidance(history, state);
    if !guidance.is_empty() {
        prompt.push_str("\nGuidance:\n");
        for note in &guidance {
            prompt.push_str(&format!("- {}\n", note));
        }
    }

    prompt.push('\n');
    prompt.push_str(SCHEMA_REMINDER);
    prompt
}

/// First balanced `{...}` span, skipping braces inside JSON strings.
pub fn first_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Decode a free-text reply. Errors only when a `{...}` span is present but
/// is not valid JSON.
pub fn parse_reply(reply: &str) -> Result<ActionSuggestion, PilotError> {
    let Some(span) = first_json_object(reply) else {
        debug!("no JSON object in reply, sniffing keywords");
        return Ok(keyword_fallback(reply));
    };
    let map: Map<String, Value> = serde_json::from_str(span)
        .map_err(|e| PilotError::Suggestion(format!("invalid JSON in reply: {}", e)))?;

    Ok(decode(WireSuggestion {
        action_type: field(&map, "action_type"),
        target_element: field(&map, "target_element"),
        additional_input: field(&map, "additional_input"),
    }))
}

fn field(map: &Map<String, Value>, key: &str) -> Option<String> {
    match map.get(key)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Validate the wire payload against the five known action kinds.
pub fn decode(wire: WireSuggestion) -> ActionSuggestion {
    let target = wire
        .target_element
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or(UNKNOWN_TARGET)
        .to_string();
    let input = wire.additional_input.unwrap_or_default();

    let kind = wire
        .action_type
        .as_deref()
        .map(|k| k.trim().to_lowercase())
        .unwrap_or_default();
    match kind.as_str() {
        "click" => ActionSuggestion::Click { target },
        "type" => ActionSuggestion::Type {
            target,
            text: input,
        },
        "navigate" => {
            let url = if input.trim().is_empty() {
                wire.target_element.unwrap_or_default()
            } else {
                input
            };
            ActionSuggestion::Navigate {
                url: url.trim().to_string(),
            }
        }
        "finish" => ActionSuggestion::Finish,
        "wait" | "" => ActionSuggestion::Wait,
        other => {
            warn!("unrecognized action_type '{}', treating as wait", other);
            ActionSuggestion::Wait
        }
    }
}

/// Best guess for replies that carry no JSON at all.
pub fn keyword_fallback(reply: &str) -> ActionSuggestion {
    let text = reply.to_lowercase();
    if text.contains("click") {
        ActionSuggestion::Click {
            target: "button".to_string(),
        }
    } else if text.contains("type") || text.contains("enter") {
        ActionSuggestion::Type {
            target: "input".to_string(),
            text: String::new(),
        }
    } else if text.contains("navigate") {
        ActionSuggestion::Navigate {
            url: url_in(reply).unwrap_or_default(),
        }
    } else if text.contains("finish") || text.contains("complete") {
        ActionSuggestion::Finish
    } else {
        ActionSuggestion::Wait
    }
}

fn url_in(text: &str) -> Option<String> {
    text.split_whitespace()
        .map(|w| w.trim_matches(|c: char| "\"'`()<>[],;:".contains(c)))
        .map(|w| w.trim_end_matches('.'))
        .find(|w| {
            w.contains("://")
                || (w.contains('.') && !w.starts_with('.') && w.len() > 3)
        })
        .map(String::from)
}


#[cfg(test)]
mod tests {
    use super::scripted::ScriptedBrain;
    use super::*;
    use crate::types::{PageType, UiElement};
    use std::path::PathBuf;

    fn entry(step: usize, action: ActionSuggestion) -> HistoryEntry {
        HistoryEntry {
            step,
            action,
            success: true,
        }
    }

    fn click(target: &str) -> ActionSuggestion {
        ActionSuggestion::Click {
            target: target.into(),
        }
    }

    fn search_state() -> UiState {
        UiState {
            url: "https://www.google.com/".into(),
            title: "Google".into(),
            page_type: PageType::SearchHome,
            elements: vec![
                UiElement {
                    kind: "input_text".into(),
                    label: "Search".into(),
                    center: (400, 300),
                },
                UiElement {
                    kind: "input_submit".into(),
                    label: "Google Search".into(),
                    center: (380, 360),
                },
            ],
            screenshot: Some(PathBuf::from("/tmp/shots/step2.png")),
        }
    }

    #[test]
    fn repeated_target_guidance_names_the_target() {
        let history = [entry(1, click("Compose")), entry(2, click("Compose"))];
        let notes = contextual_guidance(&history, &UiState::empty());
        assert_eq!(notes.len(), 1);
        assert!(notes[0].contains("'Compose'"));
        assert!(notes[0].contains("Do not repeat"));
    }

    #[test]
    fn typing_into_search_nudges_toward_search_button() {
        let history = [entry(
            1,
            ActionSuggestion::Type {
                target: "Search box".into(),
                text: "rust".into(),
            },
        )];
        let notes = contextual_guidance(&history, &search_state());
        assert_eq!(notes.len(), 1);
        assert!(notes[0].contains("'Google Search' button"));

        let mut no_button = search_state();
        no_button.elements.truncate(1);
        assert!(contextual_guidance(&history, &no_button).is_empty());
    }

    #[test]
    fn distinct_targets_get_no_guidance() {
        let history = [entry(1, click("Compose")), entry(2, click("Send"))];
        assert!(contextual_guidance(&history, &UiState::empty()).is_empty());
    }

    #[test]
    fn prompt_sections_appear_in_order() {
        let history: Vec<_> = (1..=5)
            .map(|i| entry(i, click(&format!("Link {}", i))))
            .collect();
        let examples = vec![
            RetrievedExample {
                query: "search for rust".into(),
                steps: vec![
                    json!({"ui_tree": [], "action": {"action_type": "click", "target_element": "Search"}}),
                    json!({"action_type": "type", "target_element": "Search", "additional_input": "rust"}),
                    json!({"action_type": "finish"}),
                ],
                similarity: 0.5,
            },
            RetrievedExample {
                query: "b".into(),
                steps: vec![],
                similarity: 0.3,
            },
            RetrievedExample {
                query: "third example".into(),
                steps: vec![],
                similarity: 0.2,
            },
        ];
        let prompt = build_prompt("find rust docs", &search_state(), &history, &examples);

        let order = [
            "Task: find rust docs",
            "page type: search_home",
            "Screenshot: step2.png",
            r#"{"type":"input_text","label":"Search","coordinates":[400,300]}"#,
            "Recent actions:",
            "Similar examples:",
            "Respond with exactly one JSON object",
        ];
        let positions: Vec<_> = order.iter().map(|s| prompt.find(s).unwrap()).collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));

        assert!(!prompt.contains("Link 2"));
        assert!(prompt.contains("- step 5 [ok] click target='Link 5'"));
        assert!(!prompt.contains("third example"));
        assert!(!prompt.contains(r#"{"action_type":"finish"}"#));
        assert!(!prompt.contains("ui_tree"));
    }

    #[test]
    fn history_lines_carry_input() {
        let history = [
            HistoryEntry {
                step: 4,
                action: ActionSuggestion::Navigate {
                    url: "example.com".into(),
                },
                success: false,
            },
            HistoryEntry {
                step: 5,
                action: ActionSuggestion::Type {
                    target: "Search".into(),
                    text: "rust tutorials".into(),
                },
                success: true,
            },
            HistoryEntry {
                step: 6,
                action: ActionSuggestion::Finish,
                success: true,
            },
        ];
        assert_eq!(
            render_history(&history),
            "- step 4 [failed] navigate target='browser' input='example.com'\n\
             - step 5 [ok] type target='Search' input='rust tutorials'\n\
             - step 6 [ok] finish target='task'"
        );
    }

    #[test]
    fn finds_first_balanced_object() {
        let reply = "Sure!\n```json\n{\"action_type\": \"click\", \"target_element\": \"a {b}\"}\n```\n{\"x\": 1}";
        assert_eq!(
            first_json_object(reply),
            Some("{\"action_type\": \"click\", \"target_element\": \"a {b}\"}")
        );
        assert_eq!(first_json_object("{\"a\": {\"b\": 1}} tail"), Some("{\"a\": {\"b\": 1}}"));
        assert_eq!(first_json_object("{\"a\": \"\\\"}\"}"), Some("{\"a\": \"\\\"}\"}"));
        assert_eq!(first_json_object("{ unclosed"), None);
        assert_eq!(first_json_object("no braces"), None);
    }

    #[test]
    fn parses_each_action_kind() {
        assert_eq!(
            parse_reply(r#"{"action_type":"click","target_element":"Compose"}"#).unwrap(),
            click("Compose")
        );
        assert_eq!(
            parse_reply(r#"{"action_type":"Type","target_element":"To","additional_input":"bob"}"#)
                .unwrap(),
            ActionSuggestion::Type {
                target: "To".into(),
                text: "bob".into()
            }
        );
        assert_eq!(
            parse_reply(r#"{"action_type":"finish","target_element":"task"}"#).unwrap(),
            ActionSuggestion::Finish
        );
    }

    #[test]
    fn navigate_takes_url_from_input_then_target() {
        assert_eq!(
            parse_reply(r#"{"action_type":"navigate","additional_input":"example.com"}"#).unwrap(),
            ActionSuggestion::Navigate {
                url: "example.com".into()
            }
        );
        assert_eq!(
            parse_reply(r#"{"action_type":"navigate","target_element":"https://a.test","additional_input":""}"#)
                .unwrap(),
            ActionSuggestion::Navigate {
                url: "https://a.test".into()
            }
        );
    }

    #[test]
    fn missing_fields_default_safely() {
        assert_eq!(
            parse_reply(r#"{"target_element":"Compose"}"#).unwrap(),
            ActionSuggestion::Wait
        );
        assert_eq!(parse_reply(r#"{"action_type":"click"}"#).unwrap(), click("unknown"));
        assert_eq!(
            parse_reply(r#"{"action_type":"click","target_element":"  "}"#).unwrap(),
            click("unknown")
        );
        assert_eq!(
            parse_reply(r#"{"action_type":"type_and_click","target_element":"x"}"#).unwrap(),
            ActionSuggestion::Wait
        );
    }

    #[test]
    fn non_string_values_are_stringified() {
        assert_eq!(
            parse_reply(r#"{"action_type":"type","target_element":"Quantity","additional_input":3}"#)
                .unwrap(),
            ActionSuggestion::Type {
                target: "Quantity".into(),
                text: "3".into()
            }
        );
        assert_eq!(
            parse_reply(r#"{"action_type":"click","target_element":null}"#).unwrap(),
            click("unknown")
        );
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(matches!(
            parse_reply("{action_type: click}"),
            Err(PilotError::Suggestion(_))
        ));
    }

    #[test]
    fn keyword_fallback_follows_priority() {
        assert_eq!(keyword_fallback("I would click it"), click("button"));
        assert_eq!(
            keyword_fallback("Press Enter"),
            ActionSuggestion::Type {
                target: "input".into(),
                text: String::new()
            }
        );
        assert_eq!(
            keyword_fallback("Navigate to example.com."),
            ActionSuggestion::Navigate {
                url: "example.com".into()
            }
        );
        assert_eq!(
            keyword_fallback("navigate somewhere"),
            ActionSuggestion::Navigate { url: String::new() }
        );
        assert_eq!(keyword_fallback("Task complete"), ActionSuggestion::Finish);
        assert_eq!(keyword_fallback("hmm"), ActionSuggestion::Wait);
    }

    #[test]
    fn api_errors_and_missing_content_are_reported() {
        let err = reply_content(false, 401, &json!({"error": {"message": "bad key"}})).unwrap_err();
        assert!(err.to_string().contains("bad key"));
        assert!(reply_content(true, 200, &json!({"choices": []})).is_err());
        assert_eq!(
            reply_content(true, 200, &json!({"choices": [{"message": {"content": "hi"}}]}))
                .unwrap(),
            "hi"
        );
    }

    #[tokio::test]
    async fn failures_fall_back_to_wait() {
        let brain = Arc::new(ScriptedBrain::new(["{action_type: click}"]));
        let suggester = ActionSuggester::new(brain.clone());
        let state = UiState::empty();

        assert_eq!(
            suggester.suggest("task", &state, &[], &[]).await,
            ActionSuggestion::Wait
        );
        // queue is now empty, so the service itself errors
        let action = suggester.suggest("task", &state, &[], &[]).await;
        assert_eq!(
            serde_json::to_value(&action).unwrap(),
            json!({"action_type": "wait", "target_element": "unknown"})
        );
        assert_eq!(brain.prompts().len(), 2);
    }

    #[tokio::test]
    async fn repeated_target_is_still_suggested() {
        let brain = Arc::new(ScriptedBrain::new([
            r#"{"action_type":"click","target_element":"Compose"}"#,
        ]));
        let suggester = ActionSuggester::new(brain.clone());
        let history = [entry(1, click("Compose")), entry(2, click("Compose"))];

        let action = suggester
            .suggest("write an email", &UiState::empty(), &history, &[])
            .await;
        assert_eq!(action, click("Compose"));
        assert!(brain.prompts()[0].contains("Do not repeat an action on 'Compose'"));
    }
}
