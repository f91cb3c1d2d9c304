use std::time::Duration;
use tracing::{debug, info, warn};

use crate::dom::{ElementProbe, PageDriver};
use crate::error::PilotError;
use crate::resolver::ElementResolver;
use crate::types::{ActionSuggestion, ExecutionResult};

/// Container a search-results page renders once results are in.
pub const RESULTS_CONTAINER: &str = "#search";

/// Prefix `https://` unless the URL already names a scheme.
pub fn normalize_url(url: &str) -> String {
    let url = url.trim();
    if url.starts_with("http://") || url.starts_with("https://") || url.contains("://") {
        url.to_string()
    } else {
        format!("https://{}", url)
    }
}

/// Performs one [`ActionSuggestion`] against the page.
#[derive(Debug, Clone)]
pub struct ActionExecutor {
    resolver: ElementResolver,
    post_click_selector: Option<String>,
    post_click_wait: Duration,
}

impl ActionExecutor {
    pub fn new(post_click_wait: Duration) -> Self {
        Self {
            resolver: ElementResolver,
            post_click_selector: Some(RESULTS_CONTAINER.to_string()),
            post_click_wait,
        }
    }

    /// Skip the best-effort wait for a results container after clicks.
    pub fn without_post_click_wait(mut self) -> Self {
        self.post_click_selector = None;
        self
    }

    pub fn execute(&self, action: &ActionSuggestion, page: &dyn PageDriver) -> ExecutionResult {
        let mut trace = Vec::new();
        let outcome = match action {
            ActionSuggestion::Click { target } => self.click(target, page, &mut trace),
            ActionSuggestion::Type { target, text } => {
                self.type_into(target, text, page, &mut trace)
            }
            ActionSuggestion::Navigate { url } => self.navigate(url, page),
            ActionSuggestion::Wait => {
                info!("manual intervention required");
                Ok("Manual intervention required".to_string())
            }
            ActionSuggestion::Finish => {
                info!("task completed");
                Ok("Task completed".to_string())
            }
        };

        match outcome {
            Ok(message) => ExecutionResult::ok(message).with_trace(trace),
            Err(e) => {
                warn!("{} failed: {}", action.kind(), e);
                ExecutionResult::failed(e.to_string()).with_trace(trace)
            }
        }
    }

    fn locate(
        &self,
        target: &str,
        page: &dyn PageDriver,
        trace: &mut Vec<String>,
    ) -> Result<ElementProbe, PilotError> {
        let resolution = self.resolver.resolve(target, page);
        trace.extend(resolution.trace());
        resolution
            .element
            .ok_or_else(|| PilotError::Resolution(target.trim().to_string()))
    }

    fn click(
        &self,
        target: &str,
        page: &dyn PageDriver,
        trace: &mut Vec<String>,
    ) -> Result<String, PilotError> {
        let el = self.locate(target, page, trace)?;
        let who = el.identity();
        let (x, y) = el.rect.center();
        info!("attempting to click '{}' [{}] at {},{}", target, who, x, y);

        match page.click(el.node_ref) {
            Ok(()) => trace.push(format!("clicked [{}]", who)),
            Err(e) => {
                warn!("pointer click on [{}] failed: {:#}; trying script click", who, e);
                trace.push(format!("pointer click on [{}] failed: {:#}", who, e));
                page.script_click(el.node_ref).map_err(|js| {
                    PilotError::execution(
                        "click",
                        format!("pointer click: {:#}; script click: {:#}", e, js),
                    )
                })?;
                info!("clicked [{}] via script", who);
                trace.push(format!("clicked [{}] via script", who));
            }
        }

        if let Some(selector) = &self.post_click_selector {
            match page.wait_for_selector(selector, self.post_click_wait) {
                Ok(true) => info!("search results page detected"),
                Ok(false) => debug!("results container {} not detected", selector),
                Err(e) => debug!("waiting for {} failed: {:#}", selector, e),
            }
        }

        Ok(format!("Clicked: {}", target))
    }

    fn type_into(
        &self,
        target: &str,
        text: &str,
        page: &dyn PageDriver,
        trace: &mut Vec<String>,
    ) -> Result<String, PilotError> {
        let el = self.locate(target, page, trace)?;
        let who = el.identity();
        page.clear(el.node_ref)
            .and_then(|()| page.type_text(el.node_ref, text))
            .map_err(|e| PilotError::execution("type", format!("{:#}", e)))?;
        info!("typed '{}' in [{}]", text, who);
        trace.push(format!("typed into [{}]", who));
        Ok(format!("Typed '{}' in: {}", text, target))
    }

    fn navigate(&self, url: &str, page: &dyn PageDriver) -> Result<String, PilotError> {
        if url.trim().is_empty() {
            return Err(PilotError::execution("navigate", "no URL given"));
        }
        let url = normalize_url(url);
        page.navigate(&url)
            .map_err(|e| PilotError::execution("navigate", format!("{:#}", e)))?;
        info!("navigated to {}", url);
        Ok(format!("Navigated to: {}", url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::fake::{FakePage, probe, texted};

    fn compose_page() -> FakePage {
        FakePage::new()
            .with(ElementProbe {
                role: Some("button".into()),
                ..texted(4, "div", "Compose")
            })
            .with(ElementProbe {
                aria_label: Some("To recipients".into()),
                ..probe(5, "input")
            })
    }

    fn click(target: &str) -> ActionSuggestion {
        ActionSuggestion::Click {
            target: target.into(),
        }
    }

    #[test]
    fn click_uses_pointer_then_waits_for_results() {
        let page = compose_page();
        let result =
            ActionExecutor::new(Duration::from_millis(10)).execute(&click("Compose"), &page);
        assert!(result.success);
        assert_eq!(result.message, "Clicked: Compose");
        assert_eq!(
            page.calls(),
            vec![
                "highlight 4 lime".to_string(),
                "click 4".to_string(),
                "wait_for_selector #search".to_string(),
            ]
        );
    }

    #[test]
    fn click_falls_back_to_script_click() {
        let page = FakePage {
            fail_click: true,
            ..compose_page()
        };
        let executor = ActionExecutor::new(Duration::ZERO).without_post_click_wait();
        let result = executor.execute(&click("Compose"), &page);
        assert!(result.success);
        assert!(page.calls().contains(&"script_click 4".to_string()));
        assert!(result.trace.iter().any(|l| l.contains("via script")));
    }

    #[test]
    fn click_fails_when_both_paths_fail() {
        let page = FakePage {
            fail_click: true,
            fail_script_click: true,
            ..compose_page()
        };
        let result = ActionExecutor::new(Duration::ZERO).execute(&click("Compose"), &page);
        assert!(!result.success);
        assert!(result.message.starts_with("click failed"));
    }

    #[test]
    fn missing_results_container_does_not_fail_click() {
        let page = compose_page();
        let result = ActionExecutor::new(Duration::ZERO).execute(&click("Compose"), &page);
        assert!(result.success);

        let page = FakePage {
            present_selectors: vec![RESULTS_CONTAINER.to_string()],
            ..compose_page()
        };
        assert!(
            ActionExecutor::new(Duration::ZERO)
                .execute(&click("Compose"), &page)
                .success
        );
    }

    #[test]
    fn unresolved_target_is_a_failure_with_trace() {
        let page = compose_page();
        let result = ActionExecutor::new(Duration::ZERO).execute(&click("Send"), &page);
        assert!(!result.success);
        assert_eq!(result.message, "no element found for target 'Send'");
        assert!(!result.trace.is_empty());
        assert!(page.calls().is_empty());
    }

    #[test]
    fn type_clears_then_types() {
        let page = compose_page();
        let action = ActionSuggestion::Type {
            target: "To recipients".into(),
            text: "bob@example.com".into(),
        };
        let result = ActionExecutor::new(Duration::ZERO).execute(&action, &page);
        assert!(result.success);
        assert_eq!(
            page.calls()[1..],
            ["clear 5".to_string(), "type 5 bob@example.com".to_string()]
        );
    }

    #[test]
    fn navigate_prefixes_missing_scheme() {
        let page = FakePage::new();
        let action = ActionSuggestion::Navigate {
            url: "example.com".into(),
        };
        let result = ActionExecutor::new(Duration::ZERO).execute(&action, &page);
        assert!(result.success);
        assert_eq!(page.calls(), vec!["navigate https://example.com".to_string()]);
    }

    #[test]
    fn normalize_url_keeps_existing_schemes() {
        assert_eq!(normalize_url("http://a.test"), "http://a.test");
        assert_eq!(normalize_url(" www.rust-lang.org "), "https://www.rust-lang.org");
        assert_eq!(normalize_url("file:///tmp/x.html"), "file:///tmp/x.html");
    }

    #[test]
    fn empty_navigate_fails() {
        let page = FakePage::new();
        let action = ActionSuggestion::Navigate { url: " ".into() };
        assert!(!ActionExecutor::new(Duration::ZERO).execute(&action, &page).success);
        assert!(page.calls().is_empty());
    }

    #[test]
    fn wait_and_finish_succeed_without_touching_the_page() {
        let page = FakePage::new();
        let executor = ActionExecutor::new(Duration::ZERO);
        assert!(executor.execute(&ActionSuggestion::Wait, &page).success);
        assert!(executor.execute(&ActionSuggestion::Finish, &page).success);
        assert!(page.calls().is_empty());
    }
}
