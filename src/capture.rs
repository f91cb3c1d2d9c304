use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::dom::{ElementProbe, PageDriver, truncate};
use crate::types::{PageType, UiElement, UiState};

const MAX_LABEL_CHARS: usize = 50;

/// Produces the bounded [`UiState`] snapshot the suggestion step works from.
#[derive(Debug, Clone)]
pub struct UiStateCapturer {
    screenshots_dir: PathBuf,
    max_elements: usize,
}

impl UiStateCapturer {
    pub fn new(screenshots_dir: impl Into<PathBuf>, max_elements: usize) -> Self {
        Self {
            screenshots_dir: screenshots_dir.into(),
            max_elements,
        }
    }

    pub fn screenshot_path(&self, step: usize) -> PathBuf {
        self.screenshots_dir.join(format!("step{}.png", step))
    }

    /// Capture the page for `step`. Never fails; a missing page yields an
    /// empty state.
    pub fn capture(&self, page: Option<&dyn PageDriver>, step: usize) -> UiState {
        let Some(page) = page else {
            warn!("no page available, returning empty UI state");
            return UiState::empty();
        };

        let path = self.screenshot_path(step);
        let screenshot = match page.screenshot(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "screenshot saved");
                Some(path)
            }
            Err(e) => {
                warn!("screenshot for step {} failed: {:#}", step, e);
                None
            }
        };

        let elements = match page.interactive_elements() {
            Ok(probes) => self.simplify(&probes),
            Err(e) => {
                warn!("error building UI element list: {:#}", e);
                Vec::new()
            }
        };
        info!("captured {} interactive UI elements", elements.len());

        let url = page.url().unwrap_or_default();
        let html = page.content().unwrap_or_default();
        UiState {
            page_type: PageType::detect(&url, &html),
            title: page.title().unwrap_or_default(),
            url,
            elements,
            screenshot,
        }
    }

    /// Keep visible, enabled, on-screen elements in selector order, up to the cap.
    pub fn simplify(&self, probes: &[ElementProbe]) -> Vec<UiElement> {
        probes
            .iter()
            .filter(|p| p.is_interactable() && p.rect.is_on_screen())
            .take(self.max_elements)
            .map(|p| UiElement {
                kind: element_kind(p),
                label: element_label(p),
                center: p.rect.center(),
            })
            .collect()
    }
}

pub fn element_kind(probe: &ElementProbe) -> String {
    match probe.tag.as_str() {
        "input" => format!(
            "input_{}",
            probe
                .input_type
                .as_deref()
                .filter(|t| !t.is_empty())
                .unwrap_or("text")
        ),
        "a" => "link".to_string(),
        "img" => "image".to_string(),
        "select" | "textarea" => probe.tag.clone(),
        tag => match probe.role.as_deref().filter(|r| !r.is_empty()) {
            Some(role) => format!("role_{}", role),
            None => tag.to_string(),
        },
    }
}

pub fn element_label(probe: &ElementProbe) -> String {
    let attrs = [
        &probe.aria_label,
        &probe.placeholder,
        &probe.title,
        &probe.alt,
        &probe.name,
        &probe.value,
    ];
    let from_attrs = attrs
        .into_iter()
        .filter_map(|a| a.as_deref())
        .map(str::trim)
        .find(|a| !a.is_empty());
    if let Some(label) = from_attrs {
        return truncate(label, MAX_LABEL_CHARS);
    }

    let text = probe.inner_text.trim();
    if !text.is_empty() {
        return truncate(text, MAX_LABEL_CHARS);
    }

    format!(
        "{}_{}",
        probe.tag,
        probe
            .input_type
            .as_deref()
            .filter(|t| !t.is_empty())
            .unwrap_or("unknown")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::fake::{FakePage, probe, texted};
    use crate::dom::Rect;

    fn search_page() -> FakePage {
        FakePage::new()
            .with(ElementProbe {
                input_type: Some("search".into()),
                placeholder: Some("Search".into()),
                name: Some("q".into()),
                ..probe(1, "input")
            })
            .with(texted(2, "button", "Google Search"))
            .with(ElementProbe {
                visible: false,
                ..texted(3, "a", "Hidden link")
            })
            .with(texted(4, "a", "Images"))
    }

    #[test]
    fn capture_filters_and_derives_descriptors() {
        let page = search_page();
        let capturer = UiStateCapturer::new("/tmp/shots", 20);
        let state = capturer.capture(Some(&page), 3);

        assert_eq!(state.url, "https://example.com/");
        assert_eq!(state.screenshot, Some(PathBuf::from("/tmp/shots/step3.png")));
        let labels: Vec<_> = state.elements.iter().map(|e| e.label.as_str()).collect();
        assert_eq!(labels, ["Search", "Google Search", "Images"]);
        assert_eq!(state.elements[0].kind, "input_search");
        assert_eq!(state.elements[2].kind, "link");
        assert_eq!(state.elements[0].center, (60, 35));
        assert!(page.calls().contains(&"screenshot /tmp/shots/step3.png".to_string()));
    }

    #[test]
    fn capture_is_idempotent_on_unchanged_page() {
        let page = search_page();
        let capturer = UiStateCapturer::new("/tmp/shots", 20);
        let first = capturer.capture(Some(&page), 1);
        let second = capturer.capture(Some(&page), 2);
        assert_eq!(first.elements, second.elements);
    }

    #[test]
    fn truncation_follows_selector_order() {
        let page = search_page();
        let capturer = UiStateCapturer::new("/tmp/shots", 2);
        let state = capturer.capture(Some(&page), 1);
        let labels: Vec<_> = state.elements.iter().map(|e| e.label.as_str()).collect();
        assert_eq!(labels, ["Search", "Google Search"]);
    }

    #[test]
    fn missing_page_yields_empty_state() {
        let capturer = UiStateCapturer::new("/tmp/shots", 20);
        assert_eq!(capturer.capture(None, 1), UiState::empty());
    }

    #[test]
    fn probe_and_screenshot_failures_degrade_gracefully() {
        let page = FakePage {
            fail_probe: true,
            fail_screenshot: true,
            ..search_page()
        };
        let state = UiStateCapturer::new("/tmp/shots", 20).capture(Some(&page), 1);
        assert!(state.elements.is_empty());
        assert!(state.screenshot.is_none());
        assert_eq!(state.title, "Example");
    }

    #[test]
    fn off_screen_and_zero_sized_elements_are_dropped() {
        let page = FakePage::new()
            .with(ElementProbe {
                rect: Rect {
                    x: -20.0,
                    y: 5.0,
                    width: 10.0,
                    height: 10.0,
                },
                ..texted(1, "button", "Offscreen")
            })
            .with(ElementProbe {
                rect: Rect::default(),
                ..texted(2, "button", "Collapsed")
            })
            .with(texted(3, "button", "Shown"));
        let state = UiStateCapturer::new("/tmp/shots", 20).capture(Some(&page), 1);
        assert_eq!(state.elements.len(), 1);
        assert_eq!(state.elements[0].label, "Shown");
    }

    #[test]
    fn labels_fall_back_in_attribute_order() {
        let mut el = probe(1, "input");
        assert_eq!(element_label(&el), "input_unknown");
        el.input_type = Some(String::new());
        assert_eq!(element_label(&el), "input_unknown");
        el.input_type = Some("email".into());
        assert_eq!(element_label(&el), "input_email");
        el.inner_text = "visible".into();
        assert_eq!(element_label(&el), "visible");
        el.value = Some("  ".into());
        assert_eq!(element_label(&el), "visible");
        el.name = Some("email".into());
        assert_eq!(element_label(&el), "email");
        el.aria_label = Some("x".repeat(80));
        assert_eq!(element_label(&el).chars().count(), 50);
    }

    #[test]
    fn kinds_come_from_tag_type_and_role() {
        assert_eq!(element_kind(&probe(1, "input")), "input_text");
        assert_eq!(element_kind(&probe(1, "textarea")), "textarea");
        assert_eq!(element_kind(&probe(1, "button")), "button");
        let div = ElementProbe {
            role: Some("button".into()),
            ..probe(1, "div")
        };
        assert_eq!(element_kind(&div), "role_button");
    }
}
