//! Natural-language target → concrete element.
//!
//! The cascade is an ordered list of [`Strategy`] values, each a pure
//! predicate over [`ElementProbe`]. The first strategy that matches at least
//! one visible, enabled element wins; there is no scoring across strategies.

use std::fmt;
use tracing::{debug, info, warn};

use crate::dom::{ElementProbe, NodeRef, PageDriver};

/// One deterministic rule for mapping a description onto an element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    PlaceholderExact,
    PlaceholderContains,
    AriaLabelExact,
    AriaLabelContains,
    TextContains,
    TextExact,
    NameExact,
    IdExact,
    SearchTypeInput,
    SearchNameQ,
    SearchNameSearch,
    TitleContains,
    ValueContains,
    AnchorTextContains,
    AnchorTextExact,
    /// Last resort: every anchor's rendered text, trimmed and lower-cased.
    AnchorScan,
}

/// Cascade order. Earlier entries win.
pub const CASCADE: &[Strategy] = &[
    Strategy::PlaceholderExact,
    Strategy::PlaceholderContains,
    Strategy::AriaLabelExact,
    Strategy::AriaLabelContains,
    Strategy::TextContains,
    Strategy::TextExact,
    Strategy::NameExact,
    Strategy::IdExact,
    Strategy::SearchTypeInput,
    Strategy::SearchNameQ,
    Strategy::SearchNameSearch,
    Strategy::TitleContains,
    Strategy::ValueContains,
    Strategy::AnchorTextContains,
    Strategy::AnchorTextExact,
    Strategy::AnchorScan,
];

/// A trimmed target and its lower-cased form.
#[derive(Debug, Clone)]
pub struct Target {
    pub raw: String,
    pub lower: String,
}

impl Target {
    /// `None` for empty or whitespace-only descriptions.
    pub fn parse(description: &str) -> Option<Self> {
        let raw = description.trim();
        if raw.is_empty() {
            return None;
        }
        Some(Self {
            raw: raw.to_string(),
            lower: raw.to_lowercase(),
        })
    }
}

fn attr_eq(attr: &Option<String>, target: &str) -> bool {
    attr.as_deref() == Some(target)
}

fn attr_contains(attr: &Option<String>, target: &str) -> bool {
    attr.as_deref().is_some_and(|a| a.contains(target))
}

fn normalize_space(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

impl Strategy {
    pub fn name(self) -> &'static str {
        match self {
            Strategy::PlaceholderExact => "placeholder-exact",
            Strategy::PlaceholderContains => "placeholder-contains",
            Strategy::AriaLabelExact => "aria-label-exact",
            Strategy::AriaLabelContains => "aria-label-contains",
            Strategy::TextContains => "text-contains",
            Strategy::TextExact => "text-exact",
            Strategy::NameExact => "name",
            Strategy::IdExact => "id",
            Strategy::SearchTypeInput => "input-type-search",
            Strategy::SearchNameQ => "input-name-q",
            Strategy::SearchNameSearch => "input-name-search",
            Strategy::TitleContains => "title-contains",
            Strategy::ValueContains => "value-contains",
            Strategy::AnchorTextContains => "anchor-text-contains",
            Strategy::AnchorTextExact => "anchor-text-exact",
            Strategy::AnchorScan => "anchor-scan",
        }
    }

    /// Whether `el` satisfies this rule for `target`, ignoring visibility.
    pub fn matches(self, el: &ElementProbe, target: &Target) -> bool {
        let t = target.raw.as_str();
        let is_input = el.tag == "input";
        let is_anchor = el.tag == "a";
        match self {
            Strategy::PlaceholderExact => is_input && attr_eq(&el.placeholder, t),
            Strategy::PlaceholderContains => is_input && attr_contains(&el.placeholder, t),
            Strategy::AriaLabelExact => attr_eq(&el.aria_label, t),
            Strategy::AriaLabelContains => attr_contains(&el.aria_label, t),
            Strategy::TextContains => el.own_text.to_lowercase().contains(&target.lower),
            Strategy::TextExact => el.full_text.as_deref() == Some(t),
            Strategy::NameExact => attr_eq(&el.name, t),
            Strategy::IdExact => attr_eq(&el.id, t),
            Strategy::SearchTypeInput => is_input && attr_eq(&el.input_type, "search"),
            Strategy::SearchNameQ => is_input && attr_eq(&el.name, "q"),
            Strategy::SearchNameSearch => is_input && attr_eq(&el.name, "search"),
            Strategy::TitleContains => attr_contains(&el.title, t),
            Strategy::ValueContains => is_input && attr_contains(&el.value, t),
            Strategy::AnchorTextContains => {
                is_anchor && el.own_text.to_lowercase().contains(&target.lower)
            }
            Strategy::AnchorTextExact => is_anchor && normalize_space(&el.own_text) == t,
            Strategy::AnchorScan => {
                is_anchor && el.inner_text.trim().to_lowercase() == target.lower
            }
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Matched(NodeRef),
    NoMatch,
    /// Elements matched but none was visible and enabled.
    NotInteractable(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyAttempt {
    pub strategy: Strategy,
    pub outcome: AttemptOutcome,
}

impl fmt::Display for StrategyAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            AttemptOutcome::Matched(node) => write!(f, "{}: matched ref {}", self.strategy, node),
            AttemptOutcome::NoMatch => write!(f, "{}: no match", self.strategy),
            AttemptOutcome::NotInteractable(n) => write!(
                f,
                "{}: {} match(es), none visible and enabled",
                self.strategy, n
            ),
        }
    }
}

/// What the cascade found, and how it got there.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub element: Option<ElementProbe>,
    pub strategy: Option<Strategy>,
    pub attempts: Vec<StrategyAttempt>,
    /// Non-empty anchor texts seen on the page, filled only when nothing matched.
    pub anchor_texts: Vec<String>,
}

impl Resolution {
    pub fn is_found(&self) -> bool {
        self.element.is_some()
    }

    /// Human-readable log of every attempt, for the execution trace.
    pub fn trace(&self) -> Vec<String> {
        let mut lines: Vec<String> = self.attempts.iter().map(|a| a.to_string()).collect();
        if !self.is_found() && !self.anchor_texts.is_empty() {
            lines.push(format!("anchor texts seen: {:?}", self.anchor_texts));
        }
        lines
    }
}

/// Run the cascade over an already-probed element list.
pub fn resolve_in(description: &str, elements: &[ElementProbe]) -> Resolution {
    let Some(target) = Target::parse(description) else {
        debug!("empty or invalid target description, skipping element search");
        return Resolution::default();
    };

    let mut resolution = Resolution::default();
    for &strategy in CASCADE {
        let mut matched = elements.iter().filter(|el| strategy.matches(el, &target));
        let mut hidden = 0;
        let found = matched.find(|el| {
            let ok = el.is_interactable();
            if !ok {
                hidden += 1;
            }
            ok
        });

        let outcome = match found {
            Some(el) => AttemptOutcome::Matched(el.node_ref),
            None if hidden > 0 => AttemptOutcome::NotInteractable(hidden),
            None => AttemptOutcome::NoMatch,
        };
        let attempt = StrategyAttempt { strategy, outcome };
        debug!(target = %target.raw, "{}", attempt);
        resolution.attempts.push(attempt);

        if let Some(el) = found {
            info!(
                "found element for '{}' by {}: {}",
                target.raw,
                strategy,
                el.identity()
            );
            resolution.element = Some(el.clone());
            resolution.strategy = Some(strategy);
            return resolution;
        }
    }

    resolution.anchor_texts = elements
        .iter()
        .filter(|el| el.tag == "a")
        .map(|el| el.inner_text.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    for text in &resolution.anchor_texts {
        debug!("link text on page: '{}'", text);
    }
    warn!("no element found for target '{}'", target.raw);
    resolution
}

/// Resolves target descriptions against the live page.
#[derive(Debug, Clone, Copy, Default)]
pub struct ElementResolver;

impl ElementResolver {
    pub fn resolve(&self, description: &str, page: &dyn PageDriver) -> Resolution {
        if Target::parse(description).is_none() {
            return resolve_in(description, &[]);
        }

        let elements = match page.all_elements() {
            Ok(elements) => elements,
            Err(e) => {
                warn!("could not probe page for '{}': {:#}", description.trim(), e);
                return Resolution::default();
            }
        };

        let resolution = resolve_in(description, &elements);
        if let (Some(el), Some(strategy)) = (&resolution.element, resolution.strategy) {
            let color = if strategy == Strategy::AnchorScan {
                "red"
            } else {
                "lime"
            };
            if let Err(e) = page.highlight(el.node_ref, color) {
                debug!("could not outline {}: {:#}", el.identity(), e);
            }
        }
        resolution
    }
}
