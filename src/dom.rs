use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Value of the `data-pilot-ref` attribute the probe scripts stamp on elements.
pub type NodeRef = u32;

/// Selectors that define the interactive surface of a page, in priority order.
pub const INTERACTIVE_SELECTORS: &[&str] = &[
    "input",
    "button",
    "a",
    "select",
    "textarea",
    "[role='button']",
    "[role='link']",
    "[role='textbox']",
    "[tabindex]:not([tabindex='-1'])",
    "div[onclick]",
    "span[onclick]",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn is_on_screen(&self) -> bool {
        self.width > 0.0 && self.height > 0.0 && self.x >= 0.0 && self.y >= 0.0
    }

    pub fn center(&self) -> (i64, i64) {
        (
            (self.x + self.width / 2.0) as i64,
            (self.y + self.height / 2.0) as i64,
        )
    }
}

/// Everything the capturer and resolver need to know about one DOM element.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ElementProbe {
    #[serde(rename = "ref")]
    pub node_ref: NodeRef,
    pub tag: String,
    #[serde(rename = "type")]
    pub input_type: Option<String>,
    pub role: Option<String>,
    pub id: Option<String>,
    pub name: Option<String>,
    pub placeholder: Option<String>,
    pub aria_label: Option<String>,
    pub title: Option<String>,
    pub alt: Option<String>,
    pub value: Option<String>,
    /// Direct text-node children only.
    pub own_text: String,
    /// Whitespace-normalized text content; `None` when too long to be worth comparing.
    pub full_text: Option<String>,
    /// `innerText`, trimmed and cut to 256 chars. Hidden elements can still
    /// report text here; check `visible`.
    pub inner_text: String,
    pub visible: bool,
    pub enabled: bool,
    pub rect: Rect,
}

impl ElementProbe {
    pub fn is_interactable(&self) -> bool {
        self.visible && self.enabled
    }

    /// Short `attr='value'` string naming the element in trace lines.
    pub fn identity(&self) -> String {
        let attrs = [
            ("id", &self.id),
            ("name", &self.name),
            ("aria-label", &self.aria_label),
            ("placeholder", &self.placeholder),
            ("title", &self.title),
            ("value", &self.value),
        ];
        for (attr, value) in attrs {
            if let Some(v) = value.as_deref().filter(|v| !v.is_empty()) {
                return format!("{}='{}'", attr, truncate(v, 50));
            }
        }
        let text = self.inner_text.trim();
        if !text.is_empty() {
            return format!("text='{}'", truncate(text, 50));
        }
        format!("tag='{}'", self.tag)
    }
}

pub(crate) fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

/// CSS selector addressing a probed element.
pub fn ref_selector(node: NodeRef) -> String {
    format!("[data-pilot-ref=\"{}\"]", node)
}

/// The live page, as seen by every component of the loop.
///
/// Implementations are blocking; the orchestrator is the only caller that
/// decides when they run.
pub trait PageDriver: Send + Sync {
    /// Elements matching [`INTERACTIVE_SELECTORS`], selector order first, each once.
    fn interactive_elements(&self) -> Result<Vec<ElementProbe>>;
    /// Every element carrying matchable attributes or text, in DOM order.
    fn all_elements(&self) -> Result<Vec<ElementProbe>>;

    /// Move the pointer over the element and click it.
    fn click(&self, node: NodeRef) -> Result<()>;
    /// Invoke the element's `click()` from page script.
    fn script_click(&self, node: NodeRef) -> Result<()>;
    fn clear(&self, node: NodeRef) -> Result<()>;
    fn type_text(&self, node: NodeRef, text: &str) -> Result<()>;
    fn highlight(&self, node: NodeRef, color: &str) -> Result<()>;

    fn navigate(&self, url: &str) -> Result<()>;
    /// `Ok(false)` when the selector did not show up within `timeout`.
    fn wait_for_selector(&self, selector: &str, timeout: Duration) -> Result<bool>;
    /// `Ok(false)` when the text did not show up within `timeout`.
    fn wait_for_text(&self, text: &str, timeout: Duration) -> Result<bool>;

    fn url(&self) -> Result<String>;
    fn title(&self) -> Result<String>;
    fn content(&self) -> Result<String>;
    fn screenshot(&self, path: &Path) -> Result<()>;

    /// Close the browser. Called once, when the owning run ends.
    fn release(&self);
}

/// Shared helpers injected ahead of both probe scripts.
///
/// Reads the DOM without changing layout; the only write is the
/// `data-pilot-ref` attribute, which is stable across calls.
const PROBE_PRELUDE: &str = r#"
  window.__pilotNextRef = window.__pilotNextRef || 1;
  function stamp(el) {
    let r = el.getAttribute('data-pilot-ref');
    if (!r) {
      r = String(window.__pilotNextRef++);
      el.setAttribute('data-pilot-ref', r);
    }
    return Number(r);
  }

  function isVisible(el) {
    if (el.offsetParent === null && el.tagName !== 'BODY' && getComputedStyle(el).position !== 'fixed') return false;
    const s = getComputedStyle(el);
    return s.display !== 'none' && s.visibility !== 'hidden' && s.opacity !== '0';
  }

  function describe(el) {
    const r = el.getBoundingClientRect();
    let own = '';
    for (const n of el.childNodes) if (n.nodeType === 3) own += n.textContent;
    const full = (el.textContent || '').replace(/\s+/g, ' ').trim();
    const value = (typeof el.value === 'string') ? el.value : el.getAttribute('value');
    return {
      ref: stamp(el),
      tag: el.tagName.toLowerCase(),
      type: el.getAttribute('type'),
      role: el.getAttribute('role'),
      id: el.id || null,
      name: el.getAttribute('name'),
      placeholder: el.getAttribute('placeholder'),
      ariaLabel: el.getAttribute('aria-label'),
      title: el.getAttribute('title'),
      alt: el.getAttribute('alt'),
      value: value || null,
      ownText: own,
      fullText: full.length <= 256 ? full : null,
      innerText: (el.innerText || '').trim().slice(0, 256),
      visible: isVisible(el),
      enabled: !el.disabled,
      rect: { x: r.x, y: r.y, width: r.width, height: r.height },
    };
  }
"#;

/// Script returning the interactive elements as a JSON string.
pub fn interactive_script() -> String {
    let selectors = serde_json::to_string(INTERACTIVE_SELECTORS).unwrap_or_else(|_| "[]".into());
    format!(
        r#"(() => {{
{PROBE_PRELUDE}
  const seen = new Set();
  const out = [];
  for (const sel of {selectors}) {{
    for (const el of document.querySelectorAll(sel)) {{
      if (seen.has(el)) continue;
      seen.add(el);
      out.push(describe(el));
    }}
  }}
  return JSON.stringify(out);
}})()"#
    )
}

/// Script returning every matchable element as a JSON string.
pub fn all_elements_script() -> String {
    format!(
        r#"(() => {{
{PROBE_PRELUDE}
  const ATTRS = ['placeholder','aria-label','name','id','title','value','type'];
  const SKIP = new Set(['SCRIPT','STYLE','NOSCRIPT','SVG','LINK','META']);
  const out = [];
  for (const el of document.querySelectorAll('body, body *')) {{
    if (SKIP.has(el.tagName.toUpperCase())) continue;
    let hasText = false;
    for (const n of el.childNodes) if (n.nodeType === 3 && n.textContent.trim()) {{ hasText = true; break; }}
    if (!hasText && el.tagName !== 'A' && !ATTRS.some(a => el.hasAttribute(a))) continue;
    out.push(describe(el));
  }}
  return JSON.stringify(out);
}})()"#
    )
}

/// Decode the JSON string a probe script produced.
pub fn parse_probes(raw: &str) -> Result<Vec<ElementProbe>> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(raw).context("probe script returned malformed JSON")
}

/// Quote `input` as an XPath string literal.
pub fn xpath_literal(input: &str) -> String {
    if !input.contains('"') {
        return format!("\"{input}\"");
    }
    if !input.contains('\'') {
        return format!("'{input}'");
    }
    let parts: Vec<String> = input
        .split('"')
        .map(|part| format!("\"{part}\""))
        .collect();
    format!("concat({})", parts.join(",'\"',"))
}


#[cfg(test)]
mod tests {
    use super::fake::probe;
    use super::*;

    #[test]
    fn identity_prefers_id_then_text_then_tag() {
        let mut el = probe(1, "button");
        assert_eq!(el.identity(), "tag='button'");
        el.inner_text = "Send".into();
        assert_eq!(el.identity(), "text='Send'");
        el.name = Some("send-btn".into());
        assert_eq!(el.identity(), "name='send-btn'");
        el.id = Some("send".into());
        assert_eq!(el.identity(), "id='send'");
    }

    #[test]
    fn parses_probe_json_from_script() {
        let raw = r#"[{"ref":7,"tag":"input","type":"search","placeholder":"Search",
            "ownText":"","fullText":"","innerText":"","visible":true,"enabled":true,
            "rect":{"x":1,"y":2,"width":30,"height":10}}]"#;
        let probes = parse_probes(raw).unwrap();
        assert_eq!(probes.len(), 1);
        assert_eq!(probes[0].node_ref, 7);
        assert_eq!(probes[0].input_type.as_deref(), Some("search"));
        assert_eq!(probes[0].rect.center(), (16, 7));
        assert!(parse_probes("").unwrap().is_empty());
    }

    #[test]
    fn hidden_elements_keep_their_text_but_are_not_interactable() {
        let raw = r#"[{"ref":3,"tag":"a","ownText":"Archive","fullText":"Archive",
            "innerText":"Archive","visible":false,"enabled":true,
            "rect":{"x":0,"y":0,"width":0,"height":0}}]"#;
        let probes = parse_probes(raw).unwrap();
        assert_eq!(probes[0].inner_text, "Archive");
        assert!(!probes[0].is_interactable());
    }

    #[test]
    fn xpath_literal_handles_both_quote_kinds() {
        assert_eq!(xpath_literal("Inbox"), "\"Inbox\"");
        assert_eq!(xpath_literal("say \"hi\""), "'say \"hi\"'");
        assert_eq!(
            xpath_literal(r#"it's "x""#),
            r#"concat("it's ",'"',"x",'"',"")"#
        );
    }

    #[test]
    fn off_screen_rects_are_rejected() {
        let rect = Rect {
            x: -5.0,
            y: 0.0,
            width: 10.0,
            height: 10.0,
        };
        assert!(!rect.is_on_screen());
        assert!(!Rect::default().is_on_screen());
    }
}
