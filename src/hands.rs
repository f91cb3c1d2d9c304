use anyhow::{Context, Result, anyhow};
use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use headless_chrome::{Browser, Element, LaunchOptions, Tab};
use serde_json::json;
use std::ffi::OsStr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::PilotConfig;
use crate::dom::{
    self, ElementProbe, NodeRef, PageDriver, all_elements_script, interactive_script, xpath_literal,
};

const HIDE_WEBDRIVER_JS: &str =
    "Object.defineProperty(navigator, 'webdriver', {get: () => undefined})";

const CLEAR_JS: &str = r#"function () {
  if ('value' in this) { this.value = ''; }
  else if (this.isContentEditable) { this.textContent = ''; }
  this.dispatchEvent(new Event('input', { bubbles: true }));
}"#;

/// The one Chrome instance a run drives. Created once by the caller, then
/// handed to the orchestrator, which releases it when the run ends.
pub struct ChromeSession {
    browser: Mutex<Option<Browser>>,
    tab: Arc<Tab>,
}

impl ChromeSession {
    pub fn launch(config: &PilotConfig) -> Result<Self> {
        if let Some(url) = &config.devtools_url {
            info!(%url, "attempting to attach to existing Chrome");
            match Browser::connect(url.clone()) {
                Ok(browser) => {
                    let existing = {
                        let tabs = browser
                            .get_tabs()
                            .lock()
                            .map_err(|_| anyhow!("tab list lock poisoned"))?;
                        tabs.first().cloned()
                    };
                    let tab = match existing {
                        Some(tab) => {
                            debug!("using existing tab");
                            tab
                        }
                        None => browser.new_tab()?,
                    };
                    info!("attached to existing Chrome");
                    return Self::prepare(browser, tab, config);
                }
                Err(e) => warn!("could not attach ({}), launching a new Chrome", e),
            }
        }

        let mut args = vec![
            OsStr::new("--no-first-run"),
            OsStr::new("--no-default-browser-check"),
            OsStr::new("--disable-blink-features=AutomationControlled"),
            OsStr::new("--disable-infobars"),
        ];
        if !config.headless {
            args.push(OsStr::new("--start-maximized"));
        }

        let options = LaunchOptions {
            headless: config.headless,
            path: config.chrome_path.clone(),
            window_size: config.headless.then_some((1920, 1080)),
            args,
            idle_browser_timeout: Duration::from_secs(600),
            ..Default::default()
        };

        info!(headless = config.headless, "starting Chrome");
        let browser = Browser::new(options).context("browser launch failed")?;
        let tab = browser.new_tab()?;
        tab.navigate_to("about:blank")?;
        Self::prepare(browser, tab, config)
    }

    fn prepare(browser: Browser, tab: Arc<Tab>, config: &PilotConfig) -> Result<Self> {
        tab.set_default_timeout(config.implicit_wait);
        if let Err(e) = tab.evaluate(HIDE_WEBDRIVER_JS, false) {
            debug!("could not hide webdriver flag: {}", e);
        }
        info!(
            implicit_wait = ?config.implicit_wait,
            explicit_wait = ?config.explicit_wait,
            "Chrome ready"
        );
        Ok(Self {
            browser: Mutex::new(Some(browser)),
            tab,
        })
    }

    fn element(&self, node: NodeRef) -> Result<Element<'_>> {
        self.tab
            .find_element(&dom::ref_selector(node))
            .with_context(|| format!("element ref {} is no longer on the page", node))
    }

    fn eval_string(&self, script: &str) -> Result<String> {
        let result = self.tab.evaluate(script, false)?;
        Ok(result
            .value
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_default())
    }

    fn probe(&self, script: &str) -> Result<Vec<ElementProbe>> {
        let raw = self.eval_string(script)?;
        dom::parse_probes(&raw)
    }
}

impl PageDriver for ChromeSession {
    fn interactive_elements(&self) -> Result<Vec<ElementProbe>> {
        self.probe(&interactive_script())
    }

    fn all_elements(&self) -> Result<Vec<ElementProbe>> {
        self.probe(&all_elements_script())
    }

    fn click(&self, node: NodeRef) -> Result<()> {
        let el = self.element(node)?;
        el.move_mouse_over()?;
        el.click()?;
        Ok(())
    }

    fn script_click(&self, node: NodeRef) -> Result<()> {
        self.element(node)?
            .call_js_fn("function () { this.click(); }", vec![], false)?;
        Ok(())
    }

    fn clear(&self, node: NodeRef) -> Result<()> {
        self.element(node)?.call_js_fn(CLEAR_JS, vec![], false)?;
        Ok(())
    }

    fn type_text(&self, node: NodeRef, text: &str) -> Result<()> {
        self.element(node)?.type_into(text)?;
        Ok(())
    }

    fn highlight(&self, node: NodeRef, color: &str) -> Result<()> {
        self.element(node)?.call_js_fn(
            "function (c) { this.style.outline = '3px solid ' + c; }",
            vec![json!(color)],
            false,
        )?;
        Ok(())
    }

    fn navigate(&self, url: &str) -> Result<()> {
        self.tab.navigate_to(url)?;
        self.tab.wait_until_navigated()?;
        Ok(())
    }

    fn wait_for_selector(&self, selector: &str, timeout: Duration) -> Result<bool> {
        Ok(self
            .tab
            .wait_for_element_with_custom_timeout(selector, timeout)
            .is_ok())
    }

    fn wait_for_text(&self, text: &str, timeout: Duration) -> Result<bool> {
        let xpath = format!("//*[contains(text(), {})]", xpath_literal(text));
        Ok(self
            .tab
            .wait_for_xpath_with_custom_timeout(&xpath, timeout)
            .is_ok())
    }

    fn url(&self) -> Result<String> {
        Ok(self.tab.get_url())
    }

    fn title(&self) -> Result<String> {
        self.tab.get_title()
    }

    fn content(&self) -> Result<String> {
        self.tab.get_content()
    }

    fn screenshot(&self, path: &Path) -> Result<()> {
        let png = self.tab.capture_screenshot(
            CaptureScreenshotFormatOption::Png,
            None,
            None,
            true,
        )?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, &png)
            .with_context(|| format!("failed to write screenshot to {}", path.display()))?;
        Ok(())
    }

    fn release(&self) {
        match self.browser.lock() {
            Ok(mut browser) => {
                if browser.take().is_some() {
                    info!("browser released");
                }
            }
            Err(_) => warn!("browser lock poisoned; leaving process to exit with us"),
        }
    }
}
