use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_API_URL: &str = "https://api.openai.com/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";

/// Every tunable the agent recognizes.
///
/// Durations are plain seconds on the wire so the struct can be filled from a
/// JSON file as easily as from the command line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PilotConfig {
    /// Default timeout the driver applies to element lookups.
    #[serde(with = "secs")]
    pub implicit_wait: Duration,
    /// Bounded wait for post-click result containers and success indicators.
    #[serde(with = "secs")]
    pub explicit_wait: Duration,
    /// Pause between successful steps.
    #[serde(with = "secs")]
    pub action_delay: Duration,
    pub max_steps: usize,
    pub max_ui_elements: usize,
    pub headless: bool,
    pub top_k: usize,
    /// How long a manual-intervention pause lasts when nothing else ends it.
    #[serde(with = "secs")]
    pub manual_timeout: Duration,
    /// Text whose appearance on the page ends a manual-intervention pause.
    pub success_indicator: Option<String>,
    pub screenshots_dir: PathBuf,
    pub dataset_path: Option<PathBuf>,
    pub api_url: String,
    pub model: String,
    pub chrome_path: Option<PathBuf>,
    /// DevTools endpoint of an already running Chrome to attach to.
    pub devtools_url: Option<String>,
}

impl Default for PilotConfig {
    fn default() -> Self {
        Self {
            implicit_wait: Duration::from_secs(2),
            explicit_wait: Duration::from_secs(2),
            action_delay: Duration::from_secs(2),
            max_steps: 10,
            max_ui_elements: 20,
            headless: false,
            top_k: 3,
            manual_timeout: Duration::from_secs(30),
            success_indicator: None,
            screenshots_dir: default_data_dir().join("screenshots"),
            dataset_path: None,
            api_url: DEFAULT_API_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            chrome_path: None,
            devtools_url: None,
        }
    }
}

impl PilotConfig {
    /// Read a JSON config file; fields it leaves out keep their defaults.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("invalid config {}", path.display()))
    }
}

/// Per-user data directory, falling back to `./data` when the platform has none.
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("browser-pilot"))
        .unwrap_or_else(|| PathBuf::from("data"))
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
