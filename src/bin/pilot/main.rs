use anyhow::{Result, anyhow};
use browser_pilot::executor::normalize_url;
use browser_pilot::{
    ActionSuggester, ChromeSession, ExampleLibrary, ExampleRetriever, LoopEvent, LoopState,
    NoExamples, OpenAiChat, Orchestrator, PageDriver, PilotConfig, ResumePolicy, face,
};
use clap::Parser;
use dotenvy::dotenv;
use std::io::{BufRead, IsTerminal};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "pilot",
    version,
    about = "Drive a Chrome window through a task described in plain language"
)]
struct Cli {
    /// What to do, e.g. "search for rust tutorials on google".
    instruction: String,

    /// JSON config file; flags below override its values.
    #[arg(long, env = "PILOT_CONFIG")]
    config: Option<PathBuf>,

    /// Page to open before the first step.
    #[arg(long, env = "PILOT_START_URL")]
    start_url: Option<String>,

    #[arg(long, env = "PILOT_HEADLESS")]
    headless: bool,

    #[arg(long, env = "PILOT_MAX_STEPS")]
    max_steps: Option<usize>,

    #[arg(long)]
    max_ui_elements: Option<usize>,

    /// Seconds to pause between successful steps.
    #[arg(long)]
    action_delay: Option<f64>,

    /// Seconds a manual-intervention pause may last.
    #[arg(long)]
    manual_timeout: Option<f64>,

    /// Text whose appearance ends a manual-intervention pause.
    #[arg(long)]
    success_indicator: Option<String>,

    /// JSON file of past `{query, steps}` traces.
    #[arg(long, env = "PILOT_DATASET")]
    dataset: Option<PathBuf>,

    #[arg(long)]
    top_k: Option<usize>,

    #[arg(long)]
    screenshots_dir: Option<PathBuf>,

    #[arg(long, env = "OPENAI_MODEL")]
    model: Option<String>,

    #[arg(long, env = "OPENAI_API_URL")]
    api_url: Option<String>,

    #[arg(long, env = "CHROME_PATH")]
    chrome_path: Option<PathBuf>,

    /// DevTools websocket URL of a Chrome to attach to instead of launching one.
    #[arg(long, env = "PILOT_DEVTOOLS_URL")]
    devtools_url: Option<String>,

    /// Serve the operator console on this loopback port.
    #[arg(long, env = "PILOT_CONSOLE_PORT")]
    console_port: Option<u16>,

    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn into_config(self) -> Result<(PilotConfig, Option<String>, Option<u16>, String)> {
        let mut config = match &self.config {
            Some(path) => PilotConfig::from_file(path)?,
            None => PilotConfig::default(),
        };

        config.headless |= self.headless;
        if let Some(v) = self.max_steps {
            config.max_steps = v;
        }
        if let Some(v) = self.max_ui_elements {
            config.max_ui_elements = v;
        }
        if let Some(v) = self.action_delay {
            config.action_delay = seconds(v)?;
        }
        if let Some(v) = self.manual_timeout {
            config.manual_timeout = seconds(v)?;
        }
        if let Some(v) = self.top_k {
            config.top_k = v;
        }
        config.success_indicator = self.success_indicator.or(config.success_indicator);
        config.dataset_path = self.dataset.or(config.dataset_path);
        config.chrome_path = self.chrome_path.or(config.chrome_path);
        config.devtools_url = self.devtools_url.or(config.devtools_url);
        if let Some(v) = self.screenshots_dir {
            config.screenshots_dir = v;
        }
        if let Some(v) = self.model {
            config.model = v;
        }
        if let Some(v) = self.api_url {
            config.api_url = v;
        }

        Ok((config, self.start_url, self.console_port, self.instruction))
    }
}

fn seconds(value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value).map_err(|e| anyhow!("invalid duration {}: {}", value, e))
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Forward each line typed on stdin as an operator acknowledgment.
fn spawn_stdin_resume(tx: mpsc::Sender<()>) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            if line.is_err() || tx.blocking_send(()).is_err() {
                break;
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let (config, start_url, console_port, instruction) = cli.into_config()?;
    let chat = OpenAiChat::from_env(&config)?;

    let retriever: Arc<dyn ExampleRetriever> = match &config.dataset_path {
        Some(path) => Arc::new(ExampleLibrary::load(path, config.top_k)?),
        None => Arc::new(NoExamples),
    };

    let (events_tx, _) = broadcast::channel::<LoopEvent>(64);
    let (resume_tx, resume_rx) = mpsc::channel::<()>(1);
    let interactive = std::io::stdin().is_terminal();

    if let Some(port) = console_port {
        face::start(port, resume_tx.clone(), events_tx.clone()).await?;
    }

    let resume = if config.success_indicator.is_some() {
        ResumePolicy::from_config(&config)
    } else if interactive || console_port.is_some() {
        if interactive {
            spawn_stdin_resume(resume_tx.clone());
            info!("press Enter to resume after a manual-intervention pause");
        }
        ResumePolicy::Operator {
            rx: resume_rx,
            timeout: Some(config.manual_timeout),
        }
    } else {
        ResumePolicy::from_config(&config)
    };
    drop(resume_tx);

    info!("launching Chrome...");
    let launch_config = config.clone();
    let session = tokio::task::spawn_blocking(move || ChromeSession::launch(&launch_config))
        .await
        .map_err(|e| anyhow!("browser launch panicked: {}", e))??;
    let page: Arc<dyn PageDriver> = Arc::new(session);

    let orchestrator = Orchestrator::new(
        page.clone(),
        ActionSuggester::new(Arc::new(chat)),
        &config,
    )
    .with_retriever(retriever)
    .with_resume_policy(resume)
    .with_events(events_tx);

    if let Some(url) = start_url {
        let url = normalize_url(&url);
        let opener = page.clone();
        let opened = tokio::task::spawn_blocking(move || opener.navigate(&url)).await?;
        if let Err(e) = opened {
            warn!("could not open start page: {:#}", e);
        }
    }

    let report = orchestrator.run(&instruction).await;

    for line in &report.log {
        println!("{}", line);
    }
    match &report.state {
        LoopState::Finished => {
            println!("finished after {} actions", report.history.len());
            Ok(ExitCode::SUCCESS)
        }
        LoopState::Aborted(reason) => {
            println!("aborted: {}", reason.describe());
            Ok(ExitCode::FAILURE)
        }
        other => {
            println!("run ended in unexpected state {}", other);
            Ok(ExitCode::FAILURE)
        }
    }
}
