//! regret-guard - send interception hook
//!
//! Scores an outgoing message with the regret classifier and decides whether
//! it may go out now, after a short delay, or only once a puzzle is solved.

use clap::{Parser, Subcommand};
use regret_guard::classifier::{ClassificationClient, ClassifyContext, HttpTransport};
use regret_guard::config::{self, expand_path, Config, ConfigStore, StaticConfigStore};
use regret_guard::controller::{
    AnswerOutcome, InterventionController, InterventionEvent, InterventionState,
    InterventionSurface, NullSurface,
};
use regret_guard::interceptor::SendInterceptor;
use regret_guard::logging;
use serde::{Deserialize, Serialize};
use std::io::{self, Read};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

const EXIT_ABANDONED: i32 = 2;

#[derive(Parser)]
#[command(name = "regret-guard")]
#[command(about = "Scores outgoing messages for regret before they are sent")]
#[command(version)]
struct Cli {
    /// Config file (default: <config dir>/regret-guard/config.yaml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<String>,

    /// Override the classifier endpoint
    #[arg(long, global = true, value_name = "URL")]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify a message once and print the result as JSON
    Classify {
        #[arg(value_name = "TEXT")]
        text: String,

        /// URL reported as the place the text was typed
        #[arg(long, default_value = "")]
        url: String,
    },

    /// Check that the classifier backend is up
    Health,

    /// Non-interactive interception (reads JSON from stdin)
    Hook,

    /// Interactive interception on the terminal
    Send {
        #[arg(value_name = "TEXT")]
        text: String,

        #[arg(long, default_value = "")]
        url: String,
    },
}

/// Input received on stdin in hook mode
#[derive(Debug, Deserialize)]
struct HookInput {
    text: String,
    url: Option<String>,
    app: Option<String>,
}

/// Printed only when the send must not go ahead
#[derive(Debug, Serialize)]
struct HookOutput {
    decision: String,
    reason: String,
    regret_score: u8,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    logging::init();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => process::exit(code),
        Err(e) => {
            tracing::error!(error = %e, "regret-guard failed");
            eprintln!("Hook error: {}", e);
            process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<i32, Box<dyn std::error::Error>> {
    let path = cli.config.as_deref().map(expand_path);
    let store = config::open_store(path.as_deref(), cli.endpoint)?;

    match cli.command {
        Commands::Classify { text, url } => {
            let config = store.get_config().await;
            let client = ClassificationClient::http();
            let context = ClassifyContext::from_config(&config, url);
            let (_abort, registration) = futures::future::AbortHandle::new_pair();
            let result = client.classify(&text, &context, &config, registration).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(0)
        }
        Commands::Health => {
            let config = store.get_config().await;
            let status = HttpTransport::new().health(&config).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(0)
        }
        Commands::Hook => run_hook(store).await,
        Commands::Send { text, url } => run_interactive(store, &text, url).await,
    }
}

fn interceptor(
    store: Arc<dyn ConfigStore>,
    surface: Arc<dyn InterventionSurface>,
) -> SendInterceptor {
    SendInterceptor::new(
        store,
        ClassificationClient::http(),
        InterventionController::new(surface),
    )
}

fn sent_flag() -> (Arc<AtomicBool>, regret_guard::ProceedAction) {
    let sent = Arc::new(AtomicBool::new(false));
    let flag = sent.clone();
    (sent, Box::new(move || flag.store(true, Ordering::SeqCst)))
}

async fn run_hook(store: Arc<dyn ConfigStore>) -> Result<i32, Box<dyn std::error::Error>> {
    let mut input_str = String::new();
    io::stdin().read_to_string(&mut input_str)?;
    let input: HookInput = serde_json::from_str(&input_str)?;

    // A hook run is a single cycle, so the app label rides on its snapshot.
    let store: Arc<dyn ConfigStore> = match input.app {
        Some(app) => {
            let mut config: Config = store.get_config().await;
            config.app = app;
            Arc::new(StaticConfigStore::new(config))
        }
        None => store,
    };
    let interceptor = interceptor(store, Arc::new(NullSurface));
    interceptor.set_page_url(input.url.unwrap_or_default());

    let (sent, proceed) = sent_flag();
    if !interceptor.attempt_send(&input.text, proceed).await {
        // Exit 0 without output = allow
        return Ok(0);
    }
    interceptor.handed_off().await;

    let controller = interceptor.controller();
    match controller.state() {
        InterventionState::AutoResolving => controller.settled().await,
        InterventionState::Showing | InterventionState::PuzzleRequired => {
            let result = controller.current_result();
            let _ = controller.cancel();
            let output = HookOutput {
                decision: "block".to_string(),
                reason: result
                    .as_ref()
                    .map(|r| format!("{} {}", r.message, r.reason).trim().to_string())
                    .unwrap_or_default(),
                regret_score: result.map(|r| r.regret_score).unwrap_or_default(),
            };
            println!("{}", serde_json::to_string(&output)?);
            return Ok(0);
        }
        InterventionState::Idle | InterventionState::Resolved => {}
    }

    tracing::debug!(sent = sent.load(Ordering::SeqCst), "Hook finished");
    Ok(0)
}

async fn run_interactive(
    store: Arc<dyn ConfigStore>,
    text: &str,
    url: String,
) -> Result<i32, Box<dyn std::error::Error>> {
    let interceptor = interceptor(store, Arc::new(TerminalSurface));
    interceptor.set_page_url(url);

    let (sent, proceed) = sent_flag();
    if !interceptor.attempt_send(text, proceed).await {
        println!("Sent.");
        return Ok(0);
    }
    interceptor.handed_off().await;

    let controller = interceptor.controller();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while controller.is_active() {
        if controller.state() != InterventionState::PuzzleRequired {
            println!("(type /send to send anyway, /cancel to drop the message)");
        }
        let line = tokio::select! {
            _ = controller.settled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            // stdin closed; leaving the message unsent
            let _ = controller.cancel();
            break;
        };

        match line.trim() {
            "/cancel" => {
                let _ = controller.cancel();
            }
            "/send" => {
                let _ = controller.send_anyway();
            }
            answer => match controller.submit_answer(answer) {
                AnswerOutcome::AwaitingNewPuzzle => println!("Hold on, a new puzzle is coming."),
                AnswerOutcome::NoPuzzle => println!("No puzzle to answer."),
                AnswerOutcome::Accepted | AnswerOutcome::Rejected => {}
            },
        }
    }

    if sent.load(Ordering::SeqCst) {
        println!("Sent.");
        Ok(0)
    } else {
        println!("Message abandoned.");
        Ok(EXIT_ABANDONED)
    }
}

/// Draws the intervention as plain terminal text.
struct TerminalSurface;

impl InterventionSurface for TerminalSurface {
    fn render(&self, event: InterventionEvent) {
        match event {
            InterventionEvent::Shown(result) => {
                println!("Regret score: {}/100", result.regret_score);
                println!("{}", result.message);
                if !result.reason.is_empty() {
                    println!("Why: {}", result.reason);
                }
                if !result.simulation.is_empty() {
                    println!("Tomorrow: {}", result.simulation);
                }
                if !result.should_block {
                    println!("(sending in a moment)");
                }
            }
            InterventionEvent::PuzzleIssued { question } => println!("Puzzle: {}", question),
            InterventionEvent::PuzzleRejected { message }
            | InterventionEvent::SendAnywayRejected { message } => println!("{}", message),
            InterventionEvent::StateChanged { .. } | InterventionEvent::Hidden => {}
        }
    }
}
