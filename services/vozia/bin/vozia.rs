//! Main Entrypoint for the Vozia Terminal Client
//!
//! This binary is responsible for:
//! 1. Parsing arguments and loading configuration from the environment.
//! 2. Loading the optional study document.
//! 3. Opening the audio output device and the Live transport.
//! 4. Configuring the session controller with the tutor profile and tools.
//! 5. Connecting and relaying terminal input until the user quits.

use anyhow::Context;
use clap::Parser;
use gemini_realtime::{Endpoint, EventKind, LiveEvent, LiveTransport, Subscription};
use secrecy::ExposeSecret;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use vozia::cli::Args;
use vozia::config::Config;
use vozia::document::load_document;
use vozia::tools::{
    Display, GraphTool, QuizTool, ToolHandler, ToolRegistry, results_message, run_tool_responder,
};
use vozia_core::{SessionController, SessionStatus};
use vozia_native_utils::{AudioPipeline, PipelineConfig};

const HELP: &str = concat!(
    "Commands: /quiz <answer numbers, '-' to skip>, /reconnect, /quit. ",
    "Anything else is sent to the tutor."
);

/// Listens for the `Ctrl+C` signal.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal. Closing session...");
}

/// Prints the text parts of model turns.
async fn print_content(mut events: Subscription) {
    let mut stdout = tokio::io::stdout();
    while let Some(event) = events.recv().await {
        let text: String = match event {
            LiveEvent::Content(parts) => parts.into_iter().filter_map(|p| p.text).collect(),
            LiveEvent::TurnComplete => "\n".to_string(),
            _ => continue,
        };
        if stdout.write_all(text.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
            break;
        }
    }
}

/// Renders what the tools want to show.
async fn print_displays(mut displays: mpsc::UnboundedReceiver<Display>) {
    while let Some(display) = displays.recv().await {
        match display {
            Display::Quiz(items) => {
                println!("\n--- Quiz ---");
                for (i, item) in items.iter().enumerate() {
                    println!("{}. {}", i + 1, item.question);
                    for (j, answer) in item.answers.iter().enumerate() {
                        println!("   {}) {}", j + 1, answer);
                    }
                }
                println!("Answer with /quiz followed by one number per question.\n");
            }
            Display::Graph(spec) => {
                let pretty = serde_json::to_string_pretty(&spec).unwrap_or_default();
                println!("\n--- Graph (Vega) ---\n{pretty}\n");
            }
        }
    }
}

async fn log_status(controller: Arc<SessionController>) {
    let mut status = controller.status();
    while status.changed().await.is_ok() {
        match status.borrow_and_update().clone() {
            SessionStatus::Recovering { voice } => {
                warn!(%voice, "Voice rejected, reconnecting with fallback voice")
            }
            SessionStatus::Failed { reason } => error!(%reason, "Session failed"),
            other => info!(status = ?other, "Session status changed"),
        }
    }
}

/// Parses `/quiz` answers: one-based numbers, `-` for no answer.
fn parse_selections(input: &str) -> Vec<Option<usize>> {
    input
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<usize>().ok().and_then(|n| n.checked_sub(1)))
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let args = Args::parse();
    let config = Config::from_env().context("Failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .with_writer(std::io::stderr)
        .init();
    info!("Configuration loaded. Preparing session...");

    // --- 2. Load Document ---
    let document = load_document(args.document.as_deref(), args.document_url.as_deref())
        .await
        .context("Failed to load document")?;

    // --- 3. Audio and Transport ---
    let pipeline = Arc::new(AudioPipeline::with_device(PipelineConfig::default()));
    if !args.text_only {
        match pipeline.open_device().await {
            Ok(device) => info!(
                sample_rate = device.sample_rate,
                channels = device.channels,
                "Audio output ready"
            ),
            Err(e) => warn!(error = %e, "Audio output unavailable, continuing without sound"),
        }
    }

    let transport = Arc::new(LiveTransport::new(Endpoint::new(
        config.live_url.clone(),
        config.gemini_api_key.expose_secret(),
    )));

    // --- 4. Session Controller ---
    let controller = Arc::new(SessionController::with_fallback_voice(
        transport,
        pipeline,
        config.fallback_voice.clone(),
    ));

    let (display_tx, display_rx) = mpsc::unbounded_channel();
    let quiz = Arc::new(QuizTool::new(display_tx.clone()));
    let registry = Arc::new(ToolRegistry::new(vec![
        quiz.clone() as Arc<dyn ToolHandler>,
        Arc::new(GraphTool::new(display_tx)),
    ]));

    controller.set_config(args.live_config(&config, registry.declarations()));
    controller.set_profile(args.profile(&config, document));

    tokio::spawn(run_tool_responder(
        registry,
        controller.clone(),
        controller.subscribe(&[EventKind::ToolCall, EventKind::ToolCallCancellation]),
    ));
    tokio::spawn(print_content(
        controller.subscribe(&[EventKind::Content, EventKind::TurnComplete]),
    ));
    tokio::spawn(print_displays(display_rx));
    tokio::spawn(log_status(controller.clone()));

    // --- 5. Connect and Relay Input ---
    info!(model = %args.model(&config), "Connecting to the Live API...");
    controller.connect().await.context("Failed to connect session")?;
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        let line = tokio::select! {
            _ = &mut shutdown => break,
            line = lines.next_line() => line.context("Failed to read stdin")?,
        };
        let Some(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let result = match line.split_once(' ').map_or((line, ""), |(c, rest)| (c, rest)) {
            ("/quit", _) => break,
            ("/reconnect", _) => controller.connect().await,
            ("/quiz", answers) => match quiz.grade(&parse_selections(answers)) {
                Some(results) => controller.send_text(results_message(&results)),
                None => {
                    println!("There is no quiz to answer yet.");
                    Ok(())
                }
            },
            (cmd, _) if cmd.starts_with('/') => {
                println!("{HELP}");
                Ok(())
            }
            _ => controller.send_text(line),
        };
        if let Err(e) = result {
            error!(error = %e, "Command failed");
        }
    }

    controller.disconnect();
    info!("Session closed.");
    Ok(())
}
