//! Interactive relay: chat with a persona through the full pipeline.
//!
//! Usage:
//!   cargo run --example relay -- --provider ollama --model llama3.2
//!   cargo run --example relay -- --provider http --base-url http://gpu-box:8080
//!   cargo run --example relay -- --config pipeline.toml --persona "You are Mira, a baker."
//!
//! Commands: /ai on, /ai off, /status <task>, exit.

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use clap::Parser;
use persona_pipeline::{
    ConversationId, ConversationStore, HttpBackend, MemoryStore, ModelBackend, OllamaBackend,
    PipelineConfig, PipelineEvent, Scheduler, TaskId,
};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "relay", about = "Chat with a persona through the generation pipeline")]
struct Cli {
    /// Provider: "ollama" or "http"
    #[arg(long, default_value = "ollama")]
    provider: String,

    /// Model name (ollama only)
    #[arg(long, default_value = "llama3.2")]
    model: String,

    /// Backend base URL (defaults depend on provider)
    #[arg(long)]
    base_url: Option<String>,

    /// Pipeline config (TOML). Defaults apply when omitted.
    #[arg(long, short = 'c')]
    config: Option<String>,

    /// Persona system prompt
    #[arg(long, short = 'p', default_value = "You are a friendly companion. Stay in character.")]
    persona: String,
}

fn build_backend(cli: &Cli) -> Box<dyn ModelBackend> {
    match cli.provider.as_str() {
        "ollama" => {
            let mut b = OllamaBackend::new(&cli.model);
            if let Some(ref url) = cli.base_url {
                b = b.with_base_url(url);
            }
            Box::new(b)
        }
        "http" => {
            let Some(ref url) = cli.base_url else {
                eprintln!("error: --base-url is required for the http provider");
                std::process::exit(1);
            };
            let mut b = HttpBackend::new(url);
            if let Ok(key) = std::env::var("MODEL_API_KEY") {
                b = b.with_api_key(key);
            }
            Box::new(b)
        }
        other => {
            eprintln!("error: unknown provider '{other}'. Use 'ollama' or 'http'.");
            std::process::exit(1);
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = match cli.config {
        Some(ref path) => PipelineConfig::load(path).unwrap_or_else(|e| {
            eprintln!("error: {e}");
            std::process::exit(1);
        }),
        None => PipelineConfig::default(),
    };

    let store = Arc::new(MemoryStore::new());
    let conv = ConversationId::new("relay");
    store.create_conversation(conv.clone(), &cli.persona).await;

    let (tx, mut rx) = tokio::sync::mpsc::channel::<PipelineEvent>(64);
    let dyn_store: Arc<dyn ConversationStore> = store.clone();
    let scheduler = Arc::new(
        Scheduler::new(dyn_store, config.gateway(build_backend(&cli)), &config).with_events(tx),
    );

    let shutdown = CancellationToken::new();
    let workers = tokio::spawn(Arc::clone(&scheduler).run(shutdown.clone()));

    // Print replies as their tasks settle
    let printer_store = store.clone();
    let printer_conv = conv.clone();
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                PipelineEvent::Retrying { attempt, delay, reason, .. } => {
                    eprintln!("\x1b[33m  [attempt {attempt} failed: {reason}; retrying in {delay:?}]\x1b[0m");
                }
                PipelineEvent::Succeeded { task, .. } | PipelineEvent::Failed { task, .. } => {
                    let turns = printer_store.turns(&printer_conv).await;
                    if let Some(turn) = turns.iter().find(|t| t.task_id.as_ref() == Some(&task)) {
                        eprint!("\x1b[1;32mpersona>\x1b[0m ");
                        println!("{}", turn.text);
                    }
                }
                PipelineEvent::Discarded { task, reason } => {
                    eprintln!("\x1b[2m  [{task} discarded: {reason}]\x1b[0m");
                }
                _ => {}
            }
        }
    });

    eprintln!("persona-pipeline relay");
    eprintln!("provider: {}", cli.provider);
    eprintln!("persona: {}", cli.persona);
    eprintln!("---");

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        eprint!("\x1b[1;36myou>\x1b[0m ");
        io::stderr().flush().ok();

        let line = match lines.next() {
            Some(Ok(line)) => line,
            _ => break,
        };

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if matches!(trimmed, "exit" | "quit" | "/q") {
            break;
        }
        if let Some(flag) = trimmed.strip_prefix("/ai ") {
            let enabled = flag.trim() == "on";
            if let Err(e) = store.set_ai_enabled(&conv, enabled).await {
                eprintln!("\x1b[1;31merror:\x1b[0m {e}");
            }
            continue;
        }
        if let Some(id) = trimmed.strip_prefix("/status ") {
            match scheduler.task_state(&TaskId(id.trim().to_string())).await {
                Ok(state) => eprintln!("\x1b[2m  [{state:?}]\x1b[0m"),
                Err(e) => eprintln!("\x1b[1;31merror:\x1b[0m {e}"),
            }
            continue;
        }

        match scheduler.enqueue_generation(&conv, trimmed).await {
            Ok(id) => eprintln!("\x1b[2m  [queued {id}]\x1b[0m"),
            Err(e) => eprintln!("\x1b[1;31merror:\x1b[0m {e}"),
        }
    }

    shutdown.cancel();
    workers.await.ok();
    drop(scheduler);
    printer.await.ok();
    eprintln!("bye.");
}
