//! chatfsm - console demo bot
//!
//! Reads `<user id> <text>` lines from stdin, runs them through a small
//! greeting conversation and prints the bot's replies.

use chatfsm_core::{
    action, always, transitor, Api, HookError, InboundMessage, Machine, MachineBuilder,
    MemoryStore, MessageKind, Recipient, INITIAL_STATE,
};
use chatfsm_dispatch::{Config, DispatchError, Dispatcher, Supervisor};
use clap::Parser;
use serde_json::{json, Value};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "chatfsm")]
#[command(about = "Console demo of a per-user conversation state machine")]
#[command(version)]
struct Args {
    /// YAML config file
    #[arg(short, long, env = "CHATFSM_CONFIG")]
    config: Option<PathBuf>,

    /// Dispatcher capacity, also the number of workers
    #[arg(long)]
    capacity: Option<usize>,
}

/// Prints outbound messages instead of sending them.
struct ConsoleApi {
    bot: Recipient,
}

impl Api for ConsoleApi {
    fn me(&self) -> Result<Recipient, HookError> {
        Ok(self.bot.clone())
    }

    fn send_message(&self, to: &Recipient, text: &str) -> Result<(), HookError> {
        println!("[{} -> {}] {}", self.bot.name, to.name, text);
        Ok(())
    }

    fn forward_message(
        &self,
        to: &Recipient,
        from: &Recipient,
        message_id: i64,
    ) -> Result<(), HookError> {
        println!(
            "[{} -> {}] (forwarded message {} from {})",
            self.bot.name, to.name, message_id, from.name
        );
        Ok(())
    }
}

fn field<'a>(data: &'a Value, name: &str) -> &'a str {
    data.get(name).and_then(Value::as_str).unwrap_or_default()
}

fn greeting_machine() -> Result<Machine, chatfsm_core::CoreError> {
    let mut builder = MachineBuilder::new();

    builder
        .state_mut(INITIAL_STATE)
        .ok_or(chatfsm_core::CoreError::StateNotFound {
            state: INITIAL_STATE.to_string(),
        })?
        .on_command("/start", always("ask_name"))
        .on_fallback(always("hint"));

    builder.add_state(
        "hint",
        Some(action(|_, ctx, api| {
            api.send_message(ctx.user(), "Send /start to begin.")?;
            ctx.transit(INITIAL_STATE);
            Ok(())
        })),
        None,
    )?;

    builder
        .add_state(
            "ask_name",
            Some(action(|_, ctx, api| {
                ctx.set_data(json!({}));
                api.send_message(ctx.user(), "What is your name?")
            })),
            Some(action(|msg, ctx, _| {
                ctx.data_mut()["name"] = json!(msg.text_or_empty().trim());
                Ok(())
            })),
        )?
        .on_kind(MessageKind::Text, always("ask_title"))
        .on_fallback(always("ask_name"));

    builder
        .add_state(
            "ask_title",
            Some(action(|_, ctx, api| {
                let question = format!(
                    "How should I call you, {}? (Mr/Ms)",
                    field(ctx.data(), "name")
                );
                api.send_message(ctx.user(), &question)
            })),
            Some(action(|msg, ctx, _| {
                ctx.data_mut()["title"] = json!(msg.text_or_empty().trim());
                Ok(())
            })),
        )?
        .on_kind(
            MessageKind::Text,
            transitor(|msg, _| match msg.text_or_empty().trim() {
                "Mr" | "Ms" => Some("greet".to_string()),
                _ => None,
            }),
        )
        .on_fallback(always("ask_title"));

    builder.add_state(
        "greet",
        Some(action(|_, ctx, api| {
            let data = ctx.data();
            let text = format!(
                "Nice to meet you, {} {}!",
                field(data, "title"),
                field(data, "name")
            );
            api.send_message(ctx.user(), &text)?;
            ctx.transit(INITIAL_STATE);
            Ok(())
        })),
        None,
    )?;

    builder.build()
}

/// Parses `<user id> <text>`.
fn parse_line(id: i64, line: &str) -> Option<InboundMessage> {
    let (user, text) = line.trim().split_once(char::is_whitespace)?;
    let user: i64 = user.parse().ok()?;
    let sender = Recipient::user(user, format!("user{}", user));
    Some(InboundMessage::text(id, sender, text.trim()))
}

/// Feeds `<user id> <text>` lines into the dispatcher, then closes it once
/// the queue drains. Stops early if the dispatcher is closed underneath.
fn feed_lines<R: BufRead>(reader: R, dispatcher: &Dispatcher) -> Result<(), DispatchError> {
    let mut next_id = 1;
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                tracing::error!("Failed to read stdin: {}", e);
                break;
            }
        };
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }

        match parse_line(next_id, &line) {
            Some(msg) => match dispatcher.feed_one(msg) {
                Ok(_) => next_id += 1,
                Err(DispatchError::Closed) => return Ok(()),
                Err(e) => return Err(e),
            },
            None => tracing::warn!("Ignoring malformed line: {}", line),
        }
    }

    while dispatcher.pending_len() > 0 && !dispatcher.is_closed() {
        std::thread::sleep(Duration::from_millis(20));
    }
    dispatcher.close();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    // File first, then environment, then flags
    let mut config = match &args.config {
        Some(path) => {
            tracing::info!("Loading config from {}", path.display());
            Config::from_file(path)?
        }
        None => Config::default(),
    };
    config.apply_overrides(|name| std::env::var(name).ok());
    if let Some(capacity) = args.capacity {
        config.dispatch.capacity = capacity;
    }
    if let Err(e) = config.validate() {
        tracing::error!("Invalid configuration: {}", e);
        return Err(e.into());
    }

    tracing::info!("Starting chatfsm");
    tracing::info!("  Capacity: {}", config.dispatch.capacity);
    tracing::info!("  Key by: {:?}", config.dispatch.key_by);
    tracing::info!("  Backpressure: {:?}", config.dispatch.backpressure);
    tracing::info!("  Failure policy: {:?}", config.workers.failure_policy);

    let machine = Arc::new(greeting_machine()?);
    tracing::info!("  States: {:?}", machine.state_ids());

    let api = Arc::new(ConsoleApi {
        bot: Recipient::user(0, "bot"),
    });
    let supervisor = Arc::new(Supervisor::from_config(
        &config,
        machine,
        Arc::new(MemoryStore::default()),
        api,
    ));

    // Spawn shutdown signal handler
    let shutdown_supervisor = supervisor.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping workers...");
        shutdown_supervisor.shutdown();
    });

    // Plain thread, not spawn_blocking: a read blocked on stdin must not hold
    // up runtime shutdown. It is never joined.
    let dispatcher = supervisor.dispatcher().clone();
    std::thread::Builder::new()
        .name("stdin-reader".to_string())
        .spawn(move || {
            if let Err(e) = feed_lines(std::io::stdin().lock(), &dispatcher) {
                tracing::error!("Input reader failed: {}", e);
                dispatcher.close();
            }
        })?;

    // Run workers (blocks until the dispatcher closes)
    if let Err(e) = supervisor.start().await {
        tracing::error!("Worker pool halted: {}", e);
        supervisor.shutdown();
        return Err(e.into());
    }

    let stats = supervisor.stats().snapshot();
    tracing::info!(
        "Stopped ({} fed, {} committed, {} rolled back)",
        stats.fed,
        stats.committed,
        stats.rolled_back
    );
    Ok(())
}
