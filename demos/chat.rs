//! Interactive REPL over the context-management core.
//!
//! Usage:
//!   cargo run --example chat
//!   cargo run --example chat -- --context-tokens 32000 --session demo
//!
//! There is no provider wired in; an offline echo driver stands in for the
//! model so the store, overlay, marker parser, and router can be exercised
//! end to end. Try typing text that contains markers, e.g.
//! `hello @@think@@ @@view('tasks,2')@@`.
//!
//! Ctrl-C or "exit" / "quit" to leave.

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use palimpsest::{
    AnyStore, ChatDriver, ChatOptions, ChatOutcome, DirectiveRouter, DriverError, FixedSummarizer,
    MarkerParser, Message, MessageStore, PagedStore, SensoryOverlay, StoreConfig,
};

#[derive(Parser)]
#[command(name = "chat", about = "Drive the context core from a terminal")]
struct Cli {
    /// Session id to save under (and resume from, if it exists)
    #[arg(long, default_value = "demo")]
    session: String,

    /// Sessions directory
    #[arg(long, default_value = ".sessions")]
    root: String,

    /// Context window size in estimated tokens
    #[arg(long, default_value_t = 32_000)]
    context_tokens: usize,

    /// System prompt
    #[arg(long, short = 's', default_value = "You are a terse resident agent.")]
    system: String,
}

/// Stands in for a real model: echoes the prompt tail back, markers and
/// all, so directives round-trip through the parser and router.
struct EchoDriver;

#[async_trait]
impl ChatDriver for EchoDriver {
    async fn chat(
        &self,
        messages: &[Message],
        _options: &ChatOptions,
    ) -> Result<ChatOutcome, DriverError> {
        let last = messages
            .iter()
            .rev()
            .find(|m| m.role == palimpsest::Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        Ok(ChatOutcome {
            text: format!("echo: {last}"),
            ..ChatOutcome::default()
        })
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = StoreConfig::default()
        .with_model("echo-offline")
        .with_context_tokens(cli.context_tokens);
    let store = PagedStore::new(&cli.root, config, Arc::new(FixedSummarizer::default()));
    let mut overlay = SensoryOverlay::new(AnyStore::Paged(store));
    let mut router = DirectiveRouter::new();
    let driver = EchoDriver;

    if overlay.load(&cli.session).await.is_ok() && !overlay.raw_messages().is_empty() {
        println!("(resumed session {})", cli.session);
    } else {
        overlay.add(Message::system(cli.system.clone())).await?;
    }

    let stdin = io::stdin();
    loop {
        print!("> ");
        io::stdout().flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "exit" || line == "quit" {
            break;
        }

        overlay.add(Message::user(line).with_from("user")).await?;
        overlay.poll_sources();
        overlay.load_requested_pages().await?;

        let prompt = overlay.messages();
        let options = ChatOptions {
            model: "echo-offline".into(),
            thinking_budget: Some(router.thinking().value()),
            ..ChatOptions::default()
        };
        let outcome = driver.chat(&prompt, &options).await?;

        let mut parser = MarkerParser::new();
        let mut parsed = parser.feed(&outcome.text);
        let tail = parser.flush();
        parsed.clean.push_str(&tail.clean);
        parsed.events.extend(tail.events);

        router.apply_events(&parsed.events, &mut overlay).await?;
        println!("{}", parsed.clean);

        let mut assistant = Message::assistant(parsed.clean).with_from("agent");
        if let Some(importance) = router.take_pending_importance() {
            assistant = assistant.with_importance(importance);
        }
        overlay.add(assistant).await?;
        router.end_round();

        let stats = overlay.stats();
        println!(
            "  [{} msgs, {}/{} tok, {} pages]",
            stats.total_messages, stats.estimated_tokens, stats.working_budget, stats.page_count
        );
    }

    overlay.save(&cli.session).await?;
    println!("saved session {}", cli.session);
    Ok(())
}
