//! Interactive streaming chat over any configured provider.
//!
//! Usage:
//!   OPENAI_API_KEY=sk-... cargo run --example chat -- --provider openai --model gpt-4o
//!   ANTHROPIC_API_KEY=sk-... cargo run --example chat -- --provider anthropic --model claude-sonnet-4-20250514
//!   cargo run --example chat -- --provider ollama --model llama3.2
//!   cargo run --example chat -- --settings settings.json --vault ~/notes
//!
//! Type "exit" / "quit" to leave, "/models" to list models.

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use llm_orchestrator::{
    ChatMessage, FsFileReader, LlmSettings, Orchestrator, ProviderSettings, StreamOptions,
    ToolEvent, ToolHandler, ToolRegistry,
};
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "chat", about = "Chat through the LLM orchestrator")]
struct Cli {
    /// Provider id, e.g. "openai", "anthropic", "ollama", "openrouter"
    #[arg(long, default_value = "ollama")]
    provider: String,

    /// Model to use
    #[arg(long, default_value = "llama3.2")]
    model: String,

    /// System prompt
    #[arg(long, short = 's')]
    system: Option<String>,

    /// JSON settings file. API keys missing from it are read from the environment.
    #[arg(long)]
    settings: Option<String>,

    /// API base URL for the chosen provider
    #[arg(long)]
    base_url: Option<String>,

    /// Vault directory the `read_note` tool may read from
    #[arg(long)]
    vault: Option<String>,
}

struct ReadNote {
    reader: FsFileReader,
}

#[async_trait]
impl ToolHandler for ReadNote {
    async fn call(&self, input: &Value) -> Result<Value, String> {
        use llm_orchestrator::FileReader;
        let path = input["path"]
            .as_str()
            .ok_or_else(|| "missing 'path'".to_string())?;
        self.reader.read(path).await.map(Value::String)
    }
}

struct CurrentTime;

#[async_trait]
impl ToolHandler for CurrentTime {
    async fn call(&self, _input: &Value) -> Result<Value, String> {
        Ok(Value::String(chrono::Utc::now().to_rfc3339()))
    }
}

fn build_tools(vault: &str) -> ToolRegistry {
    ToolRegistry::new()
        .add(
            "read_note",
            json!({
                "name": "read_note",
                "description": "Read a note from the vault by its vault-relative path",
                "input_schema": {
                    "type": "object",
                    "properties": { "path": { "type": "string" } },
                    "required": ["path"]
                }
            }),
            ReadNote {
                reader: FsFileReader::new(vault),
            },
        )
        .add(
            "current_time",
            json!({
                "name": "current_time",
                "description": "Current UTC time",
                "input_schema": { "type": "object", "properties": {} }
            }),
            CurrentTime,
        )
}

async fn load_settings(cli: &Cli) -> LlmSettings {
    let mut settings = match &cli.settings {
        Some(path) => LlmSettings::from_json_file(path).await.unwrap_or_else(|e| {
            eprintln!("error: {e}");
            std::process::exit(1);
        }),
        None => LlmSettings::default(),
    };
    if let Some(url) = &cli.base_url {
        let entry = settings
            .providers
            .entry(cli.provider.clone())
            .or_insert_with(|| ProviderSettings::local(url.clone()));
        entry.base_url = Some(url.clone());
    }
    if cli.provider == "ollama" || cli.provider == "lmstudio" {
        settings
            .providers
            .entry(cli.provider.clone())
            .or_insert_with(|| ProviderSettings {
                enabled: true,
                api_key: None,
                base_url: None,
            });
    }
    settings
        .with_env_keys()
        .with_default(cli.provider.clone(), cli.model.clone())
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
    let settings = load_settings(&cli).await;
    let vault = cli.vault.clone().unwrap_or_else(|| ".".into());
    let tools = build_tools(&vault);
    let schemas = tools.schemas();

    let orchestrator = Orchestrator::new(settings)
        .with_tool_executor(Arc::new(tools))
        .with_file_reader(Arc::new(FsFileReader::new(&vault)));

    if !orchestrator.available_providers().contains(&cli.provider) {
        eprintln!(
            "error: provider '{}' is not configured. Available: {:?}",
            cli.provider,
            orchestrator.available_providers()
        );
        std::process::exit(1);
    }

    eprintln!("llm-orchestrator chat");
    eprintln!("provider: {}", cli.provider);
    eprintln!("model: {}", cli.model);
    if let Some(ref sys) = cli.system {
        eprintln!("system: {sys}");
    }
    eprintln!("---");

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    let mut history: Vec<ChatMessage> = Vec::new();

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
        if trimmed == "/models" {
            for model in orchestrator.list_models().await {
                eprintln!("  {}/{}", model.provider, model.id);
            }
            continue;
        }

        history.push(ChatMessage::user(trimmed));

        let (events_tx, mut events_rx) = tokio::sync::mpsc::channel::<ToolEvent>(64);
        let printer = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                match event {
                    ToolEvent::Started { name, .. } => {
                        eprintln!("\n\x1b[33m  [tool: {name}]\x1b[0m");
                    }
                    ToolEvent::Finished {
                        name,
                        success,
                        execution_time_ms,
                        ..
                    } => {
                        let tag = if success { "ok" } else { "error" };
                        eprintln!("\x1b[33m  [{tag}: {name} in {execution_time_ms}ms]\x1b[0m");
                    }
                }
            }
        });

        let mut options = StreamOptions::new()
            .with_provider(cli.provider.clone(), cli.model.clone())
            .with_tools(schemas.clone())
            .with_tool_events(events_tx);
        options.system_prompt = cli.system.clone();

        let mut stream = match orchestrator.generate_response_stream(history.clone(), options) {
            Ok(stream) => stream,
            Err(e) => {
                eprintln!("\x1b[1;31merror:\x1b[0m {e}");
                history.pop();
                continue;
            }
        };

        eprint!("\x1b[1;32massistant>\x1b[0m ");
        let mut answer = String::new();
        while let Some(item) = stream.recv().await {
            match item {
                Ok(item) if item.complete => {
                    answer = item.content;
                    if !item.tool_calls.is_empty() {
                        eprintln!("\x1b[2m  ({} tool calls)\x1b[0m", item.tool_calls.len());
                    }
                }
                Ok(item) => {
                    print!("{}", item.chunk);
                    io::stdout().flush().ok();
                }
                Err(e) => {
                    eprintln!("\n\x1b[1;31merror:\x1b[0m {e}");
                }
            }
        }
        println!();
        printer.await.ok();

        if answer.is_empty() {
            history.pop();
        } else {
            history.push(ChatMessage::assistant(answer));
        }
    }

    eprintln!("bye.");
}
