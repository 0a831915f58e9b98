use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use modelgate::catalog;
use modelgate::{
    CallContext, ChatOptions, EventKind, Message, Provider, ProvidersConfig, ThinkingDisplay,
    ThinkingTracker,
};
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Parser)]
#[command(name = "modelgate", version, about = "Talk to LLM providers through one interface")]
struct Cli {
    /// JSON provider configuration. Defaults to the environment.
    #[arg(long, global = true)]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one prompt and print the full reply
    Chat(TurnArgs),

    /// Send one prompt and print the reply as it arrives
    Stream(TurnArgs),

    /// List configured providers and their models
    Models {
        /// Only this provider
        #[arg(short, long)]
        provider: Option<String>,
    },
}

#[derive(Args)]
struct TurnArgs {
    /// Provider name (anthropic, openai, gemini, bedrock, meta, ollama)
    #[arg(short, long)]
    provider: Option<String>,

    /// Model id. Defaults to the provider's first offered model.
    #[arg(short, long)]
    model: Option<String>,

    #[arg(long)]
    system: Option<String>,

    #[arg(long, default_value = "1024")]
    max_tokens: u32,

    #[arg(long, default_value = "0.7")]
    temperature: f32,

    /// Give up after this many seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Print reasoning blocks to stderr
    #[arg(long)]
    show_thinking: bool,

    /// Prompt text; read from stdin when omitted or "-"
    prompt: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "modelgate=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            ProvidersConfig::from_json(&json)?
        }
        None => ProvidersConfig::from_env(),
    };
    let registry = config.into_registry()?;
    if registry.count() == 0 {
        bail!("no providers configured: set e.g. ANTHROPIC_API_KEY or pass --config");
    }

    let result = match cli.command {
        Commands::Models { provider } => {
            let names = match provider {
                Some(name) => vec![name],
                None => registry.list(),
            };
            for name in names {
                print_models(registry.get(&name)?.as_ref());
            }
            Ok(())
        }
        Commands::Chat(args) => {
            let provider = pick(&registry, args.provider.as_deref())?;
            run_chat(provider, args).await
        }
        Commands::Stream(args) => {
            let provider = pick(&registry, args.provider.as_deref())?;
            run_stream(provider, args).await
        }
    };

    if let Err(e) = registry.close() {
        warn!(error = %e, "closing providers");
    }
    result
}

fn pick(
    registry: &modelgate::ProviderRegistry,
    name: Option<&str>,
) -> anyhow::Result<Arc<dyn Provider>> {
    let name = match name {
        Some(name) => name.to_string(),
        None => registry
            .list()
            .into_iter()
            .next()
            .context("no providers configured")?,
    };
    Ok(registry.get(&name)?)
}

fn print_models(provider: &dyn Provider) {
    let offered = catalog::offered_models(provider.name());
    println!("{}:", provider.name());
    for model in provider.models() {
        let mark = if offered.contains(&model.as_str()) { "*" } else { " " };
        println!("  {mark} {model}");
    }
}

/// Call context that is cancelled by Ctrl-C.
fn interruptible(timeout: Option<u64>) -> CallContext {
    let mut ctx = CallContext::new();
    if let Some(secs) = timeout {
        ctx = ctx.with_timeout(Duration::from_secs(secs));
    }
    let cancel = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            debug!("interrupted");
            cancel.cancel();
        }
    });
    ctx
}

fn read_prompt(prompt: Option<String>) -> anyhow::Result<String> {
    match prompt {
        Some(p) if p != "-" => Ok(p),
        _ => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            let buf = buf.trim().to_string();
            if buf.is_empty() {
                bail!("empty prompt");
            }
            Ok(buf)
        }
    }
}

fn options(provider: &dyn Provider, args: &TurnArgs) -> ChatOptions {
    let model = match &args.model {
        Some(model) => model.clone(),
        // Ollama falls back to its configured model when none is named.
        None if provider.name() == "ollama" => String::new(),
        None => catalog::default_model(provider.name())
            .unwrap_or_default()
            .to_string(),
    };
    let mut opts = ChatOptions::new()
        .with_model(model)
        .with_max_tokens(args.max_tokens)
        .with_temperature(args.temperature);
    if let Some(system) = &args.system {
        opts = opts.with_system_prompt(system.clone());
    }
    opts
}

async fn run_chat(provider: Arc<dyn Provider>, args: TurnArgs) -> anyhow::Result<()> {
    let opts = options(provider.as_ref(), &args);
    let ctx = interruptible(args.timeout);
    let messages = [Message::user(read_prompt(args.prompt)?)];

    let response = provider.chat(&ctx, &messages, opts).await?;
    if args.show_thinking {
        if let Some(reasoning) = &response.reasoning {
            eprintln!("[thinking]\n{reasoning}\n");
        }
    }
    println!("{}", response.content);
    eprintln!(
        "[{} {}] {} prompt + {} completion tokens{}",
        response.provider,
        response.model,
        response.usage.prompt_tokens,
        response.usage.completion_tokens,
        response
            .finish_reason
            .as_deref()
            .map(|r| format!(", finish: {r}"))
            .unwrap_or_default()
    );
    Ok(())
}

async fn run_stream(provider: Arc<dyn Provider>, args: TurnArgs) -> anyhow::Result<()> {
    let opts = options(provider.as_ref(), &args);
    let ctx = interruptible(args.timeout);
    let messages = [Message::user(read_prompt(args.prompt)?)];

    let mut events = provider.stream(&ctx, &messages, opts).await?;
    let mut tracker = ThinkingTracker::new();
    let display = ThinkingDisplay::default();
    let mut stdout = std::io::stdout();

    while let Some(event) = events.next().await {
        if let Some(block) = tracker.parse_event(&event) {
            if args.show_thinking {
                eprintln!("{}", display.format_block(block));
            }
            continue;
        }
        match event.kind {
            EventKind::ContentDelta { text } => {
                write!(stdout, "{text}")?;
                stdout.flush()?;
            }
            EventKind::Usage { usage } => {
                debug!(prompt = usage.prompt_tokens, completion = usage.completion_tokens, "usage");
            }
            EventKind::MessageStop { finish_reason } => {
                debug!(?finish_reason, "message stop");
            }
            EventKind::ContentEnd { .. } => {
                println!();
                return Ok(());
            }
            EventKind::Error { kind, message } => {
                println!();
                bail!("{kind}: {message}");
            }
            _ => {}
        }
    }

    println!();
    if ctx.is_cancelled() {
        bail!("cancelled");
    }
    Ok(())
}
