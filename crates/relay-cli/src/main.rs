//! `relay`: validate configs, simulate agent calls, inspect backoff schedules.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use relay_core::{BackoffPolicy, BudgetScope, RelayConfig};
use relay_runtime::{ExecutionError, ProviderRegistry, RelayRuntime, RuntimeError};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "relay", version, about = "Resilient LLM agent calls and workflows")]
struct Cli {
    /// Log at debug level (RUST_LOG wins when set)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a config file against the schema and semantic rules
    Validate {
        /// YAML or JSON config
        config: PathBuf,
    },
    /// Run one agent call against a scripted provider
    Simulate {
        /// YAML or JSON config
        config: PathBuf,
        /// Agent to call
        #[arg(long)]
        agent: String,
        /// Tenant the call is made for
        #[arg(long)]
        tenant: Option<String>,
        /// Provider script: inline JSON or a path to a JSON file,
        /// e.g. '{"script": {"gpt-4o": ["fail:rate_limited", "ok"]}}'
        #[arg(long)]
        script: Option<String>,
        /// Payload; parsed as JSON when possible, else sent as a string
        #[arg(long, default_value = "")]
        input: String,
    },
    /// Print the retry delays of a backoff policy
    Backoff {
        #[arg(long, value_enum, default_value_t = Kind::Exponential)]
        kind: Kind,
        /// Base delay, e.g. 500ms
        #[arg(long, default_value = "1s", value_parser = humantime::parse_duration)]
        base: Duration,
        /// Cap for exponential growth
        #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
        max_delay: Duration,
        #[arg(long, default_value_t = 3)]
        retries: u32,
        /// Print the deterministic delays
        #[arg(long)]
        no_jitter: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Kind {
    Exponential,
    Constant,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Validate { config } => validate(&config),
        Commands::Simulate {
            config,
            agent,
            tenant,
            script,
            input,
        } => simulate(&config, &agent, tenant.as_deref(), script.as_deref(), &input).await,
        Commands::Backoff {
            kind,
            base,
            max_delay,
            retries,
            no_jitter,
        } => {
            backoff(kind, base, max_delay, retries, no_jitter);
            Ok(())
        }
    }
}

fn load(path: &Path) -> anyhow::Result<RelayConfig> {
    RelayConfig::from_file(path).with_context(|| format!("Failed to load config '{}'", path.display()))
}

fn validate(path: &Path) -> anyhow::Result<()> {
    let config = load(path)?;
    let agents: Vec<&String> = config.agents.keys().collect();
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "valid": true,
            "agents": agents,
            "enforcement": config.budgets.enforcement,
        }))?
    );
    Ok(())
}

async fn simulate(
    path: &Path,
    agent: &str,
    tenant: Option<&str>,
    script: Option<&str>,
    input: &str,
) -> anyhow::Result<()> {
    let config = load(path)?;
    let provider_config = match script {
        Some(script) => read_script(script)?,
        None => json!({}),
    };
    let provider = ProviderRegistry::with_defaults()
        .create("scripted", &provider_config)
        .context("Invalid provider script")?;

    let payload = serde_json::from_str(input).unwrap_or_else(|_| Value::from(input));
    let runtime = RelayRuntime::new(provider, config);

    let outcome = runtime
        .execute_call(agent, payload, tenant, CancellationToken::new())
        .await;
    runtime.flush().await;

    let mut scopes = vec![BudgetScope::Global, BudgetScope::Agent(agent.to_string())];
    if let Some(tenant) = tenant {
        scopes.push(BudgetScope::Tenant(tenant.to_string()));
    }
    let budgets: Vec<_> = scopes.iter().flat_map(|s| runtime.budget_status(s)).collect();
    let breakers = runtime.breaker_statuses();

    let (report, failed) = match outcome {
        Ok(result) => (json!({ "result": result }), false),
        Err(RuntimeError::Execution(error)) => (error_report(&error), true),
        Err(other) => return Err(other.into()),
    };

    let mut report = report;
    report["breakers"] = serde_json::to_value(&breakers)?;
    report["budgets"] = serde_json::to_value(&budgets)?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if failed {
        bail!("Call to agent '{}' failed", agent);
    }
    Ok(())
}

fn read_script(script: &str) -> anyhow::Result<Value> {
    let text = if script.trim_start().starts_with('{') {
        script.to_string()
    } else {
        std::fs::read_to_string(script).with_context(|| format!("Failed to read script '{}'", script))?
    };
    serde_json::from_str(&text).context("Script is not valid JSON")
}

fn error_report(error: &ExecutionError) -> Value {
    let mut report = json!({
        "error": error.kind(),
        "message": error.to_string(),
    });
    if let Some(result) = error.result() {
        report["result"] = serde_json::to_value(result).unwrap_or(Value::Null);
    }
    if let ExecutionError::CircuitOpen { cooldown_until, .. } = error {
        report["cooldown_until"] = json!(cooldown_until);
    }
    if let ExecutionError::BudgetExceeded { denial, .. } = error {
        report["remaining"] = json!(denial.remaining());
    }
    report
}

fn backoff(kind: Kind, base: Duration, max_delay: Duration, retries: u32, no_jitter: bool) {
    let mut policy = match kind {
        Kind::Exponential => BackoffPolicy::exponential(base, max_delay),
        Kind::Constant => BackoffPolicy::constant(base),
    };
    if no_jitter {
        policy = policy.without_jitter();
    }

    for (retry, delay) in policy.schedule(retries).enumerate() {
        let delay = Duration::from_millis(delay.as_millis() as u64);
        println!("retry {:>2}: {}", retry + 1, humantime::format_duration(delay));
    }
}
