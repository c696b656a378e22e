use std::net::IpAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use gatekeeper::config::{GatekeeperConfig, LoggingConfig, StoreBackend};
use gatekeeper::interceptor::RequestGuard;
use gatekeeper::ratelimit::{
    CallerContext, CounterStore, MemoryStore, Outcome, PolicySet, RateLimiter,
};

/// Operator tool for Gatekeeper rate limit policies.
#[derive(Debug, Parser)]
#[command(name = "gatekeeper", version, about)]
struct Cli {
    /// Service configuration file (YAML)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Policy file, overriding rate_limiting.policies_path
    #[arg(short, long, global = true)]
    policies: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load and validate the policy file, then print a summary
    Validate,
    /// Decide one request under a single policy
    Evaluate {
        /// Policy name
        policy: String,
        #[command(flatten)]
        caller: CallerArgs,
        /// Record a finished request with this outcome instead of a pre-flight check
        #[arg(long, value_enum, conflicts_with = "check_only")]
        outcome: Option<OutcomeArg>,
        /// Read the current count without consuming quota
        #[arg(long)]
        check_only: bool,
    },
    /// Run every policy assigned to a route, as the request interceptor would
    Admit {
        /// Route name as listed in the policy file
        route: String,
        #[command(flatten)]
        caller: CallerArgs,
    },
}

#[derive(Debug, Args)]
struct CallerArgs {
    /// Authenticated user id
    #[arg(long)]
    user: Option<String>,
    /// Caller network address
    #[arg(long)]
    ip: Option<IpAddr>,
    /// Target resource id
    #[arg(long)]
    resource: Option<String>,
}

impl CallerArgs {
    fn context(&self) -> CallerContext {
        CallerContext {
            user_id: self.user.clone(),
            remote_addr: self.ip,
            resource_id: self.resource.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutcomeArg {
    Success,
    Failure,
}

impl From<OutcomeArg> for Outcome {
    fn from(arg: OutcomeArg) -> Self {
        match arg {
            OutcomeArg::Success => Outcome::Success,
            OutcomeArg::Failure => Outcome::Failure,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = GatekeeperConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    init_tracing(&config.logging);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting Gatekeeper");

    let policies_path = cli
        .policies
        .clone()
        .or_else(|| config.rate_limiting.policies_path.clone())
        .context("No policy file given; pass --policies or set rate_limiting.policies_path")?;

    // Configuration errors stop here, before anything is decided.
    let policies = PolicySet::from_file(&policies_path)
        .with_context(|| format!("Invalid policy file {}", policies_path))?;
    info!(policies = policies.len(), path = %policies_path, "Policies loaded");

    match cli.command {
        Command::Validate => {
            print_summary(&policies);
            Ok(())
        }
        Command::Evaluate {
            policy,
            caller,
            outcome,
            check_only,
        } => {
            let limiter = build_limiter(&config, policies).await?;
            let caller = caller.context();
            let decision = if check_only {
                limiter.check_only(&policy, &caller).await?
            } else if let Some(outcome) = outcome {
                limiter.record(&policy, &caller, outcome.into()).await?
            } else {
                limiter.evaluate(&policy, &caller).await?
            };
            println!("{}", serde_json::to_string_pretty(&decision)?);
            Ok(())
        }
        Command::Admit { route, caller } => {
            let guard = RequestGuard::new(build_limiter(&config, policies).await?);
            let verdict = guard.admit(&route, &caller.context()).await?;
            println!("{}", serde_json::to_string_pretty(&verdict)?);
            for (name, value) in verdict.headers() {
                println!("{}: {}", name, value);
            }
            Ok(())
        }
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if logging.json {
        builder.json().init();
    } else {
        builder.with_thread_ids(true).init();
    }
}

async fn build_limiter(config: &GatekeeperConfig, policies: PolicySet) -> anyhow::Result<RateLimiter> {
    let store = connect_store(config).await?;
    Ok(RateLimiter::new(store, policies)
        .with_key_prefix(config.store.key_prefix.clone())
        .with_store_timeout(config.store.timeout()))
}

async fn connect_store(config: &GatekeeperConfig) -> anyhow::Result<Arc<dyn CounterStore>> {
    match config.store.backend {
        StoreBackend::Memory => {
            info!("Using in-process counter store");
            Ok(Arc::new(MemoryStore::new()))
        }
        #[cfg(feature = "redis-store")]
        StoreBackend::Redis => {
            use gatekeeper::ratelimit::{RedisStore, RedisStoreConfig};

            let store = RedisStore::connect_with_config(RedisStoreConfig {
                url: config.store.url.clone(),
                connect_timeout: config.store.connect_timeout(),
            })
            .await
            .context("Failed to connect to Redis")?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis-store"))]
        StoreBackend::Redis => anyhow::bail!("Redis backend requested but the redis-store feature is disabled"),
    }
}

fn print_summary(policies: &PolicySet) {
    let mut all: Vec<_> = policies.policies().collect();
    all.sort_by(|a, b| a.name().cmp(b.name()));

    for policy in all {
        println!(
            "{:<24} max={:<6} window={:?} mode={:?} key={:?} strategy={:?} on_store_failure={:?}",
            policy.name(),
            policy.max_count(),
            policy.window(),
            policy.counting_mode(),
            policy.key_generator(),
            policy.strategy(),
            policy.on_store_failure(),
        );
    }

    let mut routes: Vec<_> = policies.routes().collect();
    routes.sort_by(|a, b| a.0.cmp(b.0));
    for (route, assigned) in routes {
        let names: Vec<&str> = assigned.iter().map(|p| p.name()).collect();
        println!("route {} -> {}", route, names.join(", "));
    }
}
