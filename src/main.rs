//! Zentinel Shibboleth Agent
//!
//! Administrative and diagnostic CLI for the Shibboleth federation agent:
//! manages attribute rules, simulates federated requests against the stores,
//! composes logout redirects and sweeps expired sessions.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use zentinel_agent_shibboleth::accounts::{AccountStore, Caller};
use zentinel_agent_shibboleth::attributes::RequestContext;
use zentinel_agent_shibboleth::rules::{
    GrantSet, RuleCommand, RuleDraft, RuleId, RuleListing, RuleStore,
};
use zentinel_agent_shibboleth::session::{spawn_cleanup_task, sweep, SessionId, SessionStore};
use zentinel_agent_shibboleth::{
    FederationAgent, FederationConfig, FederationConfigJson, LoginLink, RequestOutcome,
};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "zentinel-shib-agent", version, about = "Shibboleth federation agent")]
struct Args {
    /// JSON config file (kebab-case keys)
    #[arg(long, global = true, env = "SHIB_AGENT_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true, env = "SHIB_AGENT_VERBOSE")]
    verbose: bool,

    /// Rule store path (overrides config)
    #[arg(long, global = true, env = "SHIB_RULE_STORE_PATH")]
    rule_store: Option<String>,

    /// Account store path (overrides config)
    #[arg(long, global = true, env = "SHIB_ACCOUNT_STORE_PATH")]
    account_store: Option<String>,

    /// Session store path (overrides config)
    #[arg(long, global = true, env = "SHIB_SESSION_STORE_PATH")]
    session_store: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Manage authorization rules
    Rules {
        #[command(subcommand)]
        action: RulesAction,
    },

    /// Run one request through the agent and print the outcome as JSON
    Simulate {
        /// JSON object of server variables
        #[arg(long)]
        env: PathBuf,

        /// Current path (without leading slash)
        #[arg(long, default_value = "")]
        path: String,

        #[arg(long, default_value = "localhost")]
        host: String,

        #[arg(long, default_value = "https")]
        scheme: String,

        /// Existing session id (hex); a new session is started otherwise
        #[arg(long)]
        session: Option<String>,

        /// Id of the account already logged in on this session
        #[arg(long)]
        account: Option<u64>,

        /// Custom e-mail form submission
        #[arg(long)]
        custom_email: Option<String>,

        /// Site base path used for the login link
        #[arg(long, default_value = "")]
        base_path: String,
    },

    /// End the federated login of a session and print the IdP logout URL
    Logout {
        #[arg(long)]
        session: String,

        #[arg(long, default_value = "localhost")]
        host: String,

        /// Site base URL, the default post-logout target
        #[arg(long, default_value = "https://localhost")]
        base_url: String,
    },

    /// Evict expired sessions
    Sweep {
        /// Keep running and sweep periodically until interrupted
        #[arg(long)]
        watch: bool,

        /// Sweep interval in seconds (implies --watch; defaults to the configured interval)
        #[arg(long)]
        interval_secs: Option<u64>,
    },
}

#[derive(Subcommand, Debug)]
enum RulesAction {
    /// List rules in store order
    List,

    /// Store a new rule
    Add {
        #[command(flatten)]
        rule: RuleArgs,
    },

    /// Replace an existing rule
    Edit {
        id: u64,

        #[command(flatten)]
        rule: RuleArgs,
    },

    /// Delete a rule
    Delete { id: u64 },

    /// Duplicate a rule under a new id
    Clone { id: u64 },
}

#[derive(clap::Args, Debug)]
struct RuleArgs {
    /// Server variable to test
    #[arg(long)]
    attribute: String,

    /// Regular expression matched against each `;`-separated value
    #[arg(long)]
    pattern: String,

    /// Granted role as ID:NAME (repeatable)
    #[arg(long = "grant")]
    grants: Vec<String>,
}

impl RuleArgs {
    fn into_draft(self) -> Result<RuleDraft> {
        let mut grants = GrantSet::new();
        for pair in &self.grants {
            let (id, name) = GrantSet::parse_pair(pair)?;
            grants.insert(id, name);
        }
        Ok(RuleDraft::new(self.attribute, self.pattern, grants))
    }
}

/// Simulation output.
#[derive(Serialize)]
struct SimulationReport {
    session: String,
    outcome: RequestOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    login_link: Option<LoginLink>,
}

/// Build the configuration from defaults, the config file and CLI overrides.
fn load_config(args: &Args) -> Result<FederationConfig> {
    let mut config = FederationConfig::default();

    if let Some(ref path) = args.config {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let json: FederationConfigJson =
            serde_json::from_str(&text).context("Failed to parse config file")?;
        json.apply_to(&mut config);
    }

    if let Some(ref path) = args.rule_store {
        config.rule_store_path = path.clone();
    }
    if let Some(ref path) = args.account_store {
        config.account_store_path = path.clone();
    }
    if let Some(ref path) = args.session_store {
        config.session_store_path = path.clone();
    }

    config
        .validate()
        .map_err(|e| anyhow!("Invalid configuration: {}", e))?;
    Ok(config)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read environment file: {:?}", path))?;
    serde_json::from_str(&text).context("Environment file must be a JSON object of strings")
}

fn parse_session_id(hex: &str) -> Result<SessionId> {
    SessionId::from_hex(hex).ok_or_else(|| anyhow!("Invalid session id: {}", hex))
}

fn run_rules(config: &FederationConfig, action: RulesAction) -> Result<()> {
    let store = RuleStore::open(PathBuf::from(&config.rule_store_path))?;

    let command = match action {
        RulesAction::List => {
            let rows: Vec<RuleListing> = store.list()?.iter().map(|r| r.listing()).collect();
            return print_json(&rows);
        }
        RulesAction::Add { rule } => RuleCommand::Create(rule.into_draft()?),
        RulesAction::Edit { id, rule } => RuleCommand::Update {
            id: RuleId(id),
            draft: rule.into_draft()?,
        },
        RulesAction::Delete { id } => RuleCommand::Delete(RuleId(id)),
        RulesAction::Clone { id } => RuleCommand::Clone(RuleId(id)),
    };

    let outcome = store.apply(command)?;
    println!("{}", outcome.message());
    Ok(())
}

struct SimulateRequest {
    env: PathBuf,
    path: String,
    host: String,
    scheme: String,
    session: Option<String>,
    account: Option<u64>,
    custom_email: Option<String>,
    base_path: String,
}

fn run_simulate(config: FederationConfig, request: SimulateRequest) -> Result<()> {
    let rules = Arc::new(RuleStore::open(PathBuf::from(&config.rule_store_path))?);
    let accounts = Arc::new(AccountStore::open(PathBuf::from(&config.account_store_path))?);
    let sessions = SessionStore::open(
        PathBuf::from(&config.session_store_path),
        config.session_ttl_secs,
    )?;

    let session_id = request.session.as_deref().map(parse_session_id).transpose()?;
    let mut session = sessions.get_or_create(session_id)?;

    let caller = match request.account {
        Some(id) => Caller::Account(
            accounts
                .get(id)?
                .ok_or_else(|| anyhow!("Account {} not found", id))?,
        ),
        None => Caller::Anonymous,
    };

    let mut ctx = RequestContext::new(request.path, read_env_file(&request.env)?)
        .with_host(request.host);
    ctx.scheme = request.scheme;
    ctx.custom_email = request.custom_email;

    let agent = FederationAgent::new(config, rules, accounts);
    let outcome = agent.handle_request(&ctx, &mut session, caller)?;
    sessions.save(&session)?;

    let login_link = agent.login_link(&ctx, &outcome.caller, &request.base_path)?;

    debug!(session_id = %session.id, "Simulation complete");
    print_json(&SimulationReport {
        session: session.id.to_hex(),
        outcome,
        login_link,
    })
}

fn run_logout(config: FederationConfig, session: &str, host: String, base_url: &str) -> Result<()> {
    let id = parse_session_id(session)?;

    let rules = Arc::new(RuleStore::open(PathBuf::from(&config.rule_store_path))?);
    let accounts = Arc::new(AccountStore::open(PathBuf::from(&config.account_store_path))?);
    let sessions = SessionStore::open(
        PathBuf::from(&config.session_store_path),
        config.session_ttl_secs,
    )?;

    let mut session = match sessions.get(id)? {
        Some(s) => s,
        None => bail!("Session {} not found or expired", id),
    };

    let agent = FederationAgent::new(config, rules, accounts);
    let ctx = RequestContext::new("", HashMap::new()).with_host(host);
    let url = agent.logout(&ctx, &mut session, base_url)?;
    sessions.save(&session)?;

    println!("{}", url);
    Ok(())
}

/// Interval for periodic sweeping, `None` for a single pass.
fn sweep_interval(config: &FederationConfig, watch: bool, interval_secs: Option<u64>) -> Option<u64> {
    match interval_secs {
        Some(secs) => Some(secs),
        None if watch => Some(config.cleanup_interval_secs),
        None => None,
    }
}

async fn run_sweep(config: &FederationConfig, interval: Option<u64>) -> Result<()> {
    let store = Arc::new(SessionStore::open(
        PathBuf::from(&config.session_store_path),
        config.session_ttl_secs,
    )?);

    match interval {
        None => {
            let evicted = sweep(&store);
            println!("{}", evicted);
        }
        Some(secs) => {
            info!(interval_secs = secs, "Starting session cleanup task");
            let handle = spawn_cleanup_task(Arc::clone(&store), secs);
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for shutdown signal")?;
            handle.abort();
            info!("Session cleanup task stopped");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize tracing
    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!(
            "{}={},zentinel_agent_shibboleth={}",
            env!("CARGO_CRATE_NAME"),
            log_level,
            log_level
        ))
        .with_writer(std::io::stderr)
        .json()
        .init();

    let config = load_config(&args)?;

    debug!(
        rule_store = %config.rule_store_path,
        account_store = %config.account_store_path,
        session_store = %config.session_store_path,
        mail_shib_only = config.mail_shib_only,
        "Configuration loaded"
    );

    match args.command {
        Command::Rules { action } => run_rules(&config, action),
        Command::Simulate {
            env,
            path,
            host,
            scheme,
            session,
            account,
            custom_email,
            base_path,
        } => run_simulate(
            config,
            SimulateRequest {
                env,
                path,
                host,
                scheme,
                session,
                account,
                custom_email,
                base_path,
            },
        ),
        Command::Logout {
            session,
            host,
            base_url,
        } => run_logout(config, &session, host, &base_url),
        Command::Sweep {
            watch,
            interval_secs,
        } => {
            let interval = sweep_interval(&config, watch, interval_secs);
            run_sweep(&config, interval).await
        }
    }
}
