use anyhow::{bail, Context, Result};
use cadence_backend::BackendFactory;
use cadence_core::config::Config;
use cadence_core::{LoginMethod, LoginOptions, PublishOptions, SelectionMode, Visibility};
use cadence_orchestration::{ExecutionRouter, PlatformClient, SessionManager};
use cadence_security::CredentialVault;
use cadence_telemetry::{DataSanitizer, LogFormat, LogLevel, TelemetryConfig, TelemetrySystem};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(
    after_help = "MODES:\n  auto              API backend first, browser as fallback\n  prefer-primary    Browser first, API as fallback\n  prefer-secondary  API first, browser as fallback\n  primary-only      Browser backend only\n  secondary-only    API backend only"
)]
struct Cli {
    /// Configuration file path
    #[arg(long, global = true, help = "Path to configuration file")]
    config: Option<PathBuf>,

    /// Override the backend selection mode for this run
    #[arg(long, global = true, value_parser = parse_mode)]
    mode: Option<SelectionMode>,

    /// Use in-memory backends instead of a browser and the live API
    #[arg(long, global = true)]
    offline: bool,

    /// Set log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,

    /// Set log format (json, pretty, compact)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    /// Also write logs to daily files under this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Telemetry configuration file
    #[arg(long, global = true)]
    telemetry_config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Log in, reusing a stored session when one is available
    Login {
        /// Run the login flow even if a stored session exists
        #[arg(long)]
        force: bool,
        #[arg(long, value_enum, default_value = "interactive")]
        method: MethodArg,
        /// Session token for `--method token`
        #[arg(long, required_if_eq("method", "token"))]
        token: Option<String>,
    },
    /// End the session and delete stored credentials
    Logout,
    /// Show the signed-in user and backend state
    Status,
    /// Probe both backends once
    Health,
    /// List shows on the account
    Shows,
    /// List resources of a show
    Resources { show_id: String },
    /// Publish one or more resources
    Publish {
        #[arg(required = true)]
        resource_ids: Vec<String>,
        /// Publish at this time instead of immediately (RFC 3339)
        #[arg(long)]
        schedule: Option<DateTime<Utc>>,
        #[arg(long, value_parser = parse_visibility, default_value = "public")]
        visibility: Visibility,
        #[arg(long)]
        notify: bool,
    },
    /// Save the backend selection mode to the config file
    Mode {
        #[arg(value_parser = parse_mode)]
        mode: SelectionMode,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum MethodArg {
    Interactive,
    Token,
}

fn parse_mode(s: &str) -> std::result::Result<SelectionMode, String> {
    s.parse().map_err(|e: cadence_core::CadenceError| e.to_string())
}

fn parse_visibility(s: &str) -> std::result::Result<Visibility, String> {
    s.parse().map_err(|e: cadence_core::CadenceError| e.to_string())
}

async fn create_telemetry_config(cli: &Cli) -> Result<TelemetryConfig> {
    let mut config = TelemetryConfig::load(cli.telemetry_config.as_deref()).await?;

    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    if let Some(dir) = &cli.log_dir {
        config.logging.file_enabled = true;
        config.logging.log_dir = dir.clone();
    }

    Ok(config)
}

/// Everything a command may need, built once at start-up.
struct App {
    router: Arc<ExecutionRouter>,
    sessions: Arc<SessionManager>,
    client: PlatformClient,
    config_path: Option<PathBuf>,
}

impl App {
    fn build(cli: &Cli, mut config: Config, sanitizer: DataSanitizer) -> Result<Self> {
        if let Some(mode) = cli.mode {
            config.router.mode = mode;
        }

        let backends = if cli.offline {
            info!("Using offline backends");
            BackendFactory::offline()
        } else {
            BackendFactory::live(&config, sanitizer)?
        };

        let router = Arc::new(ExecutionRouter::new(
            config.router.clone(),
            backends.primary,
            backends.secondary,
        )?);
        let vault = Arc::new(
            CredentialVault::new(&config.storage).context("Failed to open credential vault")?,
        );
        let sessions = Arc::new(
            SessionManager::new(config.auth.clone(), vault, backends.authenticator)
                .with_router(router.clone()),
        );
        let client = PlatformClient::new(router.clone(), sessions.clone());

        Ok(Self {
            router,
            sessions,
            client,
            config_path: cli.config.clone(),
        })
    }

    /// Start the backends. Commands that only report state carry on when
    /// nothing came up.
    async fn start(&self, tolerate_failure: bool) -> Result<()> {
        match self.router.initialize().await {
            Ok(()) => Ok(()),
            Err(e) if tolerate_failure => {
                warn!(error = %e, "No backend could be started");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn run(&self, command: &Command) -> Result<()> {
        match command {
            Command::Login {
                force,
                method,
                token,
            } => {
                self.start(false).await?;
                let method = match (method, token) {
                    (MethodArg::Token, Some(token)) => LoginMethod::SessionToken {
                        token: token.clone(),
                    },
                    (MethodArg::Token, None) => bail!("--method token needs --token"),
                    (MethodArg::Interactive, _) => LoginMethod::Interactive,
                };
                self.login(LoginOptions {
                    force: *force,
                    method,
                })
                .await
            }
            Command::Logout => {
                self.sessions.logout().await?;
                println!("Logged out; stored session removed");
                Ok(())
            }
            Command::Status => {
                self.start(true).await?;
                self.status().await
            }
            Command::Health => {
                self.start(true).await?;
                self.health().await
            }
            Command::Shows => {
                self.start(false).await?;
                for show in self.client.list_shows().await? {
                    let count = show
                        .resource_count
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "-".to_string());
                    println!("{}\t{}\t{}", show.id, count, show.title);
                }
                Ok(())
            }
            Command::Resources { show_id } => {
                self.start(false).await?;
                for resource in self.client.list_resources(show_id).await? {
                    let status = serde_json::to_value(resource.status)?;
                    println!(
                        "{}\t{}\t{}",
                        resource.id,
                        status.as_str().unwrap_or("unknown"),
                        resource.title
                    );
                }
                Ok(())
            }
            Command::Publish {
                resource_ids,
                schedule,
                visibility,
                notify,
            } => {
                self.start(false).await?;
                let options = PublishOptions {
                    scheduled_at: *schedule,
                    visibility: *visibility,
                    notify_subscribers: *notify,
                };
                self.publish(resource_ids, &options).await
            }
            Command::Mode { mode } => {
                let path = Config::update_file(self.config_path.as_deref(), |c| {
                    c.router.mode = *mode
                })
                .await?;
                println!("Mode set to {} in {}", mode, path.display());
                Ok(())
            }
        }
    }

    async fn login(&self, options: LoginOptions) -> Result<()> {
        let result = self.sessions.login(options).await?;
        if !result.success {
            bail!(
                "Login failed: {}",
                result.error.as_deref().unwrap_or("no reason given")
            );
        }

        let user = result.user.unwrap_or_else(cadence_core::UserIdentity::placeholder);
        let source = if result.restored {
            "stored session"
        } else {
            "login flow"
        };
        println!(
            "Logged in as {} ({}) via {}",
            user.user_name, user.user_id, source
        );
        Ok(())
    }

    async fn status(&self) -> Result<()> {
        let user = self.sessions.current_user().await;
        let report = serde_json::json!({
            "authenticated": self.sessions.is_authenticated().await,
            "user": user,
            "router": self.client.status().await,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        Ok(())
    }

    async fn health(&self) -> Result<()> {
        let mut healthy = 0;
        for (identity, result) in self.router.check_all_backends().await {
            if result.healthy {
                healthy += 1;
            }
            println!(
                "{:<10}{:<11}{:>6}ms  {}",
                identity.as_str(),
                if result.healthy { "healthy" } else { "unhealthy" },
                result.latency_ms,
                result.error.unwrap_or_default()
            );
        }
        if healthy == 0 {
            bail!("No healthy backend");
        }
        Ok(())
    }

    async fn publish(&self, resource_ids: &[String], options: &PublishOptions) -> Result<()> {
        let outcomes = match resource_ids {
            [single] => vec![self.client.publish_one(single, options).await?],
            many => self.client.publish_many(many, options).await?,
        };

        let mut failed = 0;
        for outcome in &outcomes {
            if outcome.success {
                println!(
                    "published\t{}\t{}",
                    outcome.resource_id,
                    outcome.url.as_deref().unwrap_or("")
                );
            } else {
                failed += 1;
                println!(
                    "failed\t{}\t{}",
                    outcome.resource_id,
                    outcome.error.as_deref().unwrap_or("unknown error")
                );
            }
        }
        if failed > 0 {
            bail!("{} of {} resources failed to publish", failed, outcomes.len());
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let telemetry_config = create_telemetry_config(&cli).await?;
    let sanitizer = DataSanitizer::new(&telemetry_config.privacy)?;
    let _telemetry_guard = TelemetrySystem::init(telemetry_config).map_err(|e| {
        eprintln!("Failed to initialize telemetry system: {}", e);
        anyhow::anyhow!("Telemetry initialization failed: {}", e)
    })?;

    let config = Config::load(cli.config.as_deref())
        .await
        .context("Failed to load configuration")?;
    let app = App::build(&cli, config, sanitizer)?;

    let outcome = app.run(&cli.command).await;
    if let Err(e) = app.router.dispose().await {
        warn!(error = %e, "Router shutdown failed");
    }
    outcome
}
