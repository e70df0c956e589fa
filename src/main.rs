use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use runwarden::config::{LogFormat, RunwardenConfig};
use runwarden::execution::{ExecutionId, ExecutionStatus, SubmitRequest};
use runwarden::gateway::{PollClient, StatusView};
use runwarden::ledger::Ledger;

#[derive(Parser)]
#[command(
    name = "runwarden",
    about = "Retrying, time-bounded execution engine for headless browser tests",
    version,
    long_about = None
)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + orchestrator + watchdog)
    Serve {
        /// Bind address, overrides [server] bind
        #[arg(long)]
        bind: Option<String>,
    },

    /// Submit a test file for execution
    Submit {
        /// Test source file (body of an async function receiving page, browser, baseUrl)
        file: PathBuf,

        /// Caller-chosen test identifier (defaults to the file name)
        #[arg(long)]
        test_id: Option<String>,

        /// playwright, puppeteer, or selenium
        #[arg(long, default_value = "playwright")]
        framework: String,

        /// javascript, typescript, or python
        #[arg(long)]
        language: Option<String>,

        /// Base URL of the application under test
        #[arg(long)]
        base_url: Option<String>,

        /// chromium, firefox, or webkit
        #[arg(long)]
        browser: Option<String>,

        /// Viewport width in pixels
        #[arg(long)]
        viewport_width: Option<i64>,

        /// Viewport height in pixels
        #[arg(long)]
        viewport_height: Option<i64>,

        /// Custom user agent string
        #[arg(long)]
        user_agent: Option<String>,

        /// Per-attempt timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<i64>,

        /// Maximum number of attempts
        #[arg(long)]
        max_attempts: Option<i64>,

        /// Do not capture screenshots
        #[arg(long)]
        no_screenshot: bool,

        /// Poll until the execution finishes
        #[arg(long)]
        wait: bool,

        /// Server URL, overrides [client] server_url
        #[arg(long)]
        server: Option<String>,
    },

    /// Show the status of an execution
    Status {
        /// Execution ID
        id: String,

        /// Poll until the execution finishes
        #[arg(long)]
        wait: bool,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,

        /// Server URL, overrides [client] server_url
        #[arg(long)]
        server: Option<String>,
    },

    /// Cancel a running or pending execution
    Cancel {
        /// Execution ID
        id: String,

        /// Server URL, overrides [client] server_url
        #[arg(long)]
        server: Option<String>,
    },

    /// Inspect the local execution ledger
    Executions {
        #[command(subcommand)]
        action: ExecutionsAction,
    },

    /// Print the effective configuration
    Config,
}

#[derive(Subcommand)]
enum ExecutionsAction {
    /// List recent executions
    List {
        /// Maximum rows to show
        #[arg(long, default_value = "20")]
        limit: usize,

        /// Only show executions in this status
        #[arg(long)]
        status: Option<String>,
    },

    /// Show one execution with all attempts
    Show {
        /// Execution ID
        id: String,
    },
}

fn init_tracing(config: &RunwardenConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match config.logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

fn client(config: &RunwardenConfig, server: Option<String>) -> PollClient {
    PollClient::new(server.unwrap_or_else(|| config.client.server_url.clone())).with_polling(
        Duration::from_millis(config.client.poll_interval_ms),
        Duration::from_secs(config.client.max_wait_sec),
    )
}

fn parse_id(raw: &str) -> Result<ExecutionId> {
    raw.parse()
        .with_context(|| format!("malformed execution id '{}'", raw))
}

fn print_view(view: &StatusView) {
    println!("Execution:  {}", view.execution_id);
    println!("Status:     {}", view.status);
    println!("Attempts:   {}", view.attempts);
    if let Some(ms) = view.duration_ms {
        println!("Duration:   {} ms", ms);
    }
    if let Some(err) = &view.error {
        println!("Error:      {}", err);
    }
    if let Some(url) = &view.screenshot_url {
        println!("Screenshot: {}", url);
    }
    if let Some(url) = &view.log_url {
        println!("Log:        {}", url);
    }
    if !view.logs.is_empty() {
        println!("\n{}", view.logs.trim_end());
    }
}

fn exit_for(view: &StatusView) -> ExitCode {
    match view.status {
        ExecutionStatus::Failed => ExitCode::from(2),
        _ => ExitCode::SUCCESS,
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let mut config = RunwardenConfig::resolve(cli.config.as_deref())?;
    init_tracing(&config);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            tracing::info!(bind = %config.server.bind, "Starting runwarden daemon");
            runwarden::serve(config).await?;
        }
        Commands::Submit {
            file,
            test_id,
            framework,
            language,
            base_url,
            browser,
            viewport_width,
            viewport_height,
            user_agent,
            timeout_ms,
            max_attempts,
            no_screenshot,
            wait,
            server,
        } => {
            let source = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read test file {}", file.display()))?;
            let test_id = test_id.unwrap_or_else(|| {
                file.file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "test".to_string())
            });
            let request = SubmitRequest {
                test_id,
                source,
                framework,
                language,
                base_url,
                browser,
                viewport_width,
                viewport_height,
                user_agent,
                timeout_ms,
                max_attempts,
                capture_screenshot: if no_screenshot { Some(false) } else { None },
            };

            let client = client(&config, server);
            let id = client.submit(&request).await?;
            println!("Submitted execution {}", id);
            if wait {
                let view = client.wait_for_terminal(id).await?;
                println!();
                print_view(&view);
                return Ok(exit_for(&view));
            }
        }
        Commands::Status {
            id,
            wait,
            json,
            server,
        } => {
            let id = parse_id(&id)?;
            let client = client(&config, server);
            let view = if wait {
                client.wait_for_terminal(id).await?
            } else {
                match client.status(id).await? {
                    Some(view) => view,
                    None => anyhow::bail!("execution {} not found", id),
                }
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&view)?);
            } else {
                print_view(&view);
            }
            if view.is_terminal() {
                return Ok(exit_for(&view));
            }
        }
        Commands::Cancel { id, server } => {
            let id = parse_id(&id)?;
            if client(&config, server).cancel(id).await? {
                println!("Execution {} cancelled.", id);
            } else {
                println!("Execution {} had already finished.", id);
            }
        }
        Commands::Executions { action } => {
            let pool = runwarden::storage::open_pool(&config.storage.db_path)?;
            let ledger = Ledger::new(pool);

            match action {
                ExecutionsAction::List { limit, status } => {
                    let status = match status {
                        Some(s) => Some(s.parse::<ExecutionStatus>().map_err(anyhow::Error::msg)?),
                        None => None,
                    };
                    let list = ledger.list_recent(limit, status).await?;
                    if list.is_empty() {
                        println!("No executions found.");
                    } else {
                        println!(
                            "{:<36} | {:<20} | {:<9} | {:<8} | Created",
                            "ID", "Test", "Status", "Attempts"
                        );
                        println!("{:-<36}-|-{:-<20}-|-{:-<9}-|-{:-<8}-|-{:-<20}", "", "", "", "", "");
                        for e in list {
                            println!(
                                "{:<36} | {:<20} | {:<9} | {:<8} | {}",
                                e.id,
                                e.test_id,
                                e.status.as_str(),
                                e.attempt_count,
                                e.created_at.to_rfc3339()
                            );
                        }
                    }
                }
                ExecutionsAction::Show { id } => {
                    let id = parse_id(&id)?;
                    match ledger.get(id).await? {
                        Some(exec) => println!("{}", serde_json::to_string_pretty(&exec)?),
                        None => anyhow::bail!("execution {} not found", id),
                    }
                }
            }
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(ExitCode::SUCCESS)
}
