mod cli;

use transforge::{
    config,
    jobs::JobStore,
    retention, server,
    server::auth,
    tools::{self, ToolPaths},
};
use transforge_db::pool::init_pool;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands};
use std::path::Path;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG env var if set, otherwise use defaults based on verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "transforge=trace,transforge_db=debug,transforge_common=debug,tower_http=debug"
                .to_string()
        } else {
            "transforge=info,transforge_db=info,tower_http=info".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .init();

    match cli.command {
        Commands::Start { host, port } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(start_server(host, port, cli.config.as_deref()))
        }
        Commands::CheckTools => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(check_tools(cli.config.as_deref()))
        }
        Commands::Validate {
            config: config_path,
        } => {
            let path = config_path.or(cli.config);
            validate_config(path.as_deref())
        }
        Commands::Prune { days } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(prune(days, cli.config.as_deref()))
        }
        Commands::Version => {
            println!("transforge {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::GenerateApiKey => {
            println!("{}", auth::generate_api_key());
            Ok(())
        }
        Commands::GenerateSecret => {
            println!("{}", auth::generate_secret());
            Ok(())
        }
    }
}

async fn start_server(
    host: Option<String>,
    port: Option<u16>,
    config_path: Option<&Path>,
) -> Result<()> {
    let mut config = config::load_config_or_default(config_path)?;
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    config::validate_config(&config)?;

    tracing::info!(
        "Starting transforge on {}:{} with {} workers",
        config.server.host,
        config.server.port,
        config.workers.count
    );
    if !config.auth.enabled {
        tracing::warn!("Authentication is disabled, every request runs as the anonymous owner");
    }

    server::start_server(config).await
}

async fn check_tools(config_path: Option<&Path>) -> Result<()> {
    let config = config::load_config_or_default(config_path)?;
    println!("Checking external tools...\n");

    let infos = tools::check_tools(&ToolPaths::resolve(&config.tools)).await;
    let mut all_ok = true;

    for tool in &infos {
        let status = if tool.available {
            "✓"
        } else {
            all_ok = false;
            "✗"
        };

        print!("{} {}", status, tool.name);
        if let Some(ref version) = tool.version {
            print!(" ({})", version);
        }
        if let Some(ref path) = tool.path {
            print!(" - {}", path.display());
        }
        println!();
    }

    println!();
    if all_ok {
        println!("All required tools are available!");
        Ok(())
    } else {
        anyhow::bail!("Some required tools are missing");
    }
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    match path {
        Some(p) => {
            println!("Validating config: {:?}", p);
            let config = config::load_config(p)?;
            println!("✓ Configuration is valid");
            println!("  Server: {}:{}", config.server.host, config.server.port);
            println!(
                "  Auth enabled: {} ({} keys)",
                config.auth.enabled,
                config.auth.keys.len()
            );
            println!("  Storage root: {}", config.storage.root.display());
            println!("  Database: {}", config.database.path.display());
            println!("  Workers: {}", config.workers.count);
            println!(
                "  Max active jobs per owner: {}",
                config.quota.max_active_jobs_per_owner
            );
            println!("  Webhook attempts: {}", config.webhook.max_attempts);
        }
        None => {
            println!("No config file specified, using defaults");
            let config = config::Config::default();
            println!("Default config:");
            println!("  Server: {}:{}", config.server.host, config.server.port);
        }
    }

    Ok(())
}

async fn prune(days: Option<u32>, config_path: Option<&Path>) -> Result<()> {
    let config = config::load_config_or_default(config_path)?;
    let days = days.unwrap_or(config.retention.completed_job_days);

    let db_path = config.database.path.to_string_lossy().into_owned();
    let db = init_pool(&db_path, 1).with_context(|| format!("Failed to open database at {db_path}"))?;
    let removed = retention::prune_once(&JobStore::new(db), days).await?;

    println!("Removed {removed} finished jobs older than {days} days");
    Ok(())
}
