use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinSet;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

mod config;
mod guard;
mod handler;
mod kdc;
mod secrets;
mod session;
#[cfg(test)]
mod testutil;

use config::{ConfigArgs, GuardConfig, SecretSourceKind};
use guard::SessionGuard;
use handler::RequestHandler;
use secrets::{EnvSecretSource, FileSecretSource, SecretSource};
use session::RestTicketBackend;

/// ktgate - lazy Kerberos session bootstrap with KDC failover
#[derive(Parser)]
#[command(name = "ktgate")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(flatten)]
    config: ConfigArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Handle a single request and print the result
    Invoke {
        /// Request payload passed to the downstream query
        input: String,
    },
    /// Read requests from stdin, one per line, handling them concurrently
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = GuardConfig::from_args(&cli.config)?;
    info!(
        realm = %config.identity.realm,
        principal = %config.identity.principal,
        kdcs = config.kdcs.len(),
        "starting"
    );

    let secrets: Arc<dyn SecretSource> = match cli.config.secret_source {
        SecretSourceKind::File => Arc::new(FileSecretSource),
        SecretSourceKind::Env => Arc::new(EnvSecretSource),
    };
    let backend = Arc::new(RestTicketBackend::new(cli.config.gateway_port));
    let guard = Arc::new(SessionGuard::new(config, secrets, backend.clone()));
    let handler = Arc::new(RequestHandler::new(guard, backend));

    match cli.command {
        Commands::Invoke { input } => {
            let output = handler.handle(&input).await?;
            println!("{}", output);
        }
        Commands::Serve => serve(handler).await?,
    }

    Ok(())
}

/// Concurrent request loop: every stdin line is handled on its own task, so
/// early requests race the session bootstrap exactly as they would behind a
/// serverless front end.
async fn serve(handler: Arc<RequestHandler>) -> Result<()> {
    info!("reading requests from stdin, one per line");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut inflight = JoinSet::new();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let handler = Arc::clone(&handler);
        inflight.spawn(async move {
            match handler.handle(&line).await {
                Ok(output) => println!("{}", output),
                Err(error) => error!(%error, "request failed"),
            }
        });
    }

    while inflight.join_next().await.is_some() {}
    info!("stdin closed, shutting down");
    Ok(())
}
