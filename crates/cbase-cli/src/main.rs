use std::sync::Arc;

use anyhow::Result;
use cbase_sync::{maybe_build_scheduler, Pipeline, ReportKind, ServiceConfig};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cbase")]
#[command(about = "Client base reconciliation service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply migrations, start the optional request scheduler, and serve
    /// the webhook endpoints.
    Serve,
    /// Apply pending database migrations and exit.
    Migrate,
    /// Ask the partner to generate a report now (client-base | nnm).
    Request { report: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = ServiceConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let pipeline = Arc::new(Pipeline::from_config(config).await?);
            pipeline.gateway().run_migrations().await?;
            if let Some(sched) = maybe_build_scheduler(pipeline.clone()).await? {
                sched.start().await?;
            }
            cbase_web::serve(pipeline).await?;
        }
        Commands::Migrate => {
            let pipeline = Pipeline::from_config(config).await?;
            pipeline.gateway().run_migrations().await?;
            println!("migrations applied");
        }
        Commands::Request { report } => {
            let Some(kind) = ReportKind::from_slug(&report) else {
                anyhow::bail!("unknown report {report}; expected client-base or nnm");
            };
            let pipeline = Pipeline::from_config(config).await?;
            pipeline.request_report(kind).await?;
            println!("requested {} report", kind.as_str());
        }
    }

    Ok(())
}
