use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use flow_generator::{Engine, GeneratorConfig, PgStore, RunOptions};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "flow-generator", about = "Generates and publishes channel posts for content flows")]
struct Cli {
    /// Overrides DATABASE_URL.
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one generation pass for a flow.
    Generate {
        #[arg(long)]
        flow_id: Uuid,
        /// Chat that receives the result summary.
        #[arg(long)]
        notify_chat: Option<i64>,
        /// Fail instead of keeping a partial batch when the quota runs out.
        #[arg(long)]
        no_partial: bool,
    },
    /// Publish a post to a channel now.
    Publish {
        #[arg(long)]
        post_id: Uuid,
        #[arg(long)]
        channel: String,
    },
    /// Publish every scheduled post whose time has passed.
    PublishDue,
    /// Re-discover the feed URL of a flow's website source.
    RefreshFeed {
        #[arg(long)]
        flow_id: Uuid,
        #[arg(long)]
        link: String,
    },
    /// Apply database migrations.
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = GeneratorConfig::from_env()?;
    if let Some(url) = cli.database_url {
        config.database_url = Some(url);
    }
    let database_url = config
        .database_url
        .clone()
        .context("DATABASE_URL is not set")?;

    let store = Arc::new(
        PgStore::connect(&database_url)
            .await
            .context("failed to connect to the database")?,
    );

    if let Command::Migrate = cli.command {
        store.migrate().await?;
        return Ok(());
    }

    let engine = Engine::build(config, store.clone())?;
    let outcome = run(&engine, &store, cli.command).await;
    engine.shutdown().await;
    outcome
}

async fn run(engine: &Engine, store: &PgStore, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Generate {
            flow_id,
            notify_chat,
            no_partial,
        } => {
            let report = engine
                .orchestrator
                .generate(
                    flow_id,
                    RunOptions {
                        allow_partial: !no_partial,
                        notify_chat_id: notify_chat,
                    },
                )
                .await?;
            info!(
                "Flow {} finished in state {}: {} posts, {} evicted, {} source failures",
                report.flow_id,
                report.state,
                report.posts.len(),
                report.evicted,
                report.source_failures.len()
            );
            if !report.succeeded() {
                anyhow::bail!("generation for flow {} ended in {}", flow_id, report.state);
            }
        }
        Command::Publish { post_id, channel } => {
            let post = engine.publisher()?.publish(post_id, &channel).await?;
            info!("Post {} published at {:?}", post.id, post.publication_date);
        }
        Command::PublishDue => {
            let report = engine.publisher()?.publish_due(Utc::now()).await?;
            for (id, reason) in &report.failed {
                error!("Scheduled post {} failed: {}", id, reason);
            }
            info!("{} scheduled posts published", report.published.len());
        }
        Command::RefreshFeed { flow_id, link } => match engine.web_reader.refresh_feed_url(flow_id, &link).await? {
            Some(url) => info!("Feed for {} is {}", link, url),
            None => anyhow::bail!("no feed found for {}", link),
        },
        Command::Migrate => store.migrate().await?,
    }
    Ok(())
}
