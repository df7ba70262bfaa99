#![doc = include_str!("../README.md")]

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod command;
mod config;
mod context;
mod message;
mod notifier;
mod pipeline;
mod queue;
mod remote;
mod storage;
mod sustainer;
mod template;
mod worker;

use notifier::{CompositeNotifier, DirPublisher, LogNotifier, Notifier, TopicNotifier};
use queue::DirQueue;
use storage::FsStorage;
use worker::{ProcessContext, Worker};

// CLI
#[derive(Parser, Debug)]
#[command(name = "stagehand")]
#[command(version = "0.1.0")]
#[command(about = "Message-driven job runner: claims job messages from a queue, \
                   stages their remote files, runs a templated command, and \
                   uploads the results.",
          long_about = None)
]
struct Cli {
    /// The configuration file on disk
    #[arg(short, long, default_value = "stagehand.toml")]
    config: String,

    #[command(subcommand)]
    action: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Pull and run jobs until interrupted
    Run {
        /// Replacement for the configured command template
        #[arg(trailing_var_arg = true)]
        template: Vec<String>,
    },

    /// Resolve the configuration and print it
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = config::load(&cli.config)?;
    let template_args = match &cli.action {
        Some(Commands::Run { template }) => template.clone(),
        _ => Vec::new(),
    };
    config.finalize(&template_args)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log.level()));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();

    if let Some(Commands::Check) = cli.action {
        println!("{config:#?}");
        return Ok(());
    }

    info!("<-> Stagehand job runner <->");
    info!("Command template: `{}`.", config.command.template);

    tokio::fs::create_dir_all(&config.job.spool_dir).await?;
    let queue = Arc::new(DirQueue::new(
        config.job.spool_dir.clone(),
        config.job.ack_deadline(),
    ));
    let storage = Arc::new(FsStorage::new(config.storage.root.clone()));

    let mut sinks: Vec<Arc<dyn Notifier>> = vec![Arc::new(LogNotifier)];
    if config.progress.enabled() {
        info!("Publishing progress to `{}`.", config.progress.topic);
        sinks.push(Arc::new(TopicNotifier::new(
            Arc::new(DirPublisher),
            config.progress.topic.clone(),
            config.progress.level(),
            config.progress.hostname(),
            config.progress.attributes.clone(),
        )));
    }
    let notifier = Arc::new(CompositeNotifier::new(sinks));

    let ctx = Arc::new(ProcessContext {
        queue: queue,
        storage: storage,
        notifier: notifier,
        config: config,
    });
    Worker::new(ctx).listen().await
}
