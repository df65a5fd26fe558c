mod cli;
mod config;
mod manifest;
mod service;
mod store;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use item_downloader::{
    DownloadItem, DownloadQueueManager, Error, FsRelocationService, ItemStatus, ItemStore,
    QueueEvent,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use crate::cli::{Args, Commands};
use crate::config::AppConfig;
use crate::manifest::Manifest;
use crate::service::BackgroundTransferService;
use crate::store::JsonDirItemStore;

const DRAIN_CHECK_INTERVAL: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    let config = AppConfig::load(&args)?;
    debug!(?config, "Loaded configuration");

    let store = Arc::new(JsonDirItemStore::open(config.items_dir())?);

    match args.command {
        Commands::Run { manifest } => {
            let manager = build_manager(&config, store)?;
            let restored = manager.restore_from_store()?;
            if restored > 0 {
                info!(restored, "Restored saved items");
            }

            let items = Manifest::load(&manifest)?.into_items(&config.staging_dir());
            for item in items {
                match manager.enqueue(item) {
                    Ok(()) => {}
                    Err(Error::DuplicateItem(id)) => {
                        warn!(item_id = %id, "Item already queued, skipping")
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            drive(&manager).await
        }
        Commands::Resume => {
            let manager = build_manager(&config, store)?;
            manager.restore_from_store()?;
            let resumed = manager
                .items()
                .iter()
                .filter(|item| manager.resume(&item.id))
                .count();
            info!(resumed, "Resuming saved items");
            drive(&manager).await
        }
        Commands::List { json } => {
            let items = store.load_items()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&items)?);
            } else if items.is_empty() {
                println!("No saved items");
            } else {
                for item in &items {
                    println!("{}", summary_line(item));
                    if let Some(message) = &item.status_message {
                        println!("{:<24} {}", "", message);
                    }
                }
            }
            Ok(())
        }
        Commands::Cancel {
            item_id,
            delete_files,
        } => {
            let Some(mut item) = store
                .load_items()?
                .into_iter()
                .find(|item| item.id == item_id)
            else {
                bail!("no saved item with id {item_id}");
            };

            for part in item.parts.iter_mut().filter(|p| !p.is_succeeded()) {
                part.paused = true;
            }
            let manager = build_manager(&config, store)?;
            manager.restore(item);
            if !manager.cancel(&item_id, delete_files) {
                bail!("failed to cancel item {item_id}");
            }
            println!("Cancelled {item_id}");
            Ok(())
        }
    }
}

fn init_logging(verbose: bool, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("itemdl=debug,item_downloader=debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("itemdl=info,item_downloader=info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();
}

fn build_manager(
    config: &AppConfig,
    store: Arc<JsonDirItemStore>,
) -> anyhow::Result<DownloadQueueManager> {
    let service = BackgroundTransferService::new(&config.queue.fetch.user_agent)
        .context("starting background transfer service")?;
    let manager = DownloadQueueManager::builder(
        config.queue.clone(),
        Arc::new(service),
        Arc::new(FsRelocationService::new()),
    )
    .with_store(store)
    .build()?;
    Ok(manager)
}

/// Log queue events until every item has completed, failed or stopped.
async fn drive(manager: &DownloadQueueManager) -> anyhow::Result<()> {
    let mut events = manager.subscribe();
    let mut tick = tokio::time::interval(DRAIN_CHECK_INTERVAL);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping transfers");
                manager.shutdown();
                break;
            }
            event = events.recv() => match event {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event stream lagged"),
                Err(RecvError::Closed) => break,
            },
            _ = tick.tick() => {
                if is_drained(manager.in_flight_count(), &manager.items()) {
                    break;
                }
            }
        }
    }

    let failed: Vec<_> = manager
        .items()
        .into_iter()
        .filter(|i| i.status == ItemStatus::Failed)
        .collect();
    for item in &failed {
        error!(
            item_id = %item.id,
            message = item.status_message.as_deref().unwrap_or(""),
            "Download item failed"
        );
    }
    if !failed.is_empty() {
        bail!("{} item(s) failed", failed.len());
    }
    Ok(())
}

/// Nothing left to run: no transfers and only failed or stopped items.
///
/// Completed items are still waiting on their scan and removal.
fn is_drained(in_flight: usize, items: &[DownloadItem]) -> bool {
    in_flight == 0
        && items
            .iter()
            .all(|i| matches!(i.status, ItemStatus::Failed | ItemStatus::Stopped))
}

fn summary_line(item: &DownloadItem) -> String {
    let done = item.parts.iter().filter(|p| p.is_succeeded()).count();
    format!(
        "{:<24} {:<9} {:>5.1}%  {}/{} parts  {}",
        item.id,
        item.status,
        item.progress() * 100.0,
        done,
        item.parts.len(),
        item.title
    )
}

fn log_event(event: &QueueEvent) {
    match event {
        QueueEvent::ItemAdded { item } => {
            info!(item_id = %item.id, title = %item.title, status = %item.status, "Item added")
        }
        QueueEvent::PartUpdated { part } => debug!(
            item_id = %part.item_id,
            part_id = %part.id,
            progress = part.progress,
            state = ?part.state(),
            "Part updated"
        ),
        QueueEvent::ItemFailed {
            item,
            part,
            message,
        } => warn!(item_id = %item.id, part_id = %part.id, %message, "Item failed"),
        QueueEvent::ItemCancelled { item_id } => info!(%item_id, "Item cancelled"),
        QueueEvent::ItemCompleted(payload) => info!(
            item_id = %payload.item_id,
            local_folder_id = %payload.local_folder_id,
            "Item completed"
        ),
    }
}
