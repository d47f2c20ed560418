//! Sync command: joins the relay and keeps the local replica in sync.

use std::time::Duration;

use clap::Args;
use tabsync_core::sync::{build_ws_url, connect};
use tabsync_core::{Synchronizer, SynchronizerOptions};

use tabsync::config::Config;

use super::replica::LocalReplica;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Sync the local replica with the relay
#[derive(Debug, Args)]
pub struct SyncCommand {
    /// Stop after this many seconds (default: run until Ctrl-C)
    #[arg(long, value_name = "SECS")]
    duration: Option<u64>,
}

impl SyncCommand {
    pub async fn run(
        &self,
        replica: &LocalReplica,
        config: &Config,
        topic: &str,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let url = build_ws_url(&config.server_url.value, topic);
        println!("Syncing '{}' with {}...", topic, url);

        let transport = connect(&url).await?;
        let options = SynchronizerOptions {
            request_timeout: config.request_timeout(DEFAULT_REQUEST_TIMEOUT),
            ..SynchronizerOptions::default()
        };
        let synchronizer = Synchronizer::new(
            replica.store().clone(),
            transport,
            options,
            replica.scheduler().clone(),
        );

        replica.persister().start_auto_save().await;
        synchronizer.start_sync(None).await;
        println!("Connected. Press Ctrl-C to stop.");

        match self.duration {
            Some(secs) => {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                    _ = tokio::signal::ctrl_c() => {}
                }
            }
            None => tokio::signal::ctrl_c().await?,
        }

        synchronizer.stop_sync();
        replica.persister().stop_auto_save();
        replica.save().await;

        let stats = synchronizer.stats();
        synchronizer.destroy();
        println!();
        println!("Sync stopped.");
        println!("  sent:     {}", stats.sends);
        println!("  received: {}", stats.receives);
        println!("  saved to: {}", replica.path().display());

        Ok(())
    }
}
