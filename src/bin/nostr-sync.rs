//! Standalone sync daemon: loads a relay config, dials every configured
//! relay, and runs the dispatch/recovery sweep on a fixed tick.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use nostr_sync::config::Config;
use nostr_sync::event::{EventValidator, ExpirationOnlyValidator, InMemoryEventStore};
use nostr_sync::orchestrator::{self, SyncMode};
use nostr_sync::relay::{HandlerRegistry, Manager, TungsteniteTransport};
use nostr_sync::sync_state::{InMemorySyncStateStore, SyncStateStore};
use nostr_sync::workers::WorkerContext;

struct Args {
    config_path: PathBuf,
    tick_seconds: u64,
}

impl Args {
    fn parse(args: &[String]) -> Self {
        let mut res = Args {
            config_path: PathBuf::from("nostr-sync.toml"),
            tick_seconds: 60,
        };

        let mut i = 0;
        while i < args.len() {
            let arg = &args[i];
            if arg == "--config" {
                i += 1;
                if let Some(path) = args.get(i) {
                    res.config_path = PathBuf::from(path);
                } else {
                    tracing::error!("--config argument missing?");
                }
            } else if arg == "--tick-seconds" {
                i += 1;
                if let Some(raw) = args.get(i) {
                    match raw.parse() {
                        Ok(seconds) => res.tick_seconds = seconds,
                        Err(_) => tracing::error!("--tick-seconds wasn't a number: {raw}"),
                    }
                } else {
                    tracing::error!("--tick-seconds argument missing?");
                }
            }
            i += 1;
        }

        res
    }
}

#[tokio::main]
async fn main() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("nostr_sync=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args: Vec<String> = env::args().skip(1).collect();
    let cli = Args::parse(&args);

    let config = match Config::load(&cli.config_path) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                path = %cli.config_path.display(),
                error = %err,
                "couldn't load config file, falling back to defaults"
            );
            Config::default()
        }
    };

    let handlers = Arc::new(HandlerRegistry::new());
    let manager = Arc::new(Manager::new(
        Arc::new(TungsteniteTransport),
        handlers,
        Duration::from_secs(config.reconnect_delay_seconds),
        config.max_reconnect_attempts,
    ));

    let sync_states: Arc<dyn SyncStateStore> = Arc::new(InMemorySyncStateStore::new());
    let validator: Arc<dyn EventValidator> = Arc::new(ExpirationOnlyValidator);

    let ctx = WorkerContext::new(
        Arc::new(InMemoryEventStore::new()),
        validator,
        sync_states,
        manager,
        Arc::new(config),
    );

    tracing::info!(
        relays = ctx.config.relays.len(),
        tick_seconds = cli.tick_seconds,
        "starting sync loop"
    );

    let mut ticker = tokio::time::interval(Duration::from_secs(cli.tick_seconds));
    loop {
        ticker.tick().await;

        let recovery = match orchestrator::recover_stale(&ctx).await {
            Ok(recovery) => recovery,
            Err(err) => {
                tracing::error!(error = %err, "recovery sweep failed");
                continue;
            }
        };
        if recovery.recovered_stale > 0 || recovery.retried_errors > 0 {
            tracing::info!(
                recovered_stale = recovery.recovered_stale,
                retried_errors = recovery.retried_errors,
                "recovered stuck sync rows"
            );
        }

        let outcome = orchestrator::dispatch_sync_jobs(&ctx, SyncMode::Full, None).await;
        tracing::debug!(dispatched = outcome.dispatched, "dispatch sweep complete");
    }
}
