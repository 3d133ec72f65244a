use std::path::Path;
use std::sync::Arc;

use feed_types::record::MarketDataRecord;
use live_feed::config::{DispatchMode, FeedConfig};
use live_feed::connector::{ConnectorHandle, IngestConnector, ReadMode};
use live_feed::decoder::LengthPrefixedJsonFactory;
use live_feed::dispatcher::{ProcessorCallback, RecordProcessor};
use live_feed::lifecycle::PipelineLifecycle;
use live_feed::management::{create_router, ManagementState, PipelineStatus};
use live_feed::metrics::PipelineMetrics;
use live_feed::source;
use live_feed::store::{LiveValueStore, StoreProcessor};
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tracing_subscriber::EnvFilter;

/// The running pipeline, in whichever shape the config asked for.
enum Pipeline {
    Split(Arc<PipelineLifecycle<MarketDataRecord>>),
    Direct(ConnectorHandle),
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match std::env::args_os().nth(1) {
        Some(path) => FeedConfig::from_json_file(Path::new(&path))?,
        None => {
            tracing::info!("No config file given, using defaults");
            FeedConfig::default()
        }
    };

    tracing::info!(
        version = live_feed::SERVICE_VERSION,
        mode = ?config.mode,
        "Starting live feed service"
    );

    let source = source::from_config(&config.source);
    let decoders = Arc::new(LengthPrefixedJsonFactory::<MarketDataRecord>::new(
        config.max_frame_len,
    ));
    let store: Arc<LiveValueStore<MarketDataRecord>> = Arc::new(LiveValueStore::new());
    let processor: Arc<dyn RecordProcessor<MarketDataRecord>> =
        Arc::new(StoreProcessor::new(Arc::clone(&store)));
    let metrics = Arc::new(PipelineMetrics::new());

    let (pipeline, status) = match config.mode {
        DispatchMode::Split => {
            let lifecycle = Arc::new(
                PipelineLifecycle::new(
                    source,
                    decoders,
                    processor,
                    config.lifecycle_config(),
                    Handle::current(),
                )
                .with_metrics(Arc::clone(&metrics)),
            );
            lifecycle.start();
            let status: Arc<dyn PipelineStatus> = lifecycle.clone();
            (Pipeline::Split(lifecycle), status)
        }
        DispatchMode::Inline | DispatchMode::Pipelined => {
            let read_mode = if config.mode == DispatchMode::Pipelined {
                ReadMode::Pipelined {
                    pool: Handle::current(),
                    queue: config.queue.clone(),
                }
            } else {
                ReadMode::Inline
            };
            let handle = IngestConnector::with_metrics(
                source,
                decoders,
                Arc::new(ProcessorCallback::new(processor)),
                config.connector_config(),
                Arc::clone(&metrics),
            )
            .read_mode(read_mode)
            .spawn();
            let status: Arc<dyn PipelineStatus> = Arc::new(handle.status());
            (Pipeline::Direct(handle), status)
        }
    };

    // Create router
    let app = create_router(ManagementState {
        store,
        metrics,
        pipeline: status,
    });

    // Bind and serve
    let listener = TcpListener::bind(config.management_addr).await?;
    tracing::info!(addr = %config.management_addr, "Management surface listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    match pipeline {
        Pipeline::Split(lifecycle) => lifecycle.stop().await,
        Pipeline::Direct(mut handle) => {
            handle.poison();
            if !handle.join_timeout(config.join_timeout()).await {
                tracing::error!("Connector did not stop in time");
            }
        }
    }

    tracing::info!("Live feed service stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "Failed to install Ctrl-C handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
