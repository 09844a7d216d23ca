use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use subpulse::queue::{Broker, ProgressListener, ResultListener};
use subpulse::{Config, JobStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "subpulse=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    info!(
        "Configuration loaded: broker={} progress_queue={} results_queue={}",
        config.broker.url, config.broker.progress_queue, config.broker.results_queue
    );

    let broker = Broker::new(&config.broker)?;
    let store = JobStore::new(&config.store)?;

    let progress = ProgressListener::new(broker.clone(), store.clone(), &config.worker);
    let results = ResultListener::new(broker, store, &config.worker);

    info!("Starting progress and result listeners");
    let progress_task = tokio::spawn(async move { progress.run().await });
    let results_task = tokio::spawn(async move { results.run().await });

    let (progress_exit, results_exit) = tokio::try_join!(progress_task, results_task)?;
    progress_exit?;
    results_exit?;

    Ok(())
}
