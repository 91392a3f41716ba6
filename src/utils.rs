use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Initializes tracing output that cooperates with the progress bars drawn
/// during convergence. Call once, before the first run.
pub fn init_logging() -> anyhow::Result<()> {
    let indicatif_layer = tracing_indicatif::IndicatifLayer::new();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(indicatif_layer.get_stderr_writer()))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(indicatif_layer)
        .try_init()?;

    Ok(())
}
