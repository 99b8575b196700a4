use std::future::Future;

use clap::Parser;
use once_cell::sync::Lazy;
use prometheus::Registry;
use streamscope::engine::Streamscope;
use streamscope::settings::{CliOptions, Settings};
use streamscope::{logging, Result};

static METRICS_REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("streamscope".to_string()), None).expect("failed to create prometheus registry")
});

fn main() -> Result<()> {
    let subscriber = logging::get_subscriber("streamscope", "info", std::io::stdout);
    logging::init_subscriber(subscriber);

    let main_span = tracing::trace_span!("main");
    let _main_span_guard = main_span.enter();

    let options = CliOptions::parse();
    let settings = Settings::load(&options)?;
    tracing::info!(?settings, "settings loaded");

    start_engine(async move {
        let engine = Streamscope::builder("streamscope")
            .with_metrics_registry(&METRICS_REGISTRY)
            .finish(&settings)
            .await?
            .run()?;

        tracing::info!("streamscope engine fully running...");
        engine.block_for_completion().await?;
        tracing::info!("streamscope engine stopped.");
        Ok(())
    })
}

#[tracing::instrument(level = "trace", skip(future), fields(worker_threads=num_cpus::get()))]
fn start_engine<F>(future: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    let worker_threads = num_cpus::get();
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?
        .block_on(future)
}
