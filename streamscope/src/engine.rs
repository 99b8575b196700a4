pub mod http;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use prometheus::Registry;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::engine::http::{ApiError, ApiJoinHandle, ApiState, TxApiGracefulShutdown};
use crate::exporter::PrometheusMetricsExporter;
use crate::management::{
    rest, BeanSourceError, BeanSourceProvider, HttpWebClient, RestBeanSourceProvider, WebClient,
};
use crate::metrics;
use crate::settings::{HttpServerSettings, Settings};
use crate::tracker::{DomainTracker, TrackerContext, TrackerError};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to connect to management server: {0}")]
    Management(#[from] BeanSourceError),

    #[error("{0}")]
    Tracker(#[from] TrackerError),

    #[error("{0}")]
    Api(#[from] ApiError),

    #[error("failed to register streamscope metrics: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("streamscope task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("failed to listen for shutdown signal: {0}")]
    Signal(#[from] std::io::Error),
}

pub struct Streamscope;

impl Streamscope {
    pub fn builder(name: impl Into<String>) -> StreamscopeEngine<Building> {
        StreamscopeEngine::default().with_name(name)
    }
}

#[derive(Debug)]
pub struct StreamscopeEngine<S: EngineState> {
    pub inner: S,
}

impl Default for StreamscopeEngine<Building> {
    fn default() -> Self {
        Self { inner: Building::default() }
    }
}

/// Represents the engine's lifecycle state.
pub trait EngineState {}

#[derive(Default)]
pub struct Building {
    name: String,
    metrics_registry: Option<&'static Registry>,
    provider: Option<Arc<dyn BeanSourceProvider>>,
    web_client: Option<Arc<dyn WebClient>>,
}
impl EngineState for Building {}

impl fmt::Debug for Building {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Building")
            .field("name", &self.name)
            .field("metrics_registry", &self.metrics_registry)
            .field("provider", &self.provider)
            .field("web_client", &self.web_client)
            .finish()
    }
}

impl StreamscopeEngine<Building> {
    pub fn with_name(self, name: impl Into<String>) -> Self {
        Self { inner: Building { name: name.into(), ..self.inner } }
    }

    pub fn with_metrics_registry(self, registry: &'static Registry) -> Self {
        tracing::info!(?registry, "added metrics registry to streamscope engine.");
        Self {
            inner: Building { metrics_registry: Some(registry), ..self.inner },
        }
    }

    /// Replaces the REST management connection built from settings.
    pub fn with_bean_source_provider(self, provider: Arc<dyn BeanSourceProvider>) -> Self {
        Self { inner: Building { provider: Some(provider), ..self.inner } }
    }

    pub fn with_web_client(self, web_client: Arc<dyn WebClient>) -> Self {
        Self {
            inner: Building { web_client: Some(web_client), ..self.inner },
        }
    }

    /// Connects to the management server and runs the first domain initialization. A failure here
    /// is fatal.
    #[tracing::instrument(level = "info", skip(self, settings))]
    pub async fn finish(self, settings: &Settings) -> Result<StreamscopeEngine<Ready>, EngineError> {
        if let Some(registry) = self.inner.metrics_registry {
            metrics::register_metrics(registry)?;
        }

        let (provider, web_client) = match (self.inner.provider, self.inner.web_client) {
            (Some(provider), Some(web_client)) => (provider, web_client),
            (provider, web_client) => {
                let client = rest::make_http_client(&settings.management)?;
                let provider: Arc<dyn BeanSourceProvider> = match provider {
                    Some(p) => p,
                    None => Arc::new(RestBeanSourceProvider::from_settings(client.clone(), &settings.management)?),
                };
                let web_client: Arc<dyn WebClient> = match web_client {
                    Some(w) => w,
                    None => Arc::new(HttpWebClient::from_settings(client, &settings.management)),
                };
                (provider, web_client)
            },
        };

        let exporter = Arc::new(PrometheusMetricsExporter::new(
            settings.exporter.namespace.as_str(),
            Registry::new(),
        ));

        let context = TrackerContext::new(
            settings.management.domain.as_str(),
            settings.tracker.clone(),
            provider,
            web_client,
            exporter.clone(),
        );
        let tracker = DomainTracker::initialize(context).await?;

        Ok(StreamscopeEngine {
            inner: Ready {
                name: self.inner.name,
                tracker,
                exporter,
                metrics_registry: self.inner.metrics_registry,
                refresh_interval: settings.tracker.automatic_refresh(),
                http: settings.http.clone(),
            },
        })
    }
}

#[derive(Debug)]
pub struct Ready {
    name: String,
    tracker: Arc<DomainTracker>,
    exporter: Arc<PrometheusMetricsExporter>,
    metrics_registry: Option<&'static Registry>,
    refresh_interval: Option<Duration>,
    http: HttpServerSettings,
}
impl EngineState for Ready {}

impl StreamscopeEngine<Ready> {
    pub fn tracker(&self) -> &Arc<DomainTracker> {
        &self.inner.tracker
    }

    /// Starts the refresh scheduler and the read API.
    #[tracing::instrument(level = "info", skip(self), fields(name=%self.inner.name))]
    pub fn run(self) -> Result<StreamscopeEngine<Running>, EngineError> {
        let (tx_fatal, rx_fatal) = mpsc::unbounded_channel();
        let (tx_stop, rx_stop) = watch::channel(false);

        let scheduler = tokio::spawn(run_refresh_scheduler(
            self.inner.tracker.clone(),
            self.inner.refresh_interval,
            rx_stop,
            tx_fatal.clone(),
        ));

        let mut registries = vec![self.inner.exporter.registry().clone()];
        if let Some(registry) = self.inner.metrics_registry {
            registries.push(registry.clone());
        }

        let state = ApiState::new(self.inner.tracker.clone(), registries, tx_fatal);
        let (api_handle, tx_api_shutdown) = http::run_http_server(state, &self.inner.http)?;
        tracing::info!(refresh_interval=?self.inner.refresh_interval, "streamscope engine running");

        Ok(StreamscopeEngine {
            inner: Running {
                name: self.inner.name,
                tracker: self.inner.tracker,
                scheduler,
                tx_stop,
                rx_fatal,
                api_handle,
                tx_api_shutdown,
            },
        })
    }
}

#[derive(Debug)]
pub struct Running {
    name: String,
    tracker: Arc<DomainTracker>,
    scheduler: JoinHandle<()>,
    tx_stop: watch::Sender<bool>,
    rx_fatal: mpsc::UnboundedReceiver<TrackerError>,
    api_handle: ApiJoinHandle,
    tx_api_shutdown: TxApiGracefulShutdown,
}
impl EngineState for Running {}

impl StreamscopeEngine<Running> {
    /// Runs until ctrl-c or a fatal refresh failure, then stops scheduling, closes the trackers
    /// and stops the read API.
    #[tracing::instrument(level = "info", skip(self), fields(name=%self.inner.name))]
    pub async fn block_for_completion(self) -> Result<(), EngineError> {
        let Running {
            name,
            tracker,
            scheduler,
            tx_stop,
            mut rx_fatal,
            mut api_handle,
            tx_api_shutdown,
        } = self.inner;

        let mut api_finished = false;
        let outcome = tokio::select! {
            signal = tokio::signal::ctrl_c() => signal.map_err(EngineError::from),
            Some(error) = rx_fatal.recv() => Err(error.into()),
            api_result = &mut api_handle => {
                api_finished = true;
                match api_result {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(error)) => Err(error.into()),
                    Err(error) => Err(error.into()),
                }
            },
        };

        match &outcome {
            Ok(()) => tracing::info!(%name, "streamscope shutting down"),
            Err(error) => tracing::error!(%name, ?error, "streamscope stopping on failure"),
        }

        if tx_stop.send(true).is_err() {
            tracing::debug!("refresh scheduler already stopped");
        }
        scheduler.await?;
        tracker.close().await;

        if !api_finished {
            http::shutdown_http_server(tx_api_shutdown)?;
            api_handle.await??;
        }

        tracing::info!(%name, "streamscope stopped");
        outcome
    }
}

/// Drives `DomainTracker::refresh` on the configured interval until stopped. Without an interval
/// refreshes only happen on demand through the read API.
async fn run_refresh_scheduler(
    tracker: Arc<DomainTracker>, interval: Option<Duration>, mut rx_stop: watch::Receiver<bool>,
    tx_fatal: mpsc::UnboundedSender<TrackerError>,
) {
    let period = match interval {
        Some(period) => period,
        None => {
            tracing::info!("automatic refresh disabled; refreshing on demand only");
            rx_stop.changed().await.ok();
            return;
        },
    };

    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(error) = tracker.refresh().await {
                    tracing::error!(?error, "fatal failure during scheduled refresh");
                    if tx_fatal.send(error).is_err() {
                        tracing::warn!("engine no longer listening for fatal refresh failures");
                    }
                    break;
                }
            },

            _ = rx_stop.changed() => {
                tracing::info!("refresh scheduler stopping");
                break;
            },
        }
    }
}
