//! Logging and OpenTelemetry export for KubeVirt components
//!
//! Log output is JSON. Its level follows the component's KubeVirt log
//! verbosity, a klog-style number that the cluster configuration can change
//! at runtime. Setting `RUST_LOG` pins the filter and disables that.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::{runtime, Resource};
use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};
use thiserror::Error;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

use crate::config::{VirtComponent, DEFAULT_LOG_VERBOSITY};

/// Errors that can occur during telemetry initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// OTLP exporter could not be built
    #[error("failed to initialize {signal} exporter: {message}")]
    Exporter {
        /// "trace" or "metrics"
        signal: &'static str,
        /// Exporter error
        message: String,
    },

    /// A global subscriber is already installed
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),

    /// The log filter could not be swapped
    #[error("failed to reload log filter: {0}")]
    Reload(String),
}

/// Telemetry settings for one component process
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name on traces, metrics and the resource
    pub service_name: String,
    /// OTLP collector endpoint; export is off when unset
    pub otlp_endpoint: Option<String>,
    /// Verbosity until the cluster configuration is read
    pub verbosity: u32,
}

impl TelemetryConfig {
    /// Settings for `component`, taking the endpoint from `OTEL_EXPORTER_OTLP_ENDPOINT`
    pub fn for_component(component: VirtComponent) -> Self {
        Self {
            service_name: component.as_str().to_string(),
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
            verbosity: DEFAULT_LOG_VERBOSITY,
        }
    }
}

/// Level for our own crates at a klog verbosity
fn level_for(verbosity: u32) -> &'static str {
    match verbosity {
        0 | 1 => "warn",
        2 => "info",
        3 | 4 => "debug",
        _ => "trace",
    }
}

/// Filter directives for a KubeVirt log verbosity
///
/// 2 is the KubeVirt default and logs at info. Client request logging from
/// kube starts at 6, matching where klog starts printing API calls.
pub fn verbosity_filter(verbosity: u32) -> String {
    let ours = level_for(verbosity);
    let kube = if verbosity >= 6 { "debug" } else { "info" };
    format!("warn,kubevirt={ours},virt_controller={ours},kube={kube},tower=warn,hyper=warn")
}

/// Handle for changing the log level after startup
#[derive(Clone)]
pub struct LogHandle {
    reload: Option<reload::Handle<EnvFilter, Registry>>,
    verbosity: Arc<AtomicU32>,
}

impl std::fmt::Debug for LogHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogHandle")
            .field("reloadable", &self.reload.is_some())
            .field("verbosity", &self.verbosity())
            .finish()
    }
}

impl LogHandle {
    /// A handle that only remembers the verbosity
    ///
    /// Used when `RUST_LOG` pins the filter or no subscriber was installed.
    pub fn fixed(verbosity: u32) -> Self {
        Self {
            reload: None,
            verbosity: Arc::new(AtomicU32::new(verbosity)),
        }
    }

    /// Verbosity currently applied
    pub fn verbosity(&self) -> u32 {
        self.verbosity.load(Ordering::Relaxed)
    }

    /// Apply a new verbosity, returning whether it changed
    pub fn set_verbosity(&self, verbosity: u32) -> Result<bool, TelemetryError> {
        let previous = self.verbosity.swap(verbosity, Ordering::Relaxed);
        if previous == verbosity {
            return Ok(false);
        }
        if let Some(reload) = &self.reload {
            reload
                .reload(EnvFilter::new(verbosity_filter(verbosity)))
                .map_err(|e| TelemetryError::Reload(e.to_string()))?;
            info!(from = previous, to = verbosity, "Log verbosity changed");
        }
        Ok(true)
    }
}

/// Install the global subscriber and, with an endpoint, the OTLP exporters
pub fn init_telemetry(config: TelemetryConfig) -> Result<LogHandle, TelemetryError> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let resource = build_resource(&config.service_name);

    // Option<Layer> implements Layer
    let otel_layer = match &config.otlp_endpoint {
        Some(endpoint) => {
            let provider = init_otlp(endpoint, resource)?;
            let tracer = provider.tracer(config.service_name.clone());
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    let pinned = EnvFilter::try_from_default_env().ok();
    let reloadable = pinned.is_none();
    let filter = pinned.unwrap_or_else(|| EnvFilter::new(verbosity_filter(config.verbosity)));
    let (filter, reload) = reload::Layer::new(filter);

    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(false)
        .with_target(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()
        .map_err(|e| TelemetryError::SubscriberInit(e.to_string()))?;

    Ok(LogHandle {
        reload: reloadable.then_some(reload),
        verbosity: Arc::new(AtomicU32::new(config.verbosity)),
    })
}

/// Resource naming the service and, via the downward API, its pod and node
fn build_resource(service_name: &str) -> Resource {
    let mut attributes = vec![
        KeyValue::new(SERVICE_NAME, service_name.to_string()),
        KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
    ];
    for (env, key) in [
        ("POD_NAME", "k8s.pod.name"),
        ("POD_NAMESPACE", "k8s.namespace.name"),
        ("NODE_NAME", "k8s.node.name"),
    ] {
        if let Ok(value) = std::env::var(env) {
            attributes.push(KeyValue::new(key, value));
        }
    }
    Resource::new(attributes)
}

fn exporter_error<E: std::fmt::Display>(signal: &'static str) -> impl Fn(E) -> TelemetryError {
    move |e| TelemetryError::Exporter {
        signal,
        message: e.to_string(),
    }
}

/// Set up trace and metric export to one collector
fn init_otlp(endpoint: &str, resource: Resource) -> Result<TracerProvider, TelemetryError> {
    let metrics = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(exporter_error("metrics"))?;
    global::set_meter_provider(
        SdkMeterProvider::builder()
            .with_reader(PeriodicReader::builder(metrics, runtime::Tokio).build())
            .with_resource(resource.clone())
            .build(),
    );

    let spans = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(exporter_error("trace"))?;
    let provider = TracerProvider::builder()
        .with_batch_exporter(spans, runtime::Tokio)
        .with_resource(resource)
        .build();
    global::set_tracer_provider(provider.clone());

    Ok(provider)
}
