
use autometrics::prometheus_exporter;
use lazy_static::lazy_static;
use prometheus::Encoder;
use prometheus::IntCounter;
use prometheus::IntCounterVec;
use prometheus::IntGauge;
use prometheus::IntGaugeVec;
use prometheus::Opts;
use prometheus::Registry;
use tokio::sync::watch;
use tracing::error;
use tracing::info;
use tracing::warn;
use warp::Filter;
use warp::Rejection;
use warp::Reply;

lazy_static! {
    pub static ref OWNED_PARTITIONS_METRIC: IntGaugeVec = IntGaugeVec::new(
        Opts::new("owned_partitions", "Partitions owned by this instance"),
        &["role", "scope"]
    )
    .expect("metric can not be created");

    pub static ref RING_MEMBERS_METRIC: IntGaugeVec = IntGaugeVec::new(
        Opts::new("ring_members", "Instances placed on a hash ring"),
        &["role", "scope"]
    )
    .expect("metric can not be created");

    pub static ref RECALCULATIONS_METRIC: IntCounter =
        IntCounter::new("partition_recalculations", "Completed partition recalculations")
            .expect("metric can not be created");

    pub static ref MEMBERSHIP_EVENTS_METRIC: IntCounterVec = IntCounterVec::new(
        Opts::new("membership_events", "Peer additions, updates and removals"),
        &["kind"]
    )
    .expect("metric can not be created");

    pub static ref REGISTRY_RECONNECT_METRIC: IntCounterVec = IntCounterVec::new(
        Opts::new("registry_reconnect_attempts", "Registry reconnection attempts"),
        &["outcome"]
    )
    .expect("metric can not be created");

    /// Numeric form of the discovery state machine
    pub static ref DISCOVERY_STATE_METRIC: IntGauge =
        IntGauge::new("discovery_state", "Current discovery state")
            .expect("metric can not be created");

    pub static ref REGISTRY: Registry = Registry::new();
}

pub(crate) fn register_custom_metrics(registry: &Registry) {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(OWNED_PARTITIONS_METRIC.clone()),
        Box::new(RING_MEMBERS_METRIC.clone()),
        Box::new(RECALCULATIONS_METRIC.clone()),
        Box::new(MEMBERSHIP_EVENTS_METRIC.clone()),
        Box::new(REGISTRY_RECONNECT_METRIC.clone()),
        Box::new(DISCOVERY_STATE_METRIC.clone()),
    ];
    for collector in collectors {
        if let Err(e) = registry.register(collector) {
            warn!("collector can not be registered: {}", e);
        }
    }
}

pub async fn start_server(
    port: u16,
    mut shutdown_signal: watch::Receiver<()>,
) {
    register_custom_metrics(&REGISTRY);

    let metrics_route = warp::path!("metrics")
        .map(|| REGISTRY.clone())
        .and_then(metrics_handler);

    let (addr, server) = warp::serve(metrics_route).bind_with_graceful_shutdown(([0, 0, 0, 0], port), async move {
        let _ = shutdown_signal.changed().await;
    });
    info!("metrics server listening on {}", addr);
    server.await;
}

async fn metrics_handler(registry: Registry) -> Result<impl Reply, Rejection> {
    let encoder = prometheus::TextEncoder::new();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
        error!("could not encode custom metrics: {}", e);
    }
    let mut res = String::from_utf8(buffer).unwrap_or_else(|e| {
        error!("custom metrics could not be from_utf8'd: {}", e);
        String::default()
    });

    res.push_str(&get_metrics_body());
    Ok(res)
}

/// Autometrics output for Prometheus to scrape
pub fn get_metrics_body() -> String {
    prometheus_exporter::encode_http_response().into_body()
}
