//! Operational metrics for the moderation pipeline.
//!
//! Everything is fire-and-forget: a metric that cannot be sent is logged and
//! dropped, never surfaced to the caller.

use async_trait::async_trait;
use cadence::{
    BufferedUdpMetricSink, Counted, CountedExt, Gauged, Metric, MetricBuilder, QueuingMetricSink,
    StatsdClient, Timed,
};
use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::MetricsConfig;

/// Metric names emitted by the pipeline.
pub mod names {
    pub const EVENTS_PROCESSED: &str = "events.processed";
    pub const EVENTS_REPLAYED: &str = "events.replayed";
    pub const EVENTS_DROPPED: &str = "events.dropped";
    pub const RECORDS_MALFORMED: &str = "records.malformed";
    pub const RULE_FAILURES: &str = "rules.failed";
    pub const ACCOUNT_LOOKUP_DEGRADED: &str = "account.degraded";
    pub const EFFECTS_APPLIED: &str = "effects.applied";
    pub const EFFECTS_FAILED: &str = "effects.failed";
    pub const EVALUATION_DURATION: &str = "evaluation.duration_ms";
    pub const CURSOR_WRITES: &str = "cursor.writes";
    pub const CURSOR_POSITION: &str = "cursor.position";
}

/// Counter, gauge and timing sink shared by every pipeline component.
#[async_trait]
pub trait MetricsPublisher: Send + Sync {
    async fn incr(&self, key: &str) {
        self.incr_with_tags(key, &[]).await;
    }

    async fn incr_with_tags(&self, key: &str, tags: &[(&str, &str)]);

    async fn count(&self, key: &str, value: u64);

    async fn gauge(&self, key: &str, value: u64);

    async fn time_with_tags(&self, key: &str, millis: u64, tags: &[(&str, &str)]);
}

pub type SharedMetricsPublisher = Arc<dyn MetricsPublisher>;

#[derive(Debug, Clone, Default)]
pub struct NoOpMetricsPublisher;

impl NoOpMetricsPublisher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MetricsPublisher for NoOpMetricsPublisher {
    async fn incr_with_tags(&self, _key: &str, _tags: &[(&str, &str)]) {}
    async fn count(&self, _key: &str, _value: u64) {}
    async fn gauge(&self, _key: &str, _value: u64) {}
    async fn time_with_tags(&self, _key: &str, _millis: u64, _tags: &[(&str, &str)]) {}
}

/// Publishes to a statsd agent over UDP through a queuing cadence sink.
pub struct StatsdMetricsPublisher {
    client: StatsdClient,
    default_tags: Vec<(String, String)>,
}

impl StatsdMetricsPublisher {
    pub fn new(
        host: &str,
        prefix: &str,
        bind_addr: &str,
        default_tags: Vec<(String, String)>,
    ) -> Result<Self, MetricsError> {
        info!(
            host = %host,
            prefix = %prefix,
            bind = %bind_addr,
            tags = ?default_tags,
            "Creating statsd metrics publisher"
        );

        let socket = UdpSocket::bind(bind_addr)
            .and_then(|socket| socket.set_nonblocking(true).map(|()| socket))
            .map_err(|e| MetricsError::CreationFailed(format!("bind {}: {}", bind_addr, e)))?;
        let sink = BufferedUdpMetricSink::from(host, socket)
            .map_err(|e| MetricsError::CreationFailed(format!("sink {}: {}", host, e)))?;
        let queuing = QueuingMetricSink::builder()
            .with_error_handler(|error| warn!(error = %error, "Dropped metric"))
            .build(sink);

        Ok(Self {
            client: StatsdClient::from_sink(prefix, queuing),
            default_tags,
        })
    }

    fn send<'a, M>(&'a self, mut builder: MetricBuilder<'a, 'a, M>, tags: &'a [(&'a str, &'a str)])
    where
        M: Metric + From<String>,
    {
        for (k, v) in &self.default_tags {
            builder = builder.with_tag(k.as_str(), v.as_str());
        }
        for (k, v) in tags {
            builder = builder.with_tag(k, v);
        }
        if let Err(err) = builder.try_send() {
            warn!(error = %err, "Failed to send metric");
        }
    }
}

#[async_trait]
impl MetricsPublisher for StatsdMetricsPublisher {
    async fn incr_with_tags(&self, key: &str, tags: &[(&str, &str)]) {
        self.send(self.client.incr_with_tags(key), tags);
    }

    async fn count(&self, key: &str, value: u64) {
        self.send(self.client.count_with_tags(key, value), &[]);
    }

    async fn gauge(&self, key: &str, value: u64) {
        self.send(self.client.gauge_with_tags(key, value), &[]);
    }

    async fn time_with_tags(&self, key: &str, millis: u64, tags: &[(&str, &str)]) {
        self.send(self.client.time_with_tags(key, millis), tags);
    }
}

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("error-skywarden-metrics-1 Failed to create metrics publisher: {0}")]
    CreationFailed(String),

    #[error("error-skywarden-metrics-2 Invalid metrics configuration: {0}")]
    InvalidConfig(String),
}

/// Builds the publisher selected by `METRICS_ADAPTER`.
pub fn create_metrics_publisher(
    config: &MetricsConfig,
) -> Result<SharedMetricsPublisher, MetricsError> {
    match config.adapter.as_str() {
        "noop" | "" => Ok(Arc::new(NoOpMetricsPublisher::new())),
        "statsd" => {
            let host = config.statsd_host.as_deref().ok_or_else(|| {
                MetricsError::InvalidConfig(
                    "METRICS_STATSD_HOST is required for the statsd adapter".to_string(),
                )
            })?;
            let tags = config.tags.as_deref().map(parse_tags).unwrap_or_default();
            Ok(Arc::new(StatsdMetricsPublisher::new(
                host,
                &config.prefix,
                &config.statsd_bind,
                tags,
            )?))
        }
        other => Err(MetricsError::InvalidConfig(format!(
            "unknown metrics adapter {:?}",
            other
        ))),
    }
}

/// Parses comma-separated `key:value` pairs, skipping malformed entries.
fn parse_tags(tags: &str) -> Vec<(String, String)> {
    tags.split(',')
        .filter_map(|tag| match tag.trim().split_once(':') {
            Some((k, v)) if !k.is_empty() && !v.is_empty() => Some((k.to_string(), v.to_string())),
            _ => {
                warn!(tag = %tag, "Ignoring malformed metrics tag");
                None
            }
        })
        .collect()
}

/// Times one event evaluation.
pub struct MetricTimer {
    start: Instant,
    metric: &'static str,
    publisher: SharedMetricsPublisher,
}

impl MetricTimer {
    pub fn new(metric: &'static str, publisher: SharedMetricsPublisher) -> Self {
        Self {
            start: Instant::now(),
            metric,
            publisher,
        }
    }

    /// Records the elapsed time tagged with the event kind.
    pub async fn record(self, kind: &str) {
        let elapsed = self.start.elapsed().as_millis() as u64;
        self.publisher
            .time_with_tags(self.metric, elapsed, &[("kind", kind)])
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics_config(adapter: &str, host: Option<&str>) -> MetricsConfig {
        MetricsConfig {
            adapter: adapter.to_string(),
            statsd_host: host.map(str::to_string),
            statsd_bind: "127.0.0.1:0".to_string(),
            prefix: "skywarden".to_string(),
            tags: Some("env:test".to_string()),
        }
    }

    #[test]
    fn test_parse_tags_skips_malformed() {
        assert_eq!(
            parse_tags("env:prod, region:us ,broken,:x"),
            vec![
                ("env".to_string(), "prod".to_string()),
                ("region".to_string(), "us".to_string())
            ]
        );
    }

    #[test]
    fn test_adapter_selection() {
        assert!(create_metrics_publisher(&metrics_config("noop", None)).is_ok());
        assert!(matches!(
            create_metrics_publisher(&metrics_config("statsd", None)),
            Err(MetricsError::InvalidConfig(_))
        ));
        assert!(matches!(
            create_metrics_publisher(&metrics_config("prometheus", None)),
            Err(MetricsError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_statsd_publisher_never_fails_callers() {
        let publisher =
            create_metrics_publisher(&metrics_config("statsd", Some("127.0.0.1:8125"))).unwrap();
        publisher.incr(names::EVENTS_PROCESSED).await;
        publisher
            .incr_with_tags(names::RULE_FAILURES, &[("rule", "too-many-hashtags")])
            .await;
        publisher.gauge(names::CURSOR_POSITION, 100).await;
        MetricTimer::new(names::EVALUATION_DURATION, publisher)
            .record("record-create")
            .await;
    }
}
