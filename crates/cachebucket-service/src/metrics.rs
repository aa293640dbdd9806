//! Statsd metrics.
//!
//! Nothing is reported until [`configure_statsd`] is called, until then [`metric!`] is a no-op.
//! Metrics are UDP datagrams, so nothing ever ends up on stdout.
use std::collections::BTreeMap;
use std::net::ToSocketAddrs;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use cadence::{Metric, MetricBuilder, StatsdClient, UdpMetricSink};

static METRICS_CLIENT: OnceLock<MetricsClient> = OnceLock::new();

/// The metrics prelude that is necessary to use the client.
pub mod prelude {
    pub use cadence::prelude::*;
}

#[derive(Debug)]
pub struct MetricsClient {
    statsd_client: StatsdClient,
    /// Tags sent with every metric.
    tags: BTreeMap<String, String>,
}

impl MetricsClient {
    pub fn statsd(&self) -> &StatsdClient {
        &self.statsd_client
    }

    /// Adds the global tags to `metric` and sends it.
    pub fn send_metric<'a, T>(&'a self, metric: MetricBuilder<'a, '_, T>)
    where
        T: Metric + From<String>,
    {
        self.tags
            .iter()
            .fold(metric, |metric, (tag, value)| metric.with_tag(tag, value))
            .send()
    }
}

/// Tell the metrics system to report to statsd at `host`.
///
/// Can only be called once per process.
pub fn configure_statsd<A: ToSocketAddrs>(
    prefix: &str,
    host: A,
    tags: BTreeMap<String, String>,
) -> Result<()> {
    let addrs: Vec<_> = host
        .to_socket_addrs()
        .context("failed to resolve statsd host")?
        .collect();
    if let Some(addr) = addrs.first() {
        tracing::info!("Reporting metrics to statsd at {}", addr);
    }

    let socket = std::net::UdpSocket::bind("0.0.0.0:0").context("failed to bind statsd socket")?;
    socket.set_nonblocking(true)?;
    let sink = UdpMetricSink::from(&addrs[..], socket).context("failed to create statsd sink")?;

    METRICS_CLIENT
        .set(MetricsClient {
            statsd_client: StatsdClient::from_sink(prefix, sink),
            tags,
        })
        .map_err(|_| anyhow::anyhow!("statsd metrics were already configured"))
}

/// Invokes `f` with the statsd client, if one is configured.
///
/// For the most part the [`metric!`](crate::metric) macro should be used instead.
#[inline(always)]
pub fn with_client<F, R>(f: F) -> R
where
    F: FnOnce(&MetricsClient) -> R,
    R: Default,
{
    METRICS_CLIENT.get().map(f).unwrap_or_default()
}

/// Emits a metric.
///
/// ```ignore
/// metric!(counter("uploads.store") += 1, "status" => "ok");
/// metric!(gauge("uploads.in_flight") = 3);
/// metric!(timer("uploads.duration") = start.elapsed());
/// ```
#[macro_export]
macro_rules! metric {
    (counter($id:expr) += $value:expr $(, $k:expr => $v:expr)* $(,)?) => {{
        use $crate::metrics::prelude::*;
        $crate::metrics::with_client(|client| {
            client.send_metric(
                client.statsd().count_with_tags($id, $value)
                    $(.with_tag($k, $v))*
            );
        })
    }};

    (gauge($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {{
        use $crate::metrics::prelude::*;
        $crate::metrics::with_client(|client| {
            client.send_metric(
                client.statsd().gauge_with_tags($id, $value)
                    $(.with_tag($k, $v))*
            );
        })
    }};

    (timer($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {{
        use $crate::metrics::prelude::*;
        $crate::metrics::with_client(|client| {
            client.send_metric(
                client.statsd().time_with_tags($id, $value)
                    $(.with_tag($k, $v))*
            );
        })
    }};
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_unconfigured_is_noop() {
        metric!(counter("test.counter") += 1, "tag" => "value");
        metric!(gauge("test.gauge") = 5u64);
        metric!(timer("test.timer") = std::time::Duration::from_millis(3));
        assert!(super::METRICS_CLIENT.get().is_none());
    }
}
