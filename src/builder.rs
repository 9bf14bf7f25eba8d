use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use metrics_util::registry::{GenerationalStorage, Recency, Registry};
use metrics_util::MetricKindMask;

use quanta::Clock;
use tracing::info;

use crate::common::BuildError;
use crate::formatting::graphite_prefix;
use crate::recorder::{GraphiteRecorder, Inner};
use crate::reporter::GraphiteReporter;
use crate::system::SystemMetrics;

#[derive(Clone)]
enum ExporterConfig {
    Collector {
        endpoint: SocketAddr,
        interval: Duration,
    },

    Unconfigured,
}

/// Builder for creating and installing a Graphite recorder/reporter.
pub struct GraphiteBuilder {
    exporter_config: ExporterConfig,
    app_prefix: Option<String>,
    app_name: Option<String>,
    collect_system_metrics: bool,
    idle_timeout: Option<Duration>,
    recency_mask: MetricKindMask,
    max_packet_size: usize,
}

impl GraphiteBuilder {
    /// Creates a new [`GraphiteBuilder`].
    pub fn new() -> Self {
        Self {
            exporter_config: ExporterConfig::Unconfigured,
            app_prefix: None,
            app_name: None,
            collect_system_metrics: false,
            idle_timeout: None,
            recency_mask: MetricKindMask::NONE,
            max_packet_size: 1432,
        }
    }

    /// Configures the carbon collector endpoint and the flush interval.
    ///
    /// UDP is connectionless, so nothing is verified about reachability
    /// here; an unreachable collector only surfaces as logged flush errors.
    ///
    /// ## Errors
    ///
    /// If the endpoint cannot be resolved to a socket address, resolves to a
    /// reserved port, or the interval is zero, an error variant is returned
    /// describing the problem.
    pub fn with_collector<T>(mut self, endpoint: T, interval: Duration) -> Result<Self, BuildError>
    where
        T: ToSocketAddrs,
    {
        if interval.is_zero() {
            return Err(BuildError::InvalidFlushInterval);
        }

        let endpoint = endpoint
            .to_socket_addrs()
            .map_err(|e| BuildError::InvalidEndpoint(e.to_string()))?
            .next() // just use the first address we resolve to
            .ok_or_else(|| {
                BuildError::InvalidEndpoint("resolved to no addresses".to_string())
            })?;

        if endpoint.port() == 0 {
            return Err(BuildError::InvalidEndpoint("port must be non-zero".to_string()));
        }

        self.exporter_config = ExporterConfig::Collector { endpoint, interval };

        Ok(self)
    }

    /// Namespaces every emitted metric under `<app_prefix><app_name>.<host>`.
    ///
    /// Multiple instances of one application reporting to a shared collector
    /// are disambiguated by suffixing the local hostname; dots inside the
    /// application name and hostname are collapsed to underscores so they do
    /// not introduce extra hierarchy levels.  The hostname is resolved once,
    /// when the recorder is built, and building fails if it cannot be.
    #[must_use]
    pub fn set_application<P, N>(mut self, app_prefix: P, app_name: N) -> Self
    where
        P: Into<String>,
        N: Into<String>,
    {
        self.app_prefix = Some(app_prefix.into());
        self.app_name = Some(app_name.into());
        self
    }

    /// Registers the process-health metric set and refreshes it every tick.
    ///
    /// See [`SystemMetrics`] for the groups this adds.
    #[must_use]
    pub fn with_system_metrics(mut self) -> Self {
        self.collect_system_metrics = true;
        self
    }

    /// Sets the idle timeout for metrics.
    ///
    /// If a metric has not been updated within this timeout, it is dropped
    /// from flushes until it is next written to.  The metric kind mask
    /// selects which kinds the timeout applies to.
    #[must_use]
    pub fn idle_timeout(mut self, mask: MetricKindMask, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self.recency_mask = if self.idle_timeout.is_none() {
            MetricKindMask::NONE
        } else {
            mask
        };
        self
    }

    /// Sets the maximum size of datagrams going out to the collector.
    ///
    /// Defaults to 1432 bytes.
    #[must_use]
    pub fn set_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    /// Builds the recorder and reporter, installs the recorder globally, and
    /// starts the reporter.
    ///
    /// The returned [`GraphiteReporter`] is the running reporter: keep it
    /// alive for the lifetime of the process and call
    /// [`stop`](GraphiteReporter::stop) during orderly shutdown (dropping it
    /// stops it as well).
    ///
    /// ## Errors
    ///
    /// If there is an error while building the recorder and reporter, or
    /// installing the recorder, an error variant is returned describing it.
    pub fn install(self) -> Result<GraphiteReporter, BuildError> {
        let (recorder, mut reporter) = self.build()?;
        metrics::set_global_recorder(recorder)
            .map_err(|e| BuildError::FailedToSetGlobalRecorder(e.to_string()))?;
        reporter.start()?;
        Ok(reporter)
    }

    /// Builds the recorder and the (unstarted) reporter and returns both.
    ///
    /// In most cases, users should prefer [`install`][GraphiteBuilder::install],
    /// which wires everything up automatically.  Building them separately
    /// allows combining recorders or deciding when the flush task starts.
    pub fn build(self) -> Result<(GraphiteRecorder, GraphiteReporter), BuildError> {
        let max_packet_size = self.max_packet_size;
        let collect_system_metrics = self.collect_system_metrics;
        let exporter_config = self.exporter_config.clone();

        let recorder = self.build_recorder()?;

        let (endpoint, interval) = match exporter_config {
            ExporterConfig::Unconfigured => return Err(BuildError::MissingExporterConfiguration),
            ExporterConfig::Collector { endpoint, interval } => (endpoint, interval),
        };

        let system = if collect_system_metrics {
            Some(SystemMetrics::register(&recorder)?)
        } else {
            None
        };

        let reporter = GraphiteReporter::new(
            recorder.handle(),
            endpoint,
            interval,
            system,
            max_packet_size,
        );

        Ok((recorder, reporter))
    }

    /// Builds the recorder and returns it.
    pub fn build_recorder(self) -> Result<GraphiteRecorder, BuildError> {
        self.build_with_clock(Clock::new())
    }

    pub(crate) fn build_with_clock(self, clock: Clock) -> Result<GraphiteRecorder, BuildError> {
        let prefix = match (&self.app_prefix, &self.app_name) {
            (None, None) => None,
            (app_prefix, app_name) => {
                let hostname = local_hostname()?;
                let prefix = graphite_prefix(
                    app_prefix.as_deref().unwrap_or(""),
                    app_name.as_deref().unwrap_or(""),
                    &hostname,
                );
                info!("metrics namespace prefix is {prefix}");
                Some(prefix)
            }
        };

        let inner = Inner {
            prefix,
            registry: Registry::new(GenerationalStorage::atomic()),
            recency: Recency::new(clock, self.recency_mask, self.idle_timeout),
            system_claimed: AtomicBool::new(false),
        };

        Ok(GraphiteRecorder::from(inner))
    }
}

impl Default for GraphiteBuilder {
    fn default() -> Self {
        GraphiteBuilder::new()
    }
}

fn local_hostname() -> Result<String, BuildError> {
    let raw = hostname::get().map_err(|e| BuildError::HostResolution(e.to_string()))?;
    raw.into_string()
        .map_err(|raw| BuildError::HostResolution(format!("hostname is not valid UTF-8: {raw:?}")))
}

#[cfg(test)]
mod tests {
    use super::GraphiteBuilder;
    use crate::common::BuildError;
    use metrics::{Key, Level, Metadata, Recorder};
    use std::time::Duration;

    static METADATA: Metadata = Metadata::new(module_path!(), Level::INFO, Some(module_path!()));

    #[test]
    fn rejects_unresolvable_endpoint() {
        let result =
            GraphiteBuilder::new().with_collector("not an address", Duration::from_secs(60));
        assert!(matches!(result, Err(BuildError::InvalidEndpoint(_))));
    }

    #[test]
    fn rejects_port_zero() {
        let result = GraphiteBuilder::new().with_collector("127.0.0.1:0", Duration::from_secs(60));
        assert!(matches!(result, Err(BuildError::InvalidEndpoint(_))));
    }

    #[test]
    fn rejects_zero_interval() {
        let result = GraphiteBuilder::new().with_collector("127.0.0.1:2003", Duration::ZERO);
        assert!(matches!(result, Err(BuildError::InvalidFlushInterval)));
    }

    #[test]
    fn build_requires_a_collector() {
        let result = GraphiteBuilder::new().build();
        assert!(matches!(
            result,
            Err(BuildError::MissingExporterConfiguration)
        ));
    }

    #[test]
    fn application_prefix_uses_sanitized_hostname() {
        let recorder = GraphiteBuilder::new()
            .set_application("svc.", "billing.api")
            .build_recorder()
            .unwrap();

        let host = hostname::get()
            .unwrap()
            .into_string()
            .unwrap()
            .replace('.', "_");

        let gauge = recorder.register_gauge(&Key::from_name("queue.depth"), &METADATA);
        gauge.set(42.0);

        let rendered = recorder.handle().render_at(1000);
        assert_eq!(rendered, format!("svc.billing_api.{host}.queue.depth 42 1000\n"));
    }

    #[test]
    fn recorder_without_application_has_no_prefix() {
        let recorder = GraphiteBuilder::new().build_recorder().unwrap();

        let gauge = recorder.register_gauge(&Key::from_name("queue.depth"), &METADATA);
        gauge.set(1.0);

        assert_eq!(recorder.handle().render_at(1000), "queue.depth 1 1000\n");
    }
}
