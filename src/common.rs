use std::collections::HashMap;

use thiserror::Error;

/// Errors that could occur while building or installing the recorder/reporter.
#[derive(Debug, Error)]
pub enum BuildError {
    /// The local hostname could not be resolved, so no namespace prefix can
    /// be computed.  This is fatal to startup: reporting without a prefix
    /// would collide with other hosts sharing the collector.
    #[error("failed to resolve the local hostname: {0}")]
    HostResolution(String),

    /// The collector endpoint did not resolve to a usable socket address.
    #[error("invalid collector endpoint: {0}")]
    InvalidEndpoint(String),

    /// The flush interval must be greater than zero.
    #[error("flush interval must be greater than zero")]
    InvalidFlushInterval,

    /// The system metric set was registered twice on the same recorder.
    #[error("system metrics are already registered with this recorder")]
    DuplicateMetricSet,

    /// No collector endpoint was configured before building the exporter.
    #[error("no collector endpoint was configured")]
    MissingExporterConfiguration,

    /// Failed to spin up the background Tokio runtime for the flush task.
    #[error("failed to create Tokio runtime: {0}")]
    FailedToCreateRuntime(String),

    /// Installing the recorder as the global recorder failed, usually
    /// because another recorder was installed first.
    #[error("failed to install the global recorder: {0}")]
    FailedToSetGlobalRecorder(String),

    /// The reporter was started twice, or started after it was stopped.
    /// Restart is not supported; build a new reporter instead.
    #[error("reporter has already been started")]
    ReporterAlreadyStarted,
}

/// Running aggregate of the histogram samples drained on one flush tick.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub(crate) struct HistogramSummary {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl HistogramSummary {
    pub fn record(&mut self, sample: f64) {
        if self.count == 0 {
            self.min = sample;
            self.max = sample;
        } else {
            self.min = self.min.min(sample);
            self.max = self.max.max(sample);
        }
        self.count += 1;
        self.sum += sample;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

pub(crate) struct Snapshot {
    pub counters: HashMap<String, HashMap<Vec<String>, u64>>,
    pub gauges: HashMap<String, HashMap<Vec<String>, f64>>,
    pub histograms: HashMap<String, HashMap<Vec<String>, HistogramSummary>>,
}

#[cfg(test)]
mod tests {
    use super::HistogramSummary;

    #[test]
    fn summary_tracks_extremes_and_mean() {
        let mut summary = HistogramSummary::default();
        summary.record(12.0);
        summary.record(2.0);
        summary.record(7.0);

        assert_eq!(summary.count(), 3);
        assert_eq!(summary.min(), 2.0);
        assert_eq!(summary.max(), 12.0);
        assert_eq!(summary.sum(), 21.0);
        assert_eq!(summary.mean(), 7.0);
    }

    #[test]
    fn empty_summary_has_zero_mean() {
        let summary = HistogramSummary::default();
        assert_eq!(summary.count(), 0);
        assert_eq!(summary.mean(), 0.0);
    }
}
