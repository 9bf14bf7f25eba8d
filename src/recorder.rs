use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::common::{BuildError, HistogramSummary, Snapshot};
use crate::formatting::{key_to_parts, write_plaintext_line};

use metrics::{Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit};
use metrics_util::registry::{GenerationalAtomicStorage, Recency, Registry};

pub(crate) struct Inner {
    pub prefix: Option<String>,
    pub registry: Registry<Key, GenerationalAtomicStorage>,
    pub recency: Recency<Key>,
    pub system_claimed: AtomicBool,
}

impl Inner {
    fn snapshot(&self) -> Snapshot {
        let mut counters = HashMap::new();
        let counter_handles = self.registry.get_counter_handles();
        for (key, counter) in counter_handles {
            let gen = counter.get_generation();
            if !self.recency.should_store_counter(&key, gen, &self.registry) {
                continue;
            }
            let (name, tags) = key_to_parts(&key);
            // Graphite series are continuous, so counters stay cumulative
            // rather than being reset on read.
            let value = counter.get_inner().load(Ordering::Acquire);
            counters
                .entry(name)
                .or_insert_with(HashMap::new)
                .insert(tags, value);
        }

        let mut gauges = HashMap::new();
        let gauge_handles = self.registry.get_gauge_handles();
        for (key, gauge) in gauge_handles {
            let gen = gauge.get_generation();
            if !self.recency.should_store_gauge(&key, gen, &self.registry) {
                continue;
            }
            let (name, tags) = key_to_parts(&key);
            let value = f64::from_bits(gauge.get_inner().load(Ordering::Acquire));
            gauges
                .entry(name)
                .or_insert_with(HashMap::new)
                .insert(tags, value);
        }

        let mut histograms = HashMap::new();
        let histogram_handles = self.registry.get_histogram_handles();
        for (key, histogram) in histogram_handles {
            let gen = histogram.get_generation();
            if !self
                .recency
                .should_store_histogram(&key, gen, &self.registry)
            {
                continue;
            }

            let (name, tags) = key_to_parts(&key);
            let mut summary = HistogramSummary::default();
            histogram.get_inner().clear_with(|samples| {
                for sample in samples {
                    summary.record(*sample);
                }
            });
            if summary.count() == 0 {
                continue;
            }
            histograms
                .entry(name)
                .or_insert_with(HashMap::new)
                .insert(tags, summary);
        }

        Snapshot {
            counters,
            gauges,
            histograms,
        }
    }

    fn render(&self, timestamp: u64) -> String {
        let Snapshot {
            mut counters,
            mut gauges,
            mut histograms,
        } = self.snapshot();

        let prefix = self.prefix.as_deref();
        let mut output = String::new();

        for (name, mut by_tags) in counters.drain() {
            for (tags, value) in by_tags.drain() {
                write_plaintext_line(&mut output, prefix, &name, None, &tags, value, timestamp);
            }
        }

        for (name, mut by_tags) in gauges.drain() {
            for (tags, value) in by_tags.drain() {
                write_plaintext_line(&mut output, prefix, &name, None, &tags, value, timestamp);
            }
        }

        for (name, mut by_tags) in histograms.drain() {
            for (tags, summary) in by_tags.drain() {
                write_plaintext_line(
                    &mut output,
                    prefix,
                    &name,
                    Some("count"),
                    &tags,
                    summary.count(),
                    timestamp,
                );
                write_plaintext_line(
                    &mut output,
                    prefix,
                    &name,
                    Some("min"),
                    &tags,
                    summary.min(),
                    timestamp,
                );
                write_plaintext_line(
                    &mut output,
                    prefix,
                    &name,
                    Some("max"),
                    &tags,
                    summary.max(),
                    timestamp,
                );
                write_plaintext_line(
                    &mut output,
                    prefix,
                    &name,
                    Some("mean"),
                    &tags,
                    summary.mean(),
                    timestamp,
                );
                write_plaintext_line(
                    &mut output,
                    prefix,
                    &name,
                    Some("sum"),
                    &tags,
                    summary.sum(),
                    timestamp,
                );
            }
        }

        output
    }
}

pub struct GraphiteRecorder {
    inner: Arc<Inner>,
}

impl GraphiteRecorder {
    pub fn handle(&self) -> GraphiteHandle {
        GraphiteHandle {
            inner: self.inner.clone(),
        }
    }

    /// Claims the single system metric set slot on this recorder.
    ///
    /// The registry itself resolves name collisions by handing back the
    /// existing handle, so bulk registration guards against double
    /// instrumentation here instead.
    pub(crate) fn claim_system_set(&self) -> Result<(), BuildError> {
        if self.inner.system_claimed.swap(true, Ordering::AcqRel) {
            Err(BuildError::DuplicateMetricSet)
        } else {
            Ok(())
        }
    }
}

impl From<Inner> for GraphiteRecorder {
    fn from(inner: Inner) -> Self {
        GraphiteRecorder {
            inner: Arc::new(inner),
        }
    }
}

impl Recorder for GraphiteRecorder {
    fn describe_counter(&self, _k: KeyName, _u: Option<Unit>, _d: SharedString) {}
    fn describe_gauge(&self, _k: KeyName, _u: Option<Unit>, _d: SharedString) {}
    fn describe_histogram(&self, _k: KeyName, _u: Option<Unit>, _d: SharedString) {}

    fn register_counter(&self, key: &Key, _metadata: &Metadata<'_>) -> Counter {
        self.inner
            .registry
            .get_or_create_counter(key, |c| c.clone().into())
    }

    fn register_gauge(&self, key: &Key, _metadata: &Metadata<'_>) -> Gauge {
        self.inner
            .registry
            .get_or_create_gauge(key, |c| c.clone().into())
    }

    fn register_histogram(&self, key: &Key, _metadata: &Metadata<'_>) -> Histogram {
        self.inner
            .registry
            .get_or_create_histogram(key, |c| c.clone().into())
    }
}

/// Handle for accessing metrics stored via [`GraphiteRecorder`].
///
/// The periodic flush task renders through a handle, but a handle can also be
/// used directly when the host process wants to drive delivery itself.
#[derive(Clone)]
pub struct GraphiteHandle {
    inner: Arc<Inner>,
}

impl GraphiteHandle {
    /// Takes a snapshot of the metrics held by the recorder and renders them
    /// as Graphite plaintext lines stamped with the current unix time.
    pub fn render(&self) -> String {
        self.inner.render(unix_timestamp())
    }

    /// Renders a snapshot with an explicit unix timestamp.
    pub fn render_at(&self, timestamp: u64) -> String {
        self.inner.render(timestamp)
    }
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::{GraphiteRecorder, Inner};
    use metrics::{Key, Label, Level, Metadata, Recorder};
    use metrics_util::registry::{GenerationalStorage, Recency, Registry};
    use metrics_util::MetricKindMask;
    use quanta::Clock;
    use std::sync::atomic::AtomicBool;

    static METADATA: Metadata = Metadata::new(module_path!(), Level::INFO, Some(module_path!()));

    fn recorder_with_prefix(prefix: Option<&str>) -> GraphiteRecorder {
        GraphiteRecorder::from(Inner {
            prefix: prefix.map(ToOwned::to_owned),
            registry: Registry::new(GenerationalStorage::atomic()),
            recency: Recency::new(Clock::new(), MetricKindMask::NONE, None),
            system_claimed: AtomicBool::new(false),
        })
    }

    #[test]
    fn gauge_renders_with_namespace_prefix() {
        let recorder = recorder_with_prefix(Some("svc.billing_api.host01_internal"));

        let key = Key::from_name("queue.depth");
        let gauge = recorder.register_gauge(&key, &METADATA);
        gauge.set(42.0);

        let rendered = recorder.handle().render_at(1_700_000_000);
        assert_eq!(
            rendered,
            "svc.billing_api.host01_internal.queue.depth 42 1700000000\n"
        );
    }

    #[test]
    fn counters_are_cumulative_across_renders() {
        let recorder = recorder_with_prefix(None);

        let key = Key::from_name("requests.total");
        let counter = recorder.register_counter(&key, &METADATA);
        counter.increment(7);

        let handle = recorder.handle();
        assert_eq!(handle.render_at(10), "requests.total 7 10\n");

        counter.increment(3);
        assert_eq!(handle.render_at(20), "requests.total 10 20\n");
    }

    #[test]
    fn gauge_labels_render_as_tags() {
        let recorder = recorder_with_prefix(None);

        let labels = vec![Label::new("wutang", "forever")];
        let key = Key::from_parts("basic.gauge", labels);
        let gauge = recorder.register_gauge(&key, &METADATA);
        gauge.set(-3.44);

        let rendered = recorder.handle().render_at(1000);
        assert_eq!(rendered, "basic.gauge;wutang=forever -3.44 1000\n");
    }

    #[test]
    fn histogram_renders_interval_summary() {
        let recorder = recorder_with_prefix(None);

        let key = Key::from_name("basic.histogram");
        let histogram = recorder.register_histogram(&key, &METADATA);
        histogram.record(12.0);

        let rendered = recorder.handle().render_at(1000);
        let expected = concat!(
            "basic.histogram.count 1 1000\n",
            "basic.histogram.min 12 1000\n",
            "basic.histogram.max 12 1000\n",
            "basic.histogram.mean 12 1000\n",
            "basic.histogram.sum 12 1000\n",
        );
        assert_eq!(rendered, expected);

        // samples were drained on the first render
        assert_eq!(recorder.handle().render_at(2000), "");
    }

    #[test]
    fn zero_gauges_still_render() {
        let recorder = recorder_with_prefix(None);

        let key = Key::from_name("queue.depth");
        let _gauge = recorder.register_gauge(&key, &METADATA);

        assert_eq!(recorder.handle().render_at(5), "queue.depth 0 5\n");
    }
}
