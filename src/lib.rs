//! A [`metrics`]-compatible exporter for pushing metrics to Graphite.
//!
//! ## Basics
//!
//! `metrics-exporter-graphite` is a [`metrics`]-compatible exporter that
//! periodically snapshots all registered metrics and pushes them to a carbon
//! collector as plaintext lines over UDP.
//!
//! ## High-level features
//!
//! - periodic push to a carbon collector via UDP, on a fixed flush interval
//! - per-host, per-application namespace prefixing
//!   (`<app_prefix><app_name>.<hostname>`), so many instances can share one
//!   collector without colliding
//! - a process-health metric set (reclaim activity, file descriptors,
//!   memory usage, threads) registered under fixed group names
//! - explicit reporter lifecycle with deterministic resource release
//!
//! ## Behavior
//!
//! This exporter makes some explicit trade-offs to accomplish its task:
//!
//! - Delivery is best-effort: a failed send is logged, the tick is skipped,
//!   and the next tick fires on schedule.  Metric loss is acceptable over
//!   UDP; process stability is not negotiable.
//! - Counters are exported cumulatively and gauges as their current value;
//!   histograms are exported as per-interval summary statistics
//!   (`count`/`min`/`max`/`mean`/`sum`).
//! - Flushes run on a fixed-delay schedule and never overlap.
//! - Metric labels are rendered as Graphite 1.1 `;key=value` tags.
//!
//! ## Usage
//!
//! Using the exporter is straightforward:
//!
//! ```ignore
//! // Configure the collector endpoint, flush interval and namespace, then
//! // install: this registers the recorder globally for all `metrics` calls
//! // and starts the background flush task.  Inside a Tokio runtime the task
//! // is spawned there; otherwise a background thread hosts a
//! // single-threaded runtime for it.
//! let mut reporter = GraphiteBuilder::new()
//!     .with_collector("graphite.internal:2003", Duration::from_secs(60))?
//!     .set_application("svc.", "billing.api")
//!     .with_system_metrics()
//!     .install()?;
//!
//! // ... the process runs, metrics flow ...
//!
//! // During orderly shutdown, stop the reporter to release the socket and
//! // guarantee no further flushes.  Stop is idempotent, and dropping the
//! // reporter stops it too, so the release runs on every shutdown path.
//! reporter.stop();
//!
//! // If you need more control, `build()` hands back the recorder and an
//! // unstarted reporter so you can install and start them yourself:
//! let (recorder, reporter) = GraphiteBuilder::new()
//!     .with_collector("graphite.internal:2003", Duration::from_secs(60))?
//!     .build()?;
//! ```
mod common;
pub use self::common::BuildError;

mod builder;
pub use self::builder::GraphiteBuilder;

pub mod formatting;
mod recorder;
mod reporter;
mod system;

pub use self::recorder::{GraphiteHandle, GraphiteRecorder};
pub use self::reporter::GraphiteReporter;
pub use self::system::SystemMetrics;
