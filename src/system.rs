use metrics::{Gauge, Key, Level, Metadata, Recorder};
use sysinfo::{Pid, System};
use tracing::warn;

use crate::common::BuildError;
use crate::recorder::GraphiteRecorder;

static METADATA: Metadata = Metadata::new(module_path!(), Level::INFO, Some(module_path!()));

/// Bundle of process-health gauges registered under a fixed set of groups.
///
/// The groups mirror the runtime instrumentation a shared collector expects
/// from every application: reclaim activity, file descriptor pressure, memory
/// usage, and thread count.  There is no garbage collector in this runtime,
/// so the `gc` group reports page-fault counts, the closest process-level
/// analog of collector activity.
///
/// Values are read from `sysinfo` and procfs; on targets without procfs the
/// gauges stay registered with their last (initially zero) values.
pub struct SystemMetrics {
    system: System,
    pid: Option<Pid>,
    minor_faults: Gauge,
    major_faults: Gauge,
    fd_ratio: Gauge,
    resident_bytes: Gauge,
    virtual_bytes: Gauge,
    thread_count: Gauge,
}

impl SystemMetrics {
    /// The fixed top-level groups this set registers under.
    pub const GROUPS: [&'static str; 4] = ["gc", "file-descriptors", "memory-usage", "threads"];

    /// Registers the system metric set with the given recorder.
    ///
    /// ## Errors
    ///
    /// Registering the set twice with the same recorder returns
    /// [`BuildError::DuplicateMetricSet`]: a second registration means the
    /// process is already instrumented and would double-report.
    pub fn register(recorder: &GraphiteRecorder) -> Result<Self, BuildError> {
        recorder.claim_system_set()?;

        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!("cannot resolve own pid, process memory gauges will stay at zero: {e}");
                None
            }
        };

        let gauge =
            |name: &'static str| recorder.register_gauge(&Key::from_static_name(name), &METADATA);

        Ok(SystemMetrics {
            system: System::new(),
            pid,
            minor_faults: gauge("gc.minor-faults"),
            major_faults: gauge("gc.major-faults"),
            fd_ratio: gauge("file-descriptors"),
            resident_bytes: gauge("memory-usage.resident-bytes"),
            virtual_bytes: gauge("memory-usage.virtual-bytes"),
            thread_count: gauge("threads.count"),
        })
    }

    /// Re-reads every source and updates the registered gauges.
    ///
    /// The reporter calls this at the top of each flush tick so the snapshot
    /// that follows carries current values.
    pub fn refresh(&mut self) {
        if let Some(pid) = self.pid {
            if self.system.refresh_process(pid) {
                if let Some(process) = self.system.process(pid) {
                    self.resident_bytes.set(process.memory() as f64);
                    self.virtual_bytes.set(process.virtual_memory() as f64);
                }
            }
        }

        if let Some(stat) = proc::stat() {
            self.minor_faults.set(stat.minor_faults as f64);
            self.major_faults.set(stat.major_faults as f64);
            self.thread_count.set(stat.threads as f64);
        }

        if let Some(ratio) = proc::fd_ratio() {
            self.fd_ratio.set(ratio);
        }
    }
}

#[cfg(target_os = "linux")]
mod proc {
    pub(super) struct Stat {
        pub minor_faults: u64,
        pub major_faults: u64,
        pub threads: u64,
    }

    pub(super) fn stat() -> Option<Stat> {
        let raw = std::fs::read_to_string("/proc/self/stat").ok()?;
        // The comm field may contain spaces and parentheses, so index from
        // the closing paren: state is field 3, minflt 10, majflt 12,
        // num_threads 20.
        let rest = raw.rsplit_once(')')?.1;
        let fields: Vec<&str> = rest.split_whitespace().collect();

        Some(Stat {
            minor_faults: fields.get(7)?.parse().ok()?,
            major_faults: fields.get(9)?.parse().ok()?,
            threads: fields.get(17)?.parse().ok()?,
        })
    }

    pub(super) fn fd_ratio() -> Option<f64> {
        let open = std::fs::read_dir("/proc/self/fd").ok()?.count() as f64;
        let limits = std::fs::read_to_string("/proc/self/limits").ok()?;
        let line = limits.lines().find(|l| l.starts_with("Max open files"))?;
        let soft: f64 = line.split_whitespace().nth(3)?.parse().ok()?;
        if soft <= 0.0 {
            return None;
        }
        Some(open / soft)
    }
}

#[cfg(not(target_os = "linux"))]
mod proc {
    pub(super) struct Stat {
        pub minor_faults: u64,
        pub major_faults: u64,
        pub threads: u64,
    }

    pub(super) fn stat() -> Option<Stat> {
        None
    }

    pub(super) fn fd_ratio() -> Option<f64> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::SystemMetrics;
    use crate::builder::GraphiteBuilder;
    use crate::common::BuildError;

    #[test]
    fn registers_all_four_groups() {
        let recorder = GraphiteBuilder::new().build_recorder().unwrap();
        let mut system = SystemMetrics::register(&recorder).unwrap();
        system.refresh();

        let rendered = recorder.handle().render_at(1000);
        for group in SystemMetrics::GROUPS {
            assert!(
                rendered.contains(group),
                "missing group `{group}` in: {rendered}"
            );
        }
    }

    #[test]
    fn double_registration_is_rejected() {
        let recorder = GraphiteBuilder::new().build_recorder().unwrap();
        let _first = SystemMetrics::register(&recorder).unwrap();
        assert!(matches!(
            SystemMetrics::register(&recorder),
            Err(BuildError::DuplicateMetricSet)
        ));
    }

    #[test]
    fn fresh_recorders_are_independent() {
        let first = GraphiteBuilder::new().build_recorder().unwrap();
        let second = GraphiteBuilder::new().build_recorder().unwrap();
        assert!(SystemMetrics::register(&first).is_ok());
        assert!(SystemMetrics::register(&second).is_ok());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn proc_stat_reports_live_process() {
        let stat = super::proc::stat().expect("procfs should be readable");
        assert!(stat.threads >= 1);

        let ratio = super::proc::fd_ratio().expect("fd ratio should be readable");
        assert!(ratio > 0.0 && ratio <= 1.0);
    }
}
