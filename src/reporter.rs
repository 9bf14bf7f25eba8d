use std::io;
use std::mem;
use std::net::{Ipv6Addr, SocketAddr};
use std::thread;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::runtime;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::common::BuildError;
use crate::recorder::GraphiteHandle;
use crate::system::SystemMetrics;

/// Periodic flush task pushing registry snapshots to the collector.
///
/// A reporter moves through exactly three states: unstarted after
/// construction, running after [`start`](Self::start), and stopped after
/// [`stop`](Self::stop).  Restarting a stopped reporter is not supported;
/// build a new one instead.
///
/// While running, ticks fire on a fixed-delay schedule: each tick sleeps one
/// interval, refreshes the system metric set, snapshots the registry, and
/// sends the rendered payload.  Ticks are sequential, so flushes never
/// overlap, and the first flush happens no earlier than one interval after
/// start.  A failed send is logged and the next tick still fires; with UDP
/// transport, losing a datagram is acceptable and taking the process down is
/// not.
///
/// Stopping is the host process's responsibility during orderly shutdown,
/// and it is safe to call on an already-stopped reporter.  Dropping the
/// reporter also stops it, so the socket is released on every shutdown path.
#[must_use = "dropping the reporter stops it"]
pub struct GraphiteReporter {
    state: State,
}

enum State {
    Unstarted(Box<FlushTask>),
    Running(oneshot::Sender<()>),
    Stopped,
}

impl GraphiteReporter {
    pub(crate) fn new(
        handle: GraphiteHandle,
        endpoint: SocketAddr,
        interval: Duration,
        system: Option<SystemMetrics>,
        max_packet_size: usize,
    ) -> Self {
        GraphiteReporter {
            state: State::Unstarted(Box::new(FlushTask {
                handle,
                endpoint,
                interval,
                system,
                max_packet_size,
            })),
        }
    }

    /// Starts the background flush task.
    ///
    /// When called from within a Tokio runtime, the task is spawned directly
    /// into that runtime.  Otherwise a new single-threaded runtime is created
    /// on a dedicated background thread and the task runs there.
    ///
    /// ## Errors
    ///
    /// Returns [`BuildError::ReporterAlreadyStarted`] if the reporter is
    /// already running or was stopped, and
    /// [`BuildError::FailedToCreateRuntime`] if the background runtime or
    /// thread could not be created.
    pub fn start(&mut self) -> Result<(), BuildError> {
        match mem::replace(&mut self.state, State::Stopped) {
            State::Unstarted(task) => {
                let (shutdown_tx, shutdown_rx) = oneshot::channel();
                Self::spawn(task, shutdown_rx)?;
                self.state = State::Running(shutdown_tx);
                Ok(())
            }
            other => {
                self.state = other;
                Err(BuildError::ReporterAlreadyStarted)
            }
        }
    }

    /// Stops the reporter.
    ///
    /// No new flush begins after this returns; a tick that is already in
    /// flight completes before the task quiesces and releases the socket.
    /// Stopping an already-stopped (or never-started) reporter is a no-op.
    pub fn stop(&mut self) {
        if let State::Running(shutdown) = mem::replace(&mut self.state, State::Stopped) {
            // the task also observes a dropped sender as shutdown
            let _ = shutdown.send(());
        }
    }

    /// Whether the background flush task is currently scheduled.
    ///
    /// Returns `false` once the task has exited on its own — such as when
    /// its socket could not be bound — not just after [`stop`](Self::stop):
    /// a live task keeps its end of the shutdown channel open.
    pub fn is_running(&self) -> bool {
        matches!(&self.state, State::Running(shutdown) if !shutdown.is_closed())
    }

    fn spawn(task: Box<FlushTask>, shutdown: oneshot::Receiver<()>) -> Result<(), BuildError> {
        if let Ok(handle) = runtime::Handle::try_current() {
            handle.spawn(task.run(shutdown));
        } else {
            let runtime = runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| BuildError::FailedToCreateRuntime(e.to_string()))?;

            thread::Builder::new()
                .name("graphite-reporter".to_string())
                .spawn(move || runtime.block_on(task.run(shutdown)))
                .map_err(|e| BuildError::FailedToCreateRuntime(e.to_string()))?;
        }
        Ok(())
    }
}

impl Drop for GraphiteReporter {
    fn drop(&mut self) {
        self.stop();
    }
}

struct FlushTask {
    handle: GraphiteHandle,
    endpoint: SocketAddr,
    interval: Duration,
    system: Option<SystemMetrics>,
    max_packet_size: usize,
}

impl FlushTask {
    async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        let bind_addr: SocketAddr = match self.endpoint {
            SocketAddr::V4(_) => ([0, 0, 0, 0], 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = match UdpSocket::bind(bind_addr).await {
            Ok(socket) => socket,
            Err(e) => {
                error!("failed to bind reporter socket: {e}");
                return;
            }
        };

        loop {
            tokio::select! {
                // check shutdown first so a tick that becomes due at the
                // same moment does not start a fresh flush
                biased;

                _ = &mut shutdown => break,
                _ = tokio::time::sleep(self.interval) => {
                    if let Some(system) = self.system.as_mut() {
                        system.refresh();
                    }

                    let payload = self.handle.render();
                    if payload.is_empty() {
                        continue;
                    }

                    if let Err(e) = send_all(&socket, &payload, &self.endpoint, self.max_packet_size).await {
                        error!("error flushing metrics to {}: {e}", self.endpoint);
                    }
                }
            }
        }

        debug!("graphite reporter stopped");
    }
}

// Datagrams are split on line boundaries because a plaintext metric must not
// straddle two packets; a single line longer than the budget is sent as its
// own oversized datagram rather than truncated.
fn split_datagrams(payload: &str, max_packet_size: usize) -> Vec<&str> {
    let mut datagrams = Vec::new();
    let mut start = 0;
    let mut end = 0;

    for line in payload.split_inclusive('\n') {
        if end + line.len() - start > max_packet_size && end > start {
            datagrams.push(&payload[start..end]);
            start = end;
        }
        end += line.len();
    }

    if end > start {
        datagrams.push(&payload[start..end]);
    }

    datagrams
}

async fn send_all(
    socket: &UdpSocket,
    payload: &str,
    endpoint: &SocketAddr,
    max_packet_size: usize,
) -> io::Result<()> {
    let mut failed = 0usize;
    for datagram in split_datagrams(payload, max_packet_size) {
        match socket.send_to(datagram.as_bytes(), endpoint).await {
            Ok(sent) => {
                if sent != datagram.len() {
                    warn!("short UDP send: wrote {sent} of {} bytes", datagram.len());
                }
            }
            Err(e) => {
                // a lost datagram should not abort the rest of the flush
                warn!("error sending datagram to {endpoint}: {e}");
                failed += 1;
            }
        }
    }
    if failed > 0 {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            format!("{failed} datagram(s) failed to send"),
        ));
    }
    Ok(())
}
