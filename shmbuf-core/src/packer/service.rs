//! Background runtime that drives the packer.

use super::{PackStats, Packer};
use crate::config::PackerConfig;
use crate::error::{Result, StoreError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;

/// How long `stop` waits for in-flight stream jobs.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Niceness of packer runtime threads, workers and blocking pool alike.
pub(crate) const PACKER_NICE: i32 = 10;

/// Runs packer passes on a dedicated runtime, away from consumer threads.
///
/// Every runtime thread lowers its own scheduling priority on start
/// (Linux only), so packing yields to writers and readers under load.
///
/// The shutdown signal is checked between streams; a stream that is being
/// packed runs to completion.
pub struct PackerService {
    runtime: Option<Runtime>,
    shutdown_tx: broadcast::Sender<()>,
    stats: Arc<Mutex<PackStats>>,
}

impl PackerService {
    /// Start the packer loop.
    ///
    /// # Errors
    /// `PackerStart` if the runtime cannot be built.
    pub fn start(packer: Arc<Packer>, config: &PackerConfig) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.workers.max(1))
            .thread_name("shmbuf-packer")
            .on_thread_start(lower_thread_priority)
            .enable_time()
            .build()
            .map_err(|e| StoreError::PackerStart {
                cause: e.to_string(),
            })?;

        let (shutdown_tx, _) = broadcast::channel(1);
        let shutdown_rx = shutdown_tx.subscribe();
        let stats = Arc::new(Mutex::new(PackStats::default()));

        runtime.spawn(run_loop(
            packer,
            config.interval(),
            shutdown_rx,
            Arc::clone(&stats),
        ));

        tracing::info!(workers = config.workers, interval_ms = config.interval_ms, "Packer started");

        Ok(Self {
            runtime: Some(runtime),
            shutdown_tx,
            stats,
        })
    }

    /// Totals across every pass so far.
    #[must_use]
    pub fn stats(&self) -> PackStats {
        *self.stats.lock()
    }

    /// Whether the service is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.runtime.is_some()
    }

    /// Signal shutdown and wait for the current stream job to finish.
    pub fn stop(&mut self) {
        let Some(runtime) = self.runtime.take() else {
            return;
        };
        let _ = self.shutdown_tx.send(());
        runtime.shutdown_timeout(SHUTDOWN_TIMEOUT);
        tracing::info!("Packer stopped");
    }
}

impl Drop for PackerService {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for PackerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackerService")
            .field("running", &self.is_running())
            .field("stats", &self.stats())
            .finish()
    }
}

/// Raise the calling thread's niceness to [`PACKER_NICE`].
///
/// On Linux `PRIO_PROCESS` with a thread id targets that thread alone. A
/// thread that is already at or below that priority is left alone.
#[cfg(target_os = "linux")]
pub(crate) fn lower_thread_priority() {
    // SAFETY: gettid and getpriority/setpriority have no memory-safety
    // preconditions.
    unsafe {
        let tid = libc::gettid() as libc::id_t;
        if libc::getpriority(libc::PRIO_PROCESS, tid) >= PACKER_NICE {
            return;
        }
        if libc::setpriority(libc::PRIO_PROCESS, tid, PACKER_NICE) != 0 {
            tracing::warn!(
                error = %std::io::Error::last_os_error(),
                "Failed to lower packer thread priority"
            );
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn lower_thread_priority() {}

async fn run_loop(
    packer: Arc<Packer>,
    interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
    stats: Arc<Mutex<PackStats>>,
) {
    loop {
        let lister = Arc::clone(&packer);
        let streams = match tokio::task::spawn_blocking(move || lister.pending_streams()).await {
            Ok(Ok(streams)) => streams,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Failed to list pending streams");
                Vec::new()
            }
            Err(e) => {
                tracing::error!(error = %e, "Packer task failed");
                return;
            }
        };

        for stream in streams {
            if !matches!(shutdown_rx.try_recv(), Err(TryRecvError::Empty)) {
                return;
            }
            let worker = Arc::clone(&packer);
            match tokio::task::spawn_blocking(move || worker.pack_stream(stream)).await {
                Ok(Ok(run)) => stats.lock().merge(&run),
                Ok(Err(e)) => {
                    tracing::warn!(%stream, error = %e, "Packing stream failed");
                    let mut stats = stats.lock();
                    stats.streams += 1;
                    stats.failed += 1;
                }
                Err(e) => {
                    tracing::error!(%stream, error = %e, "Packer task failed");
                    return;
                }
            }
        }

        tokio::select! {
            _ = shutdown_rx.recv() => return,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
