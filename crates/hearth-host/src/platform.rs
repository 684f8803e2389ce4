use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::runtime::{Builder, Handle, Runtime};
use tracing::{debug, info, warn};

use crate::config::ProcessConfig;
use crate::error::HostError;

/// Process-level services shared by every runtime context
///
/// Built once from the process configuration and handed to each context by
/// `Arc`. Owns the worker pool that executes blocking work.
pub struct Platform {
    config: ProcessConfig,
    handle: Handle,
    runtime: Mutex<Option<Runtime>>,
    closed: AtomicBool,
    next_context_id: AtomicU64,
}

impl Platform {
    pub fn new(config: ProcessConfig) -> Result<Arc<Self>, HostError> {
        config
            .validate()
            .map_err(|e| HostError::BootstrapFailed(e.to_string()))?;

        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(config.thread_pool_size)
            .thread_name("hearth-worker")
            .enable_all()
            .build()?;

        info!(
            target: "runtime",
            "Platform started with {} worker threads",
            config.thread_pool_size
        );

        Ok(Arc::new(Self {
            config,
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
            closed: AtomicBool::new(false),
            next_context_id: AtomicU64::new(1),
        }))
    }

    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    /// Run `job` on a worker thread
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) -> Result<(), HostError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(HostError::SchedulingFailure(
                "worker pool has been shut down".to_string(),
            ));
        }
        // Detached: completion is reported by the job itself
        drop(self.handle.spawn_blocking(job));
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn allocate_context_id(&self) -> u64 {
        self.next_context_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Stop accepting work and wait up to the drain timeout for running jobs
    pub fn dispose(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let runtime = self
            .runtime
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        match runtime {
            Some(runtime) => {
                debug!(target: "runtime", "Shutting down worker pool");
                runtime.shutdown_timeout(self.config.drain_timeout());
            }
            None => warn!(target: "runtime", "Worker pool already shut down"),
        }
    }
}

impl Drop for Platform {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_submit_runs_off_thread() {
        let platform = Platform::new(ProcessConfig::default()).unwrap();
        let (tx, rx) = mpsc::channel();
        let caller = std::thread::current().id();

        platform
            .submit(move || {
                let _ = tx.send(std::thread::current().id());
            })
            .unwrap();

        let worker = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_ne!(worker, caller);
    }

    #[test]
    fn test_submit_after_dispose_fails() {
        let platform = Platform::new(ProcessConfig::default()).unwrap();
        platform.dispose();
        assert!(platform.is_closed());
        assert!(matches!(
            platform.submit(|| {}),
            Err(HostError::SchedulingFailure(_))
        ));
        // Second dispose is a no-op
        platform.dispose();
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = ProcessConfig {
            thread_pool_size: 0,
            ..Default::default()
        };
        assert!(Platform::new(config).is_err());
    }
}
