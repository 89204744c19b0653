//! Coordinator - single-writer worker for convergence runs
//!
//! Requests are queued on a bounded channel and executed one at a time, in
//! submission order, on a dedicated thread that the mutation guard treats as
//! a privileged context.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use chrona_core::{ChronaError, ChronaResult};
use chrona_state::Registry;
use chrona_time::{ConvergenceScheduler, RunOptions, RunReport, RunScope};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use crate::CoordinatorConfig;

type Job = Box<dyn FnOnce(&mut ConvergenceScheduler) -> ChronaResult<RunReport> + Send>;
type Reply = oneshot::Sender<ChronaResult<RunReport>>;

enum Request {
    Run(Job, Reply),
    Flush(oneshot::Sender<()>),
}

/// Handle to the coordinator worker. Dropping it closes the queue and
/// joins the worker once every queued request has run.
pub struct Coordinator {
    registry: Arc<Registry>,
    sender: Option<mpsc::Sender<Request>>,
    worker: Option<JoinHandle<()>>,
    completed: Arc<AtomicU64>,
}

impl Coordinator {
    /// Spawn the worker thread
    pub fn start(registry: Arc<Registry>, config: &CoordinatorConfig) -> ChronaResult<Self> {
        let (sender, mut receiver) = mpsc::channel::<Request>(config.queue_capacity.max(1));
        let completed = Arc::new(AtomicU64::new(0));

        let worker_registry = Arc::clone(&registry);
        let worker_completed = Arc::clone(&completed);
        let worker = thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || {
                worker_registry.guard().register_coordinator();
                let mut scheduler = ConvergenceScheduler::new(Arc::clone(&worker_registry));
                info!("coordinator started");

                while let Some(request) = receiver.blocking_recv() {
                    match request {
                        Request::Run(job, reply) => {
                            let result = job(&mut scheduler);
                            // Counted before the caller is woken
                            worker_completed.fetch_add(1, Ordering::AcqRel);
                            let _ = reply.send(result);
                        }
                        Request::Flush(done) => {
                            let _ = done.send(());
                        }
                    }
                }

                worker_registry.guard().unregister_coordinator();
                info!(runs = scheduler.runs(), "coordinator stopped");
            })
            .map_err(|e| ChronaError::InvalidOperation(format!("coordinator spawn failed: {e}")))?;

        Ok(Coordinator {
            registry,
            sender: Some(sender),
            worker: Some(worker),
            completed,
        })
    }

    /// Requests executed so far
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.sender.as_ref().is_some_and(|sender| !sender.is_closed())
    }

    /// Queue a convergence run and block until it finishes. Must not be
    /// called from inside an async runtime; use [`submit_async`](Self::submit_async)
    /// there.
    pub fn submit<B>(&self, block: B, options: RunOptions) -> ChronaResult<RunReport>
    where
        B: FnMut(&RunScope<'_>) -> ChronaResult<()> + Send + 'static,
    {
        self.reject_reentry()?;
        let (reply, wait) = oneshot::channel();
        self.sender()?
            .blocking_send(Request::Run(Self::job(block, options), reply))
            .map_err(|_| ChronaError::CoordinatorClosed)?;
        wait.blocking_recv().map_err(|_| ChronaError::CoordinatorClosed)?
    }

    /// Queue a convergence run and await its report
    pub async fn submit_async<B>(&self, block: B, options: RunOptions) -> ChronaResult<RunReport>
    where
        B: FnMut(&RunScope<'_>) -> ChronaResult<()> + Send + 'static,
    {
        let (reply, wait) = oneshot::channel();
        self.sender()?
            .send(Request::Run(Self::job(block, options), reply))
            .await
            .map_err(|_| ChronaError::CoordinatorClosed)?;
        wait.await.map_err(|_| ChronaError::CoordinatorClosed)?
    }

    /// Block until every request queued before this call has finished
    pub fn flush(&self) -> ChronaResult<()> {
        self.reject_reentry()?;
        let (done, wait) = oneshot::channel();
        self.sender()?
            .blocking_send(Request::Flush(done))
            .map_err(|_| ChronaError::CoordinatorClosed)?;
        wait.blocking_recv().map_err(|_| ChronaError::CoordinatorClosed)
    }

    pub async fn flush_async(&self) -> ChronaResult<()> {
        let (done, wait) = oneshot::channel();
        self.sender()?
            .send(Request::Flush(done))
            .await
            .map_err(|_| ChronaError::CoordinatorClosed)?;
        wait.await.map_err(|_| ChronaError::CoordinatorClosed)
    }

    /// Close the queue and wait for the worker to drain it
    pub fn shutdown(&mut self) {
        if let Some(sender) = self.sender.take() {
            drop(sender);
            debug!("coordinator queue closed");
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("coordinator worker panicked");
            }
        }
    }

    fn sender(&self) -> ChronaResult<&mpsc::Sender<Request>> {
        self.sender.as_ref().ok_or(ChronaError::CoordinatorClosed)
    }

    /// A block waiting on its own coordinator would never be served
    fn reject_reentry(&self) -> ChronaResult<()> {
        if self.registry.guard().is_coordinator_thread() {
            return Err(ChronaError::InvalidOperation(
                "coordinator request issued from the coordinator thread".to_string(),
            ));
        }
        Ok(())
    }

    fn job<B>(mut block: B, options: RunOptions) -> Job
    where
        B: FnMut(&RunScope<'_>) -> ChronaResult<()> + Send + 'static,
    {
        Box::new(move |scheduler: &mut ConvergenceScheduler| {
            panic::catch_unwind(AssertUnwindSafe(|| {
                scheduler.run(|scope: &RunScope<'_>| block(scope), &options)
            }))
            .unwrap_or_else(|_| {
                error!("convergence block panicked");
                Err(ChronaError::Block("code block panicked".to_string()))
            })
        })
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("running", &self.is_running())
            .field("completed", &self.completed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrona_core::{ValueSet, VarId};
    use chrona_state::GuardConfig;
    use parking_lot::Mutex;

    fn start() -> (Arc<Registry>, Coordinator) {
        let registry = Arc::new(Registry::new(GuardConfig::default()));
        let coordinator = Coordinator::start(Arc::clone(&registry), &CoordinatorConfig::default())
            .unwrap();
        (registry, coordinator)
    }

    #[test]
    fn test_submit_runs_block_on_worker() {
        let (registry, coordinator) = start();

        let report = coordinator
            .submit(
                |scope: &RunScope<'_>| {
                    assert!(scope.registry().guard().is_coordinator_thread());
                    let x = scope.var(VarId(1), 4)?;
                    scope.emit(format!("{x}"));
                    Ok(())
                },
                RunOptions::default(),
            )
            .unwrap();

        assert!(report.converged);
        assert_eq!(report.iterations, 2);
        assert_eq!(report.output, vec!["v1 = 4".to_string()]);
        assert_eq!(registry.get(VarId(1)).unwrap().get(), ValueSet::single(4));
        assert_eq!(coordinator.completed(), 1);
    }

    #[test]
    fn test_completed_counted_before_submit_returns() {
        let (_registry, coordinator) = start();
        for n in 1..=20 {
            coordinator
                .submit(|_scope: &RunScope<'_>| Ok(()), RunOptions::plain())
                .unwrap();
            assert_eq!(coordinator.completed(), n);
        }
    }

    #[test]
    fn test_requests_run_in_fifo_order() {
        let (_registry, coordinator) = start();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for n in 0..10 {
            let seen = Arc::clone(&seen);
            let mut done = false;
            coordinator
                .submit(
                    move |_scope: &RunScope<'_>| {
                        if !done {
                            seen.lock().push(n);
                            done = true;
                        }
                        Ok(())
                    },
                    RunOptions::plain(),
                )
                .unwrap();
        }
        coordinator.flush().unwrap();

        assert_eq!(*seen.lock(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_concurrent_submitters_serialised() {
        let (_registry, coordinator) = start();
        let coordinator = Arc::new(coordinator);
        let in_flight = Arc::new(AtomicU64::new(0));
        let overlaps = Arc::new(AtomicU64::new(0));

        let handles: Vec<_> = (0..8u64)
            .map(|n| {
                let coordinator = Arc::clone(&coordinator);
                let in_flight = Arc::clone(&in_flight);
                let overlaps = Arc::clone(&overlaps);
                thread::spawn(move || {
                    coordinator
                        .submit(
                            move |scope: &RunScope<'_>| {
                                if in_flight.fetch_add(1, Ordering::SeqCst) != 0 {
                                    overlaps.fetch_add(1, Ordering::SeqCst);
                                }
                                scope.var(VarId(n), 0)?;
                                thread::yield_now();
                                in_flight.fetch_sub(1, Ordering::SeqCst);
                                Ok(())
                            },
                            RunOptions::default(),
                        )
                        .unwrap()
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap().converged);
        }
        coordinator.flush().unwrap();

        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        assert_eq!(coordinator.completed(), 8);
    }

    #[test]
    fn test_block_error_reported() {
        let (_registry, coordinator) = start();
        let result = coordinator.submit(
            |_scope: &RunScope<'_>| Err(ChronaError::Block("nope".to_string())),
            RunOptions::default(),
        );
        assert!(matches!(result, Err(ChronaError::Block(_))));

        // The worker survives a failing block
        assert!(coordinator
            .submit(|_scope: &RunScope<'_>| Ok(()), RunOptions::plain())
            .is_ok());
    }

    #[test]
    fn test_panicking_block_does_not_kill_worker() {
        let (_registry, coordinator) = start();
        let result = coordinator.submit(
            |_scope: &RunScope<'_>| -> ChronaResult<()> { panic!("boom") },
            RunOptions::plain(),
        );
        assert!(matches!(result, Err(ChronaError::Block(_))));
        assert!(coordinator.is_running());
        coordinator.flush().unwrap();
    }

    #[test]
    fn test_shutdown_closes_queue() {
        let (registry, mut coordinator) = start();
        coordinator.shutdown();
        assert!(!coordinator.is_running());
        assert!(matches!(coordinator.flush(), Err(ChronaError::CoordinatorClosed)));
        assert!(!registry.guard().is_coordinator_thread());
    }

    #[tokio::test]
    async fn test_submit_async() {
        let (_registry, coordinator) = start();

        let report = coordinator
            .submit_async(
                |scope: &RunScope<'_>| {
                    let x = scope.var(VarId(3), 41)?;
                    scope.emit(format!("{x}"));
                    Ok(())
                },
                RunOptions::default(),
            )
            .await
            .unwrap();
        coordinator.flush_async().await.unwrap();

        assert!(report.converged);
        assert_eq!(report.output, vec!["v3 = 41".to_string()]);
    }
}
