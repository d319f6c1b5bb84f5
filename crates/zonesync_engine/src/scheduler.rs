//! Serial run queue with trigger coalescing.

use crate::engine::SyncReport;
use crate::error::{SyncError, SyncResult};
use parking_lot::{Condvar, Mutex};
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Work executed for each accepted trigger.
pub type SyncJob = Arc<dyn Fn() -> SyncResult<SyncReport> + Send + Sync>;

/// What happened to a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// The queue was idle; a run starts.
    Started,
    /// A run is executing; one more run was queued behind it.
    Queued,
    /// A run was already pending; the trigger was merged into it.
    Coalesced,
    /// The scheduler has shut down.
    Closed,
}

impl TriggerOutcome {
    /// Returns true if the trigger caused a new run.
    pub fn accepted(&self) -> bool {
        matches!(self, TriggerOutcome::Started | TriggerOutcome::Queued)
    }
}

/// Notifications broadcast to subscribers.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A trigger was accepted.
    Started,
    /// A run finished, with its report or error message.
    Finished(Result<SyncReport, String>),
}

#[derive(Debug, Default)]
struct Slot {
    running: bool,
    queued: bool,
    shutdown: bool,
    completed_runs: u64,
}

#[derive(Default)]
struct Shared {
    slot: Mutex<Slot>,
    wake: Condvar,
    idle: Condvar,
    subscribers: Mutex<Vec<Sender<SyncEvent>>>,
}

impl Shared {
    fn broadcast(&self, event: SyncEvent) {
        self.subscribers
            .lock()
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }
}

/// Executes at most one run at a time, with at most one run pending.
///
/// Runs happen on a dedicated worker thread, so triggering never blocks on
/// the network.
pub struct Scheduler {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Starts the worker thread.
    pub fn start(job: SyncJob) -> SyncResult<Self> {
        let shared = Arc::new(Shared::default());
        let worker_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name("zonesync-sync".into())
            .spawn(move || worker_loop(&worker_shared, &job))
            .map_err(|e| SyncError::Worker(e.to_string()))?;

        Ok(Self {
            shared,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Requests a run.
    pub fn trigger(&self) -> TriggerOutcome {
        let mut slot = self.shared.slot.lock();
        let outcome = if slot.shutdown {
            TriggerOutcome::Closed
        } else if slot.queued {
            TriggerOutcome::Coalesced
        } else if slot.running {
            TriggerOutcome::Queued
        } else {
            TriggerOutcome::Started
        };

        tracing::debug!(?outcome, "sync trigger");
        if outcome.accepted() {
            slot.queued = true;
            // Announced before the worker can take the run.
            self.shared.broadcast(SyncEvent::Started);
            self.shared.wake.notify_one();
        }
        outcome
    }

    /// Registers for sync notifications.
    pub fn subscribe(&self) -> Receiver<SyncEvent> {
        let (sender, receiver) = mpsc::channel();
        self.shared.subscribers.lock().push(sender);
        receiver
    }

    /// Blocks until no run is executing or pending.
    pub fn wait_idle(&self) {
        let mut slot = self.shared.slot.lock();
        while slot.running || slot.queued {
            self.shared.idle.wait(&mut slot);
        }
    }

    /// Like [`Scheduler::wait_idle`], giving up after `timeout`. Returns true
    /// if the queue became idle.
    pub fn wait_idle_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut slot = self.shared.slot.lock();
        while slot.running || slot.queued {
            if self.shared.idle.wait_until(&mut slot, deadline).timed_out() {
                return !(slot.running || slot.queued);
            }
        }
        true
    }

    /// Returns true while a run executes.
    pub fn is_running(&self) -> bool {
        self.shared.slot.lock().running
    }

    /// Number of runs that have finished.
    pub fn completed_runs(&self) -> u64 {
        self.shared.slot.lock().completed_runs
    }

    /// Stops accepting triggers, finishes the pending run and joins the
    /// worker. Calling it again does nothing.
    pub fn shutdown(&self) {
        self.shared.slot.lock().shutdown = true;
        self.shared.wake.notify_all();

        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                tracing::warn!("sync worker panicked");
            }
        }
    }
}

fn worker_loop(shared: &Shared, job: &SyncJob) {
    loop {
        {
            let mut slot = shared.slot.lock();
            while !slot.queued && !slot.shutdown {
                shared.wake.wait(&mut slot);
            }
            if !slot.queued {
                break;
            }
            slot.queued = false;
            slot.running = true;
        }

        shared.broadcast(SyncEvent::Finished(run_job(job)));

        let mut slot = shared.slot.lock();
        slot.running = false;
        slot.completed_runs += 1;
        shared.idle.notify_all();
    }

    let _slot = shared.slot.lock();
    shared.idle.notify_all();
}

/// Runs the job once. A panic counts as a failed run, so the worker keeps
/// serving triggers.
fn run_job(job: &SyncJob) -> Result<SyncReport, String> {
    match panic::catch_unwind(AssertUnwindSafe(|| job())) {
        Ok(result) => result.map_err(|e| e.to_string()),
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(panic = %message, "sync job panicked");
            Err(format!("sync job panicked: {message}"))
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("slot", &*self.shared.slot.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A job that blocks until the gate opens.
    struct Gate {
        open: Mutex<bool>,
        opened: Condvar,
        runs: AtomicUsize,
    }

    impl Gate {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                open: Mutex::new(false),
                opened: Condvar::new(),
                runs: AtomicUsize::new(0),
            })
        }

        fn job(self: &Arc<Self>) -> SyncJob {
            let gate = self.clone();
            Arc::new(move || {
                gate.runs.fetch_add(1, Ordering::SeqCst);
                let mut open = gate.open.lock();
                while !*open {
                    gate.opened.wait(&mut open);
                }
                Ok(SyncReport::default())
            })
        }

        fn open(&self) {
            *self.open.lock() = true;
            self.opened.notify_all();
        }

        fn wait_for_runs(&self, count: usize) {
            let deadline = Instant::now() + Duration::from_secs(5);
            while self.runs.load(Ordering::SeqCst) < count {
                assert!(Instant::now() < deadline, "job never started");
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }

    #[test]
    fn single_trigger_runs_once() {
        let gate = Gate::new();
        gate.open();
        let scheduler = Scheduler::start(gate.job()).unwrap();

        assert_eq!(scheduler.trigger(), TriggerOutcome::Started);
        assert!(scheduler.wait_idle_for(Duration::from_secs(5)));
        assert_eq!(scheduler.completed_runs(), 1);
    }

    #[test]
    fn triggers_during_run_coalesce_into_one() {
        let gate = Gate::new();
        let scheduler = Scheduler::start(gate.job()).unwrap();

        assert_eq!(scheduler.trigger(), TriggerOutcome::Started);
        gate.wait_for_runs(1);

        let outcomes: Vec<_> = (0..5).map(|_| scheduler.trigger()).collect();
        assert_eq!(outcomes[0], TriggerOutcome::Queued);
        assert!(outcomes[1..].iter().all(|o| *o == TriggerOutcome::Coalesced));

        gate.open();
        assert!(scheduler.wait_idle_for(Duration::from_secs(5)));
        assert_eq!(scheduler.completed_runs(), 2);
        assert_eq!(gate.runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn subscribers_see_start_and_finish() {
        let gate = Gate::new();
        gate.open();
        let scheduler = Scheduler::start(gate.job()).unwrap();
        let events = scheduler.subscribe();

        scheduler.trigger();
        scheduler.wait_idle();

        assert!(matches!(events.recv().unwrap(), SyncEvent::Started));
        assert!(matches!(events.recv().unwrap(), SyncEvent::Finished(Ok(_))));
    }

    #[test]
    fn errors_are_broadcast() {
        let job: SyncJob = Arc::new(|| Err(SyncError::SessionClosed));
        let scheduler = Scheduler::start(job).unwrap();
        let events = scheduler.subscribe();

        scheduler.trigger();
        scheduler.wait_idle();

        assert!(matches!(events.recv().unwrap(), SyncEvent::Started));
        match events.recv().unwrap() {
            SyncEvent::Finished(Err(message)) => assert!(message.contains("closed")),
            other => unreachable!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn panicking_job_fails_the_run_and_keeps_the_worker() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let job: SyncJob = Arc::new(move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("remote client state corrupted");
            }
            Ok(SyncReport::default())
        });
        let scheduler = Scheduler::start(job).unwrap();
        let events = scheduler.subscribe();

        scheduler.trigger();
        assert!(scheduler.wait_idle_for(Duration::from_secs(5)));
        assert!(!scheduler.is_running());
        assert!(matches!(events.recv().unwrap(), SyncEvent::Started));
        match events.recv().unwrap() {
            SyncEvent::Finished(Err(message)) => {
                assert!(message.contains("remote client state corrupted"));
            }
            other => unreachable!("unexpected event {other:?}"),
        }

        assert_eq!(scheduler.trigger(), TriggerOutcome::Started);
        assert!(scheduler.wait_idle_for(Duration::from_secs(5)));
        assert_eq!(scheduler.completed_runs(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(matches!(events.recv().unwrap(), SyncEvent::Started));
        assert!(matches!(events.recv().unwrap(), SyncEvent::Finished(Ok(_))));
    }

    #[test]
    fn shutdown_drains_pending_run() {
        let gate = Gate::new();
        let scheduler = Scheduler::start(gate.job()).unwrap();
        scheduler.trigger();
        gate.wait_for_runs(1);
        assert_eq!(scheduler.trigger(), TriggerOutcome::Queued);

        gate.open();
        scheduler.shutdown();
        assert_eq!(scheduler.completed_runs(), 2);
        assert_eq!(scheduler.trigger(), TriggerOutcome::Closed);
    }
}
