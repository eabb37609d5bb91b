//! Fire-once timers.
//!
//! [`Scheduler`] is the only notion of time the core uses: the scan stop and
//! the registry reset are scheduled through it. Callbacks may run on a
//! different thread than the one that scheduled them.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::trace;

pub type TimerTask = Box<dyn FnOnce() + Send>;

/// Opaque id of a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

pub trait Scheduler: Send + Sync {
    /// Run `task` once after `delay`.
    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerHandle;

    /// Prevent a pending timer from firing. Unknown or already fired handles
    /// are ignored.
    fn cancel(&self, handle: &TimerHandle);
}

/// Timers as tasks on a tokio runtime.
pub struct TokioScheduler {
    runtime: Handle,
    next_id: AtomicU64,
    pending: Arc<Mutex<HashMap<TimerHandle, AbortHandle>>>,
}

impl TokioScheduler {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            next_id: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Scheduler bound to the runtime of the calling context.
    ///
    /// Panics outside a tokio runtime, like [`Handle::current`].
    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    pub fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerHandle {
        let handle = TimerHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        let pending = self.pending.clone();

        // Hold the map lock across spawn so the task cannot remove its entry
        // before it has been inserted.
        let mut map = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let join = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let still_pending = pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&handle)
                .is_some();
            if still_pending {
                task();
            }
        });
        map.insert(handle, join.abort_handle());
        handle
    }

    fn cancel(&self, handle: &TimerHandle) {
        let removed = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(handle);
        if let Some(abort) = removed {
            trace!("Cancelling timer {:?}", handle);
            abort.abort();
        }
    }
}

/// Deterministic scheduler for hosts that drive time themselves.
///
/// Nothing fires until [`ManualScheduler::advance`] moves the clock past a
/// deadline.
#[derive(Default)]
pub struct ManualScheduler {
    inner: Mutex<ManualClock>,
}

#[derive(Default)]
struct ManualClock {
    now: Duration,
    next_id: u64,
    // (deadline, id) keeps timers with equal deadlines in scheduling order
    pending: BTreeMap<(Duration, u64), TimerTask>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the clock forward, firing every timer that comes due, earliest
    /// first. Tasks run on the calling thread, outside the internal lock, so
    /// they may schedule or cancel further timers.
    pub fn advance(&self, by: Duration) {
        let target = {
            let clock = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            clock.now + by
        };

        loop {
            let due = {
                let mut clock = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
                let next_key = clock
                    .pending
                    .keys()
                    .next()
                    .copied()
                    .filter(|(deadline, _)| *deadline <= target);
                match next_key {
                    Some(key) => {
                        clock.now = key.0;
                        clock.pending.remove(&key)
                    }
                    None => {
                        clock.now = target;
                        None
                    }
                }
            };

            match due {
                Some(task) => task(),
                None => break,
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending
            .len()
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerHandle {
        let mut clock = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        clock.next_id += 1;
        let id = clock.next_id;
        let deadline = clock.now + delay;
        clock.pending.insert((deadline, id), task);
        TimerHandle(id)
    }

    fn cancel(&self, handle: &TimerHandle) {
        let mut clock = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        clock.pending.retain(|(_, id), _| *id != handle.0);
    }
}
