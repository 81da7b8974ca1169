//! Pieces shared by every executor pool.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::error::{PoolError, Result};
use crate::future::lock;

/// Lifecycle operations common to the pools.
pub trait Pool {
    fn name(&self) -> &str;

    /// Start accepting submissions.
    fn open(&self) -> Result<()>;

    /// Stop accepting submissions and stop the workers, waiting at most
    /// `timeout` (forever when `None`).
    fn shutdown(&self, timeout: Option<Duration>) -> Result<()>;

    fn is_open(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    Open,
    ShutDown,
}

/// Open/shutdown flags of one pool.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    name: String,
    phase: Mutex<Phase>,
}

impl Lifecycle {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            phase: Mutex::new(Phase::Created),
        }
    }

    /// Created to open. Opening an open pool is a no-op.
    pub fn open(&self) -> Result<()> {
        let mut phase = lock(&self.phase);
        match *phase {
            Phase::Created | Phase::Open => {
                *phase = Phase::Open;
                Ok(())
            }
            Phase::ShutDown => Err(PoolError::ShutDown(self.name.clone())),
        }
    }

    pub fn check_open(&self) -> Result<()> {
        match *lock(&self.phase) {
            Phase::Open => Ok(()),
            Phase::Created => Err(PoolError::NotOpen(self.name.clone())),
            Phase::ShutDown => Err(PoolError::ShutDown(self.name.clone())),
        }
    }

    pub fn is_open(&self) -> bool {
        *lock(&self.phase) == Phase::Open
    }

    /// Move to shut down. Returns whether the pool had been opened.
    pub fn begin_shutdown(&self) -> bool {
        let mut phase = lock(&self.phase);
        let was_open = *phase == Phase::Open;
        *phase = Phase::ShutDown;
        was_open
    }
}

#[derive(Debug)]
struct SlotCount {
    in_use: usize,
    capacity: usize,
}

/// Counting limit on in-flight work, waitable from OS threads.
#[derive(Debug)]
pub(crate) struct Slots {
    count: Mutex<SlotCount>,
    freed: Condvar,
}

/// Holds one slot until dropped.
#[derive(Debug)]
pub(crate) struct SlotGuard {
    slots: Arc<Slots>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        {
            let mut count = lock(&self.slots.count);
            count.in_use = count.in_use.saturating_sub(1);
        }
        self.slots.freed.notify_one();
    }
}

impl Slots {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            count: Mutex::new(SlotCount {
                in_use: 0,
                capacity,
            }),
            freed: Condvar::new(),
        })
    }

    pub fn in_use(&self) -> usize {
        lock(&self.count).in_use
    }

    pub fn try_acquire(self: &Arc<Self>) -> Option<SlotGuard> {
        let mut count = lock(&self.count);
        if count.in_use < count.capacity {
            count.in_use += 1;
            Some(SlotGuard { slots: self.clone() })
        } else {
            None
        }
    }

    /// Wait for a slot, bounded by `timeout` when given. Gives up early if
    /// `cancelled` turns true.
    pub fn acquire(
        self: &Arc<Self>,
        timeout: Option<Duration>,
        cancelled: impl Fn() -> bool,
        on_cancel: impl FnOnce() -> PoolError,
    ) -> Result<SlotGuard> {
        const RECHECK: Duration = Duration::from_millis(50);
        let deadline = timeout.map(|timeout| Instant::now() + timeout);

        let mut count = lock(&self.count);
        loop {
            if cancelled() {
                return Err(on_cancel());
            }
            if count.in_use < count.capacity {
                count.in_use += 1;
                return Ok(SlotGuard { slots: self.clone() });
            }
            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(PoolError::Timeout(timeout.unwrap_or_default()));
                    }
                    (deadline - now).min(RECHECK)
                }
                None => RECHECK,
            };
            count = self
                .freed
                .wait_timeout(count, wait)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

/// The single inline slot of a shared pool.
#[derive(Debug, Default)]
pub(crate) struct InlineSlot {
    taken: AtomicBool,
}

pub(crate) struct InlineGuard<'a> {
    slot: &'a InlineSlot,
}

impl Drop for InlineGuard<'_> {
    fn drop(&mut self) {
        self.slot.taken.store(false, Ordering::Release);
    }
}

impl InlineSlot {
    pub fn try_take(&self) -> Option<InlineGuard<'_>> {
        self.taken
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InlineGuard { slot: self })
    }
}

/// What a submission should do when no worker slot is free.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Overflow {
    /// Run on the caller.
    Inline,
    /// Wait for a slot.
    Wait,
}

/// `block=false` runs inline; shared pools only have one inline slot and
/// fall back to waiting when it is taken.
pub(crate) fn overflow(block: bool, shared: bool, inline_free: bool) -> Overflow {
    match (block, shared) {
        (true, _) => Overflow::Wait,
        (false, false) => Overflow::Inline,
        (false, true) if inline_free => Overflow::Inline,
        (false, true) => Overflow::Wait,
    }
}
