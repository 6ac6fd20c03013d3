//! Reference-counted recycling of window-sized buffers.
//!
//! Time series, spectra and correlation arrays are large and requested at
//! audio rates; recycling them through a bounded free-list keeps allocations
//! off the streaming path. The pool hands out [`RefCounted`] handles whose
//! count starts at 1; the object returns to the free-list once the count
//! reaches zero. Recycling is best effort: an overflowing free-list drops its
//! oldest entry.

use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use tracing::trace;

/// Default capacity of the recycling buffer.
const DEFAULT_CAPACITY: usize = 10;

struct SlotState<T> {
    memory: Option<T>,
    ref_count: u32,
}

struct Slot<T> {
    // Per-object guard; release racing retain resolves here.
    state: Mutex<SlotState<T>>,
    recycle_tx: Sender<T>,
    recycle_rx: Receiver<T>,
}

/// Handle to a pooled object.
///
/// Every logical owner holds exactly one reference. Sharing with another
/// owner requires [`RefCounted::try_clone`]; every owner must pair its
/// reference with one [`RefCounted::release`].
pub struct RefCounted<T> {
    slot: Arc<Slot<T>>,
}

impl<T> RefCounted<T> {
    /// Increment the reference count.
    ///
    /// Returns `false` if the count already reached zero, i.e. the memory
    /// was recycled and must not be resurrected.
    pub fn retain(&self) -> bool {
        let mut state = self.slot.state.lock().unwrap();
        if state.ref_count == 0 {
            false
        } else {
            state.ref_count += 1;
            true
        }
    }

    /// Decrement the reference count, recycling the object at zero.
    pub fn release(&self) {
        let taken = {
            let mut state = self.slot.state.lock().unwrap();
            if state.ref_count == 0 {
                trace!("release on an already recycled pool object");
                return;
            }
            state.ref_count -= 1;
            if state.ref_count == 0 {
                state.memory.take()
            } else {
                None
            }
        };
        if let Some(memory) = taken {
            // Bounded free-list, drop-oldest on overflow.
            if let Err(TrySendError::Full(memory)) = self.slot.recycle_tx.try_send(memory) {
                let _ = self.slot.recycle_rx.try_recv();
                let _ = self.slot.recycle_tx.try_send(memory);
            }
        }
    }

    /// Create a second handle for an additional logical owner.
    ///
    /// Returns `None` if the memory was already recycled.
    pub fn try_clone(&self) -> Option<RefCounted<T>> {
        if self.retain() {
            Some(RefCounted {
                slot: Arc::clone(&self.slot),
            })
        } else {
            None
        }
    }

    /// Read access to the underlying memory.
    ///
    /// Returns `None` if the memory was already recycled.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let state = self.slot.state.lock().unwrap();
        state.memory.as_ref().map(f)
    }

    /// Exclusive access to the underlying memory.
    ///
    /// Returns `None` if the memory was already recycled.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut state = self.slot.state.lock().unwrap();
        state.memory.as_mut().map(f)
    }
}

/// Pool of reusable objects of one type.
///
/// Wrap it per concrete type and expose a `get` with the shape parameters:
///
/// ```ignore
/// fn get(&self, size: usize, dt: f32) -> RefCounted<TimeSeries> {
///     self.pool.acquire(
///         || TimeSeries::new(size, dt),
///         |series| series.size == size && series.dt == dt,
///     )
/// }
/// ```
pub struct MemoryPool<T> {
    recycle_tx: Sender<T>,
    recycle_rx: Receiver<T>,
}

impl<T> MemoryPool<T> {
    pub fn new(capacity: usize) -> Self {
        let (recycle_tx, recycle_rx) = bounded(capacity.max(1));
        Self {
            recycle_tx,
            recycle_rx,
        }
    }

    /// Obtain a handle to a recycled object passing `checker`, or to a newly
    /// constructed one. The reference count starts at 1.
    pub fn acquire(
        &self,
        factory: impl FnOnce() -> T,
        checker: impl Fn(&T) -> bool,
    ) -> RefCounted<T> {
        let mut memory = None;
        // Candidates of the wrong shape are discarded for good.
        while let Ok(candidate) = self.recycle_rx.try_recv() {
            if checker(&candidate) {
                memory = Some(candidate);
                break;
            }
        }
        let memory = memory.unwrap_or_else(|| {
            trace!("memory pool: allocating new object");
            factory()
        });
        RefCounted {
            slot: Arc::new(Slot {
                state: Mutex::new(SlotState {
                    memory: Some(memory),
                    ref_count: 1,
                }),
                recycle_tx: self.recycle_tx.clone(),
                recycle_rx: self.recycle_rx.clone(),
            }),
        }
    }
}

impl<T> Default for MemoryPool<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
