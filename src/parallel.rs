//! Collective communication between processors.
//!
//! A *processor* owns a subset of nodes and elements. All functions in this module are
//! collective: every processor must call them in the same order, or the program deadlocks.
use crate::Real;
use parking_lot::Mutex;
use std::any::Any;
use std::sync::{Arc, Barrier};

/// A type-erased payload exchanged between processors.
pub type Payload = Arc<dyn Any + Send + Sync>;

/// Collective operations over a fixed group of processors.
pub trait Communicator {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;

    /// Exchanges one payload per processor. The result is ordered by rank and identical on all
    /// processors.
    fn exchange(&self, payload: Payload) -> Vec<Payload>;
}

/// Typed convenience operations on top of [`Communicator::exchange`].
pub trait CommunicatorExt: Communicator {
    fn all_gather<V>(&self, value: V) -> Vec<V>
    where
        V: Clone + Send + Sync + 'static,
    {
        self.exchange(Arc::new(value))
            .into_iter()
            .map(|payload| {
                payload
                    .downcast_ref::<V>()
                    .cloned()
                    .expect("all processors must exchange values of the same type")
            })
            .collect()
    }

    /// Logical OR over all processors.
    fn all_reduce_or(&self, value: bool) -> bool {
        self.all_gather(value).into_iter().any(|v| v)
    }

    /// Sum over all processors, accumulated in rank order.
    fn all_reduce_sum<T: Real>(&self, value: T) -> T {
        self.all_gather(value)
            .into_iter()
            .fold(T::zero(), |acc, v| acc + v)
    }

    fn all_reduce_max<T: Real>(&self, value: T) -> T {
        self.all_gather(value)
            .into_iter()
            .fold(value, |acc, v| acc.max(v))
    }

    fn all_reduce_min<T: Real>(&self, value: T) -> T {
        self.all_gather(value)
            .into_iter()
            .fold(value, |acc, v| acc.min(v))
    }
}

impl<C: Communicator + ?Sized> CommunicatorExt for C {}

/// The trivial communicator of a single processor.
#[derive(Debug, Copy, Clone, Default)]
pub struct SerialCommunicator;

impl Communicator for SerialCommunicator {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn exchange(&self, payload: Payload) -> Vec<Payload> {
        vec![payload]
    }
}

struct ExchangeState {
    slots: Mutex<Vec<Option<Payload>>>,
    barrier: Barrier,
}

/// Processors emulated by threads of the same process.
///
/// Each exchange writes the local payload into a shared slot, waits for all processors, reads
/// all slots and waits once more so that no slot is overwritten before everyone has read it.
#[derive(Clone)]
pub struct ThreadCommunicator {
    rank: usize,
    size: usize,
    state: Arc<ExchangeState>,
}

impl std::fmt::Debug for ThreadCommunicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadCommunicator")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .finish()
    }
}

impl ThreadCommunicator {
    /// Creates the communicators of a group of `size` processors, ordered by rank.
    pub fn create_group(size: usize) -> Vec<Self> {
        assert!(size > 0, "a communicator group needs at least one processor");
        let state = Arc::new(ExchangeState {
            slots: Mutex::new(vec![None; size]),
            barrier: Barrier::new(size),
        });
        (0..size)
            .map(|rank| Self {
                rank,
                size,
                state: Arc::clone(&state),
            })
            .collect()
    }
}

impl Communicator for ThreadCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn exchange(&self, payload: Payload) -> Vec<Payload> {
        self.state.slots.lock()[self.rank] = Some(payload);
        self.state.barrier.wait();
        let gathered = self
            .state
            .slots
            .lock()
            .iter()
            .map(|slot| slot.clone().expect("every processor fills its slot before the barrier"))
            .collect();
        self.state.barrier.wait();
        gathered
    }
}

/// Runs `f` on `size` threads, each with its own [`ThreadCommunicator`], and returns the
/// results ordered by rank.
pub fn run_on_threads<R, F>(size: usize, f: F) -> Vec<R>
where
    R: Send,
    F: Fn(ThreadCommunicator) -> R + Sync,
{
    let communicators = ThreadCommunicator::create_group(size);
    std::thread::scope(|scope| {
        let handles: Vec<_> = communicators
            .into_iter()
            .map(|comm| {
                let f = &f;
                scope.spawn(move || f(comm))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| match handle.join() {
                Ok(result) => result,
                Err(panic) => std::panic::resume_unwind(panic),
            })
            .collect()
    })
}
