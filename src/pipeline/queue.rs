use std::collections::VecDeque;

use event_listener::Event;
use parking_lot::Mutex;

/// Fixed-capacity FIFO connecting two pipeline stages.
///
/// Pushes never block: a full (or shut down) queue hands the element back to
/// the caller, which is the backpressure signal every producing stage acts
/// on. Pops come in a non-blocking and an awaited flavor; the awaited pop
/// parks on an event until an element arrives or the queue is shut down.
///
/// Shutdown is irreversible and wakes every waiter. A shut-down queue
/// rejects pushes and keeps handing out leftover elements until it is empty,
/// so consuming stages settle in-flight work before seeing `None`, the
/// common exit path of every stage loop.
pub(crate) struct Queue<T> {
    capacity: usize,
    state: Mutex<State<T>>,
    /// Signals element arrival and shutdown to parked poppers.
    ready: Event,
}

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

impl<T> Queue<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Queue {
            capacity,
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            ready: Event::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Appends an element, or hands it back when the queue is full or shut
    /// down.
    pub(crate) fn try_push(&self, item: T) -> Result<(), T> {
        {
            let mut state = self.state.lock();
            if state.closed || state.items.len() >= self.capacity {
                return Err(item);
            }
            state.items.push_back(item);
        }
        self.ready.notify(1);
        Ok(())
    }

    /// Removes the oldest element without waiting.
    pub(crate) fn try_pop(&self) -> Option<T> {
        self.state.lock().items.pop_front()
    }

    /// Removes the oldest element, waiting for one to arrive.
    ///
    /// Returns `None` once the queue has been shut down and drained.
    pub(crate) async fn pop(&self) -> Option<T> {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(item) = state.items.pop_front() {
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }

            // Arm the listener, then re-check: an element pushed between the
            // check above and `listen()` would otherwise be missed.
            let listener = self.ready.listen();
            {
                let mut state = self.state.lock();
                if let Some(item) = state.items.pop_front() {
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }
            listener.await;
        }
    }

    /// Shuts the queue down and wakes every parked popper. Irreversible.
    pub(crate) fn shutdown(&self) {
        self.state.lock().closed = true;
        self.ready.notify(usize::MAX);
    }
}

/// A recyclable pipeline element.
pub(crate) trait Recycle {
    /// Resets the element to its pristine pooled state.
    fn recycle(&mut self);
}

/// Fixed-capacity free list of recycled elements.
///
/// A pool is a queue whose initial contents are the elements themselves;
/// acquiring pops one, releasing recycles it and pushes it back. Every
/// element that leaves the pool has a defined return path, so a release
/// never finds the pool full.
pub(crate) struct Pool<T> {
    queue: Queue<T>,
}

impl<T: Recycle> Pool<T> {
    pub(crate) fn new(capacity: usize, mut fill: impl FnMut() -> T) -> Self {
        let queue = Queue::new(capacity);
        for _ in 0..capacity {
            // Infallible: the queue was created with exactly this capacity.
            let _ = queue.try_push(fill());
        }
        Pool { queue }
    }

    /// Number of free elements currently in the pool.
    #[cfg(test)]
    pub(crate) fn available(&self) -> usize {
        self.queue.len()
    }

    /// Takes a free element, waiting for one if the pool is empty.
    ///
    /// Returns `None` once the pipeline is shutting down.
    pub(crate) async fn acquire(&self) -> Option<T> {
        self.queue.pop().await
    }

    /// Recycles an element and returns it to the free list.
    pub(crate) fn release(&self, mut item: T) {
        item.recycle();
        // The element came from this pool, so there is room for it unless the
        // pool has been shut down, in which case it is simply dropped.
        let _ = self.queue.try_push(item);
    }

    pub(crate) fn shutdown(&self) {
        self.queue.shutdown();
    }
}
