//! # Observable Value
//!
//! A small holder for state that one task produces and several tasks read.
//!
//! Producers replace the whole value; readers get a clone of whichever value
//! was current at the time of the call. Both sides only ever take a short
//! internal lock, so a reader never waits on a slow producer and never sees
//! a half-written value.

use tokio::sync::watch;

/// Latest-value cell shared between a producer task and its readers
///
/// Cloning an `Observable` yields another handle to the same cell.
#[derive(Debug)]
pub struct Observable<T> {
    tx: std::sync::Arc<watch::Sender<T>>,
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            tx: std::sync::Arc::clone(&self.tx),
        }
    }
}

impl<T: Clone> Observable<T> {
    /// Create a cell holding `initial`
    pub fn new(initial: T) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self {
            tx: std::sync::Arc::new(tx),
        }
    }

    /// Replace the current value atomically
    pub fn publish(&self, value: T) {
        self.tx.send_replace(value);
    }

    /// Copy of the most recently published value
    pub fn latest(&self) -> T {
        self.tx.borrow().clone()
    }
}
