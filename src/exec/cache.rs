//! Compute-once memoization for in-flight async work.
//!
//! ## Why not a plain `OnceCell`?
//!
//! Conversion results must be computed at most once per build node, but the
//! computation is asynchronous, can fail, and can be cancelled. Three rules
//! fall out of that:
//!
//! * Callers that arrive while a computation is in flight suspend on it and
//!   receive its single outcome, success or failure, without re-running it.
//! * A *completed* failure is not cached. External tools fail for transient
//!   reasons (disk pressure, a killed child); poisoning the node forever
//!   would turn one hiccup into a permanently broken document. The next
//!   caller simply tries again.
//! * A cancelled computation leaves the slot empty, so a later caller gets a
//!   fresh attempt instead of waiting on work that will never finish.

use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use super::lock;
use crate::error::BuildError;

enum Slot<T> {
    Empty,
    /// A leader is computing; queued followers receive the outcome.
    InFlight(Vec<oneshot::Sender<Result<T, Arc<BuildError>>>>),
    Ready(T),
}

/// A single lazily-computed, shareable value.
pub struct AsyncCache<T> {
    slot: Mutex<Slot<T>>,
}

enum Role<T> {
    Value(T),
    Follower(oneshot::Receiver<Result<T, Arc<BuildError>>>),
    Leader,
}

impl<T: Clone> AsyncCache<T> {
    pub fn new() -> AsyncCache<T> {
        AsyncCache {
            slot: Mutex::new(Slot::Empty),
        }
    }

    /// Return the cached value, computing it via `compute` if this caller is
    /// first. Concurrent callers share one computation; `compute` closures
    /// from the others are dropped unused.
    pub async fn get<F, Fut>(&self, compute: F) -> Result<T, BuildError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, BuildError>>,
    {
        let mut compute = Some(compute);
        loop {
            let role = {
                let mut slot = lock(&self.slot);
                match &mut *slot {
                    Slot::Ready(value) => Role::Value(value.clone()),
                    Slot::Empty => {
                        *slot = Slot::InFlight(Vec::new());
                        Role::Leader
                    }
                    Slot::InFlight(waiters) => {
                        let (sender, receiver) = oneshot::channel();
                        waiters.push(sender);
                        Role::Follower(receiver)
                    }
                }
            };
            match role {
                Role::Value(value) => return Ok(value),
                Role::Follower(receiver) => match receiver.await {
                    Ok(Ok(value)) => return Ok(value),
                    Ok(Err(err)) => return Err(BuildError::shared(err)),
                    // The leader was cancelled mid-flight. Take another
                    // turn; this caller may now become the leader itself.
                    Err(_) => continue,
                },
                Role::Leader => {
                    let compute = compute.take().expect("a caller leads at most once");
                    return self.lead(compute()).await;
                }
            }
        }
    }

    /// Run the computation as the leader and fan the outcome out to every
    /// queued follower.
    async fn lead<Fut>(&self, future: Fut) -> Result<T, BuildError>
    where
        Fut: std::future::Future<Output = Result<T, BuildError>>,
    {
        // If this future is dropped before completion the guard empties the
        // slot, waking followers into a retry.
        let mut reset = ResetOnDrop {
            slot: &self.slot,
            armed: true,
        };
        let result = future.await;

        let waiters = {
            let mut slot = lock(&self.slot);
            let waiters = match std::mem::replace(&mut *slot, Slot::Empty) {
                Slot::InFlight(waiters) => waiters,
                // Only the leader moves the slot out of InFlight.
                _ => Vec::new(),
            };
            if let Ok(value) = &result {
                *slot = Slot::Ready(value.clone());
            }
            waiters
        };
        reset.disarm();

        match result {
            Ok(value) => {
                for waiter in waiters {
                    let _ = waiter.send(Ok(value.clone()));
                }
                Ok(value)
            }
            Err(err) => {
                let err = Arc::new(err);
                for waiter in waiters {
                    let _ = waiter.send(Err(Arc::clone(&err)));
                }
                Err(BuildError::shared(err))
            }
        }
    }
}

impl<T: Clone> Default for AsyncCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

struct ResetOnDrop<'a, T> {
    slot: &'a Mutex<Slot<T>>,
    armed: bool,
}

impl<T> ResetOnDrop<'_, T> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<T> Drop for ResetOnDrop<'_, T> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut slot = lock(self.slot);
        if matches!(*slot, Slot::InFlight(_)) {
            *slot = Slot::Empty;
        }
    }
}
