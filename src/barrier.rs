//! N-party rendezvous used to order steps across scenario units.
//!
//! A barrier serves exactly one round: the N-th `wait` releases every waiter,
//! and any later `wait` returns immediately. Tests create a fresh barrier per
//! synchronisation point. There is no timeout; a stalled peer is caught by
//! the per-unit join bound of the owning test.

use std::sync::Mutex;

use tokio::sync::watch;

#[derive(Debug)]
pub struct Barrier {
    name: String,
    parties: usize,
    waiting: Mutex<usize>,
    released: watch::Sender<bool>,
}

impl Barrier {
    pub fn new(parties: usize) -> Self {
        Self::named("barrier", parties)
    }

    /// A barrier whose name shows up in execution trails.
    pub fn named(name: impl Into<String>, parties: usize) -> Self {
        let (released, _) = watch::channel(parties == 0);
        Self {
            name: name.into(),
            parties,
            waiting: Mutex::new(0),
            released,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parties(&self) -> usize {
        self.parties
    }

    /// Number of parties that have arrived so far.
    pub fn arrived(&self) -> usize {
        *self.waiting.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_released(&self) -> bool {
        *self.released.borrow()
    }

    /// Block until all `parties` callers have arrived.
    pub async fn wait(&self) {
        let mut rx = {
            let mut waiting = self.waiting.lock().unwrap_or_else(|e| e.into_inner());
            *waiting += 1;
            if *waiting >= self.parties {
                self.released.send_replace(true);
                return;
            }
            self.released.subscribe()
        };
        // The sender lives as long as `self`, so this only resolves on release.
        let _ = rx.wait_for(|released| *released).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio_test::{assert_pending, assert_ready, task};

    #[test]
    fn third_wait_releases_all_three() {
        let barrier = Barrier::new(3);
        let mut a = task::spawn(barrier.wait());
        let mut b = task::spawn(barrier.wait());
        assert_pending!(a.poll());
        assert_pending!(b.poll());
        assert_eq!(barrier.arrived(), 2);
        assert!(!barrier.is_released());

        let mut c = task::spawn(barrier.wait());
        assert_ready!(c.poll());
        assert!(a.is_woken());
        assert!(b.is_woken());
        assert_ready!(a.poll());
        assert_ready!(b.poll());
    }

    #[test]
    fn fresh_barrier_is_independent() {
        let first = Barrier::new(3);
        let second = Barrier::new(3);
        let mut a = task::spawn(first.wait());
        let mut b = task::spawn(first.wait());
        assert_pending!(a.poll());
        assert_pending!(b.poll());

        let mut unrelated = task::spawn(second.wait());
        assert_pending!(unrelated.poll());
        assert!(!first.is_released());

        let mut c = task::spawn(first.wait());
        assert_ready!(c.poll());
        assert_ready!(a.poll());
        assert_pending!(unrelated.poll());
        assert_eq!(second.arrived(), 1);
    }

    #[test]
    fn single_party_never_blocks() {
        let barrier = Barrier::new(1);
        let mut w = task::spawn(barrier.wait());
        assert_ready!(w.poll());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn releases_across_tasks() {
        let barrier = Arc::new(Barrier::named("answered", 4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let barrier = barrier.clone();
                tokio::spawn(async move { barrier.wait().await })
            })
            .collect();
        for h in handles {
            tokio::time::timeout(std::time::Duration::from_secs(5), h)
                .await
                .expect("barrier did not release")
                .unwrap();
        }
        assert!(barrier.is_released());
        assert_eq!(barrier.name(), "answered");
    }
}
