//! Admission control.
//!
//! [`ConnectionGate`] counts admitted connections against a fixed ceiling.
//! Every successful [`ConnectionGate::admit`] hands out an [`Admission`];
//! dropping it gives the slot back. A connection that was turned away never
//! holds an `Admission`, so it can never decrement the counter.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug)]
struct GateState {
    active: AtomicUsize,
    max: usize,
}

/// Shared connection counter. Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct ConnectionGate {
    state: Arc<GateState>,
}

impl ConnectionGate {
    pub fn new(max_active_connections: usize) -> Self {
        Self {
            state: Arc::new(GateState {
                active: AtomicUsize::new(0),
                max: max_active_connections,
            }),
        }
    }

    /// Try to admit a connection from `remote`.
    ///
    /// Returns `None` when the gate is full. The counter is only touched on
    /// success.
    pub fn admit(&self, remote: &str) -> Option<Admission> {
        let max = self.state.max;
        let claimed = self
            .state
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            });

        match claimed {
            Ok(previous) => {
                tracing::info!("NEW CONN {} TOTAL {}", remote, previous + 1);
                Some(Admission {
                    state: Arc::clone(&self.state),
                    remote: remote.to_string(),
                })
            }
            Err(current) => {
                tracing::info!("MAX CONN REACHED {}/{} DROP: {}", current, max, remote);
                None
            }
        }
    }

    /// Number of connections currently admitted.
    pub fn active(&self) -> usize {
        self.state.active.load(Ordering::Acquire)
    }

    pub fn max(&self) -> usize {
        self.state.max
    }
}

/// Proof that a connection holds a slot in the gate.
///
/// The slot is returned exactly once, either through [`Admission::release`]
/// or when the value is dropped.
#[derive(Debug)]
pub struct Admission {
    state: Arc<GateState>,
    remote: String,
}

impl Admission {
    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Give the slot back now instead of waiting for drop.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        let previous = self.state.active.fetch_sub(1, Ordering::AcqRel);
        tracing::info!("CONN CLOSED {} TOTAL {}", self.remote, previous - 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_the_limit() {
        let gate = ConnectionGate::new(2);
        let a = gate.admit("10.0.0.1");
        let b = gate.admit("10.0.0.2");
        assert!(a.is_some());
        assert!(b.is_some());
        assert_eq!(gate.active(), 2);

        assert!(gate.admit("10.0.0.3").is_none());
        assert_eq!(gate.active(), 2, "rejection must not touch the counter");
    }

    #[test]
    fn release_frees_a_slot() {
        let gate = ConnectionGate::new(1);
        let a = gate.admit("10.0.0.1").unwrap();
        assert!(gate.admit("10.0.0.2").is_none());

        a.release();
        assert_eq!(gate.active(), 0);

        let c = gate.admit("10.0.0.3");
        assert!(c.is_some());
        assert_eq!(gate.active(), 1);
    }

    #[test]
    fn drop_releases_exactly_once() {
        let gate = ConnectionGate::new(3);
        {
            let _a = gate.admit("10.0.0.1").unwrap();
            let _b = gate.admit("10.0.0.2").unwrap();
            assert_eq!(gate.active(), 2);
        }
        assert_eq!(gate.active(), 0);

        // A rejected connection has nothing to release.
        let full = ConnectionGate::new(0);
        assert!(full.admit("10.0.0.9").is_none());
        assert_eq!(full.active(), 0);
    }

    #[test]
    fn concurrent_admits_never_exceed_the_limit() {
        let gate = ConnectionGate::new(5);
        let handles: Vec<_> = (0..32)
            .map(|i| {
                let gate = gate.clone();
                std::thread::spawn(move || {
                    let mut held = Vec::new();
                    for j in 0..50 {
                        if let Some(a) = gate.admit(&format!("10.0.{i}.{j}")) {
                            assert!(gate.active() <= gate.max());
                            held.push(a);
                        }
                        if j % 3 == 0 {
                            held.pop();
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(gate.active(), 0);
    }
}
