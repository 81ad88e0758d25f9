use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use crate::error::{Result, WorkerError};

/// A bounded pool of local TCP ports shared by all concurrently launching
/// workloads.
///
/// Each workload takes two ports (stdout and stderr tunnels) before its spec
/// is submitted and releases them exactly once on termination. The pool is
/// an explicitly constructed handle, injected into every factory, so tests
/// can use isolated pools.
#[derive(Debug)]
pub struct PortPool {
    inner: Mutex<PoolInner>,
    capacity: usize,
}

#[derive(Debug)]
struct PoolInner {
    free: VecDeque<u16>,
    taken: HashSet<u16>,
}

impl PortPool {
    /// Create a pool over a set of ports known to be free on this host.
    /// Duplicates are ignored.
    pub fn new(ports: impl IntoIterator<Item = u16>) -> Self {
        let mut seen = HashSet::new();
        let free: VecDeque<u16> = ports.into_iter().filter(|p| seen.insert(*p)).collect();
        let capacity = free.len();
        Self {
            inner: Mutex::new(PoolInner {
                free,
                taken: HashSet::new(),
            }),
            capacity,
        }
    }

    /// Take a port from the pool.
    ///
    /// Fails fast with [`WorkerError::PortsExhausted`] when none are left;
    /// an empty pool usually means a leak or an undersized range, and
    /// blocking here would only hide it.
    pub fn take(&self) -> Result<u16> {
        let mut inner = self.inner.lock().expect("port pool lock poisoned");
        match inner.free.pop_front() {
            Some(port) => {
                inner.taken.insert(port);
                tracing::debug!(port, free = inner.free.len(), "Port taken");
                Ok(port)
            }
            None => Err(WorkerError::PortsExhausted),
        }
    }

    /// Return a previously taken port to the pool.
    ///
    /// Releasing a port that is not currently taken (double release, or a
    /// port from another pool) is a programmer error and is reported as
    /// [`WorkerError::PortNotTaken`] rather than silently ignored.
    pub fn release(&self, port: u16) -> Result<()> {
        let mut inner = self.inner.lock().expect("port pool lock poisoned");
        if !inner.taken.remove(&port) {
            return Err(WorkerError::PortNotTaken(port));
        }
        inner.free.push_back(port);
        tracing::debug!(port, free = inner.free.len(), "Port released");
        Ok(())
    }

    /// Number of ports currently available.
    pub fn available(&self) -> usize {
        self.inner.lock().expect("port pool lock poisoned").free.len()
    }

    /// Total number of ports managed by this pool.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_and_release_round_trip() {
        let pool = PortPool::new([9000, 9001]);
        assert_eq!(pool.capacity(), 2);

        let a = pool.take().unwrap();
        let b = pool.take().unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.available(), 0);

        pool.release(a).unwrap();
        pool.release(b).unwrap();
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn exhausted_pool_fails_fast() {
        let pool = PortPool::new([9000]);
        let _held = pool.take().unwrap();
        assert!(matches!(pool.take(), Err(WorkerError::PortsExhausted)));
    }

    #[test]
    fn double_release_is_reported() {
        let pool = PortPool::new([9000]);
        let port = pool.take().unwrap();
        pool.release(port).unwrap();
        assert!(matches!(
            pool.release(port),
            Err(WorkerError::PortNotTaken(9000))
        ));
    }

    #[test]
    fn release_of_unknown_port_is_reported() {
        let pool = PortPool::new([9000]);
        assert!(matches!(
            pool.release(12345),
            Err(WorkerError::PortNotTaken(12345))
        ));
    }

    #[test]
    fn duplicate_ports_are_ignored() {
        let pool = PortPool::new([9000, 9000, 9001]);
        assert_eq!(pool.capacity(), 2);
    }
}
