#![forbid(unsafe_code)]

// Identity allocation. The identity space [start, start+pool_size-1] is
// partitioned across workers as interleaved arithmetic progressions so no
// two workers can ever produce the same client identifier:
//   worker 0 gets start, start+count, start+2*count, ...
//   worker 1 gets start+1, start+count+1, ...

use std::sync::Mutex;
use tracing::warn;

/// One worker's immutable slice of the identity space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerPartition {
    /// 0-based worker index.
    pub index: u32,
    /// Total workers in the run.
    pub count: u32,
    /// Total identities in the pool across all workers.
    pub pool_size: u64,
    /// First identity number in the pool.
    pub start: u64,
}

impl WorkerPartition {
    /// First identity owned by this worker.
    pub fn base(&self) -> u64 {
        self.start + self.index as u64
    }

    /// Last identity in the whole pool.
    pub fn last(&self) -> u64 {
        self.start + self.pool_size - 1
    }
}

/// Thread-safe allocator for unique identities within one worker process.
///
/// Identities are never returned to the pool: a session that disconnects
/// keeps its identity for its whole virtual-user lifetime. Exhausting the
/// pool wraps around to the worker's base identity with a warning rather
/// than failing the run.
pub struct IdentityAllocator {
    partition: WorkerPartition,
    counter: Mutex<u64>,
}

impl IdentityAllocator {
    pub fn new(partition: WorkerPartition) -> Self {
        Self {
            partition,
            counter: Mutex::new(0),
        }
    }

    /// Next unique identity for this worker.
    pub fn next(&self) -> u64 {
        let mut k = self.counter.lock().expect("identity counter poisoned");
        let identity = self.partition.base() + *k * self.partition.count as u64;

        if identity > self.partition.last() {
            warn!(
                worker = self.partition.index,
                pool_size = self.partition.pool_size,
                "identity pool exhausted, wrapping around"
            );
            *k = 1;
            return self.partition.base();
        }

        *k += 1;
        identity
    }

    /// Number of identities handed out so far (wraparound resets this).
    pub fn allocated(&self) -> u64 {
        *self.counter.lock().expect("identity counter poisoned")
    }

    pub fn partition(&self) -> &WorkerPartition {
        &self.partition
    }
}
