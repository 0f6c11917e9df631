//! Communicator abstraction for the collective parts of the crate.
//!
//! Production runs use one process per rank (`MpiComm`, behind the `mpi`
//! feature). `ThreadComm` runs a rank group inside one process, one thread per
//! rank; it is what the tests and single-node conversions use.

use parking_lot::Mutex;
use std::sync::{Arc, Barrier};

pub trait Communicator {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;
    /// Blocks until every rank of the communicator reached the same call.
    fn barrier(&self);
    /// Element-wise global sum; every rank ends up with the reduced values.
    fn sum_in_place(&self, values: &mut [f64]);

    fn is_root(&self) -> bool {
        self.rank() == 0
    }
}

/// The trivial single-rank communicator.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelfComm;

impl Communicator for SelfComm {
    fn rank(&self) -> usize {
        0
    }
    fn size(&self) -> usize {
        1
    }
    fn barrier(&self) {}
    fn sum_in_place(&self, _values: &mut [f64]) {}
}

#[derive(Debug)]
struct Shared {
    barrier: Barrier,
    accumulator: Mutex<Vec<f64>>,
}

/// One rank of an in-process group. Cloning gives another handle to the same rank.
#[derive(Debug, Clone)]
pub struct ThreadComm {
    rank: usize,
    size: usize,
    shared: Arc<Shared>,
}

impl Communicator for ThreadComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn barrier(&self) {
        self.shared.barrier.wait();
    }

    fn sum_in_place(&self, values: &mut [f64]) {
        // Drain readers of the previous reduction before resetting.
        self.shared.barrier.wait();
        if self.rank == 0 {
            let mut acc = self.shared.accumulator.lock();
            acc.clear();
            acc.resize(values.len(), 0.0);
        }
        self.shared.barrier.wait();
        {
            let mut acc = self.shared.accumulator.lock();
            for (a, v) in acc.iter_mut().zip(values.iter()) {
                *a += *v;
            }
        }
        self.shared.barrier.wait();
        {
            let acc = self.shared.accumulator.lock();
            values.copy_from_slice(&acc[..values.len()]);
        }
        self.shared.barrier.wait();
    }
}

/// Spawns rank groups made of scoped threads.
pub struct ThreadGroup;

impl ThreadGroup {
    /// Creates `size` communicators sharing one barrier, ordered by rank.
    pub fn communicators(size: usize) -> Vec<ThreadComm> {
        let shared = Arc::new(Shared {
            barrier: Barrier::new(size.max(1)),
            accumulator: Mutex::new(Vec::new()),
        });
        (0..size)
            .map(|rank| ThreadComm {
                rank,
                size,
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    /// Runs `f` once per rank on its own thread and returns the results in rank order.
    pub fn run<R, F>(size: usize, f: F) -> Vec<R>
    where
        R: Send,
        F: Fn(ThreadComm) -> R + Sync,
    {
        let comms = Self::communicators(size);
        let f = &f;
        std::thread::scope(|scope| {
            let handles: Vec<_> = comms
                .into_iter()
                .map(|comm| scope.spawn(move || f(comm)))
                .collect();
            handles
                .into_iter()
                .map(|h| match h.join() {
                    Ok(r) => r,
                    Err(payload) => std::panic::resume_unwind(payload),
                })
                .collect()
        })
    }
}

#[cfg(feature = "mpi")]
pub use self::mpi_comm::MpiComm;

#[cfg(feature = "mpi")]
mod mpi_comm {
    use super::Communicator;
    use mpi::collective::SystemOperation;
    use mpi::topology::SimpleCommunicator;
    use mpi::traits::*;

    /// Wraps an rsmpi communicator, typically `universe.world()`.
    pub struct MpiComm {
        world: SimpleCommunicator,
    }

    impl MpiComm {
        pub fn new(world: SimpleCommunicator) -> Self {
            Self { world }
        }
    }

    impl Communicator for MpiComm {
        fn rank(&self) -> usize {
            self.world.rank() as usize
        }

        fn size(&self) -> usize {
            self.world.size() as usize
        }

        fn barrier(&self) {
            self.world.barrier();
        }

        fn sum_in_place(&self, values: &mut [f64]) {
            let send = values.to_vec();
            self.world
                .all_reduce_into(&send[..], values, SystemOperation::sum());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_comm_is_a_single_root_rank() {
        let comm = SelfComm;
        assert_eq!(comm.size(), 1);
        assert!(comm.is_root());
        let mut v = [1.0, 2.0];
        comm.sum_in_place(&mut v);
        assert_eq!(v, [1.0, 2.0]);
    }

    #[test]
    fn thread_group_sums_across_ranks() {
        let results = ThreadGroup::run(4, |comm| {
            let mut v = vec![comm.rank() as f64, 1.0];
            comm.sum_in_place(&mut v);
            // a second reduction must not see leftovers of the first
            let mut w = vec![2.0];
            comm.sum_in_place(&mut w);
            (comm.rank(), v, w)
        });
        for (rank, v, w) in results.iter() {
            assert_eq!(v, &vec![6.0, 4.0], "rank {rank}");
            assert_eq!(w, &vec![8.0], "rank {rank}");
        }
        let ranks: Vec<usize> = results.iter().map(|r| r.0).collect();
        assert_eq!(ranks, vec![0, 1, 2, 3]);
    }
}
