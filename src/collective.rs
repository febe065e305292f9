// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Rank rendezvous used during discovery.
//
// One rank starts the statistics server and walks the counter tree; the
// others wait at a barrier and receive the resulting names by broadcast.

use crate::error::{Error, Result};
use crate::registry::CounterRegistry;

use log::{debug, trace};

pub const ROOT_RANK: i32 = 0;

pub trait Collective: Send {
    fn rank(&self) -> i32;
    fn size(&self) -> i32;
    fn barrier(&self) -> Result<()>;
    /// Overwrites `buf` on every rank with the contents it has on `root`.
    fn broadcast(&self, buf: &mut [u8], root: i32) -> Result<()>;

    fn is_root(&self) -> bool {
        self.rank() == ROOT_RANK
    }
}

fn env_int(vars: &[&str]) -> Option<i32> {
    vars.iter()
        .find_map(|v| std::env::var(v).ok().and_then(|s| s.trim().parse().ok()))
}

/// Rank information from the launcher environment, without a transport.
///
/// Every collective is a no-op on a single rank. With more ranks only the
/// root can proceed; other ranks get [`Error::Collective`] from
/// [`Collective::broadcast`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvCollective {
    rank: i32,
    size: i32,
}

impl EnvCollective {
    pub fn new(rank: i32, size: i32) -> Self {
        Self {
            rank,
            size: size.max(1),
        }
    }

    pub fn from_env() -> Self {
        let rank = env_int(&[
            "OMPI_COMM_WORLD_RANK",
            "PMI_RANK",
            "PMIX_RANK",
            "SLURM_PROCID",
        ])
        .unwrap_or(ROOT_RANK);
        let size = env_int(&["OMPI_COMM_WORLD_SIZE", "PMI_SIZE", "SLURM_NTASKS"]).unwrap_or(1);
        Self::new(rank, size)
    }
}

impl Collective for EnvCollective {
    fn rank(&self) -> i32 {
        self.rank
    }

    fn size(&self) -> i32 {
        self.size
    }

    fn barrier(&self) -> Result<()> {
        if self.size > 1 {
            trace!("rank {}: barrier without a transport", self.rank);
        }
        Ok(())
    }

    fn broadcast(&self, _buf: &mut [u8], root: i32) -> Result<()> {
        if self.size == 1 || self.rank == root {
            Ok(())
        } else {
            Err(Error::Collective(format!(
                "rank {} cannot receive from rank {} without MPI",
                self.rank, root
            )))
        }
    }
}

#[cfg(feature = "mpi")]
pub use self::mpi_world::MpiCollective;

#[cfg(feature = "mpi")]
mod mpi_world {
    use super::*;

    use ::mpi::topology::SimpleCommunicator;
    use ::mpi::traits::{Communicator, CommunicatorCollectives, Root};

    /// `MPI_COMM_WORLD` of an application that already initialized MPI.
    #[derive(Debug, Clone, Copy)]
    pub struct MpiCollective {
        rank: i32,
        size: i32,
    }

    impl MpiCollective {
        /// Returns `None` when the application has not initialized MPI.
        pub fn attach() -> Option<Self> {
            if !::mpi::environment::is_initialized() {
                return None;
            }
            let world = SimpleCommunicator::world();
            Some(Self {
                rank: world.rank(),
                size: world.size(),
            })
        }
    }

    impl Collective for MpiCollective {
        fn rank(&self) -> i32 {
            self.rank
        }

        fn size(&self) -> i32 {
            self.size
        }

        fn barrier(&self) -> Result<()> {
            SimpleCommunicator::world().barrier();
            Ok(())
        }

        fn broadcast(&self, buf: &mut [u8], root: i32) -> Result<()> {
            if root < 0 || root >= self.size {
                return Err(Error::Collective(format!("invalid root rank {}", root)));
            }
            SimpleCommunicator::world()
                .process_at_rank(root)
                .broadcast_into(buf);
            Ok(())
        }
    }
}

/// Best available collective for this process.
pub fn world() -> Box<dyn Collective> {
    #[cfg(feature = "mpi")]
    if let Some(c) = MpiCollective::attach() {
        debug!("Using MPI world: rank {} of {}", c.rank(), c.size());
        return Box::new(c);
    }
    let c = EnvCollective::from_env();
    debug!("Using launcher environment: rank {} of {}", c.rank(), c.size());
    Box::new(c)
}

fn broadcast_u64(c: &dyn Collective, value: u64) -> Result<u64> {
    let mut bytes = value.to_ne_bytes();
    c.broadcast(&mut bytes, ROOT_RANK)?;
    Ok(u64::from_ne_bytes(bytes))
}

/// Distributes the root's counter names to every rank.
///
/// The root passes its registry; the others pass an empty one. Three
/// broadcasts follow the barrier: name count, buffer size, then the
/// NUL-separated names.
pub fn share_names(c: &dyn Collective, registry: &CounterRegistry) -> Result<Vec<String>> {
    c.barrier()?;
    let root = c.is_root();

    let count = broadcast_u64(c, if root { registry.len() as u64 } else { 0 })? as usize;
    let mut buf = if root {
        registry.serialize_names()
    } else {
        Vec::new()
    };
    let size = broadcast_u64(c, buf.len() as u64)? as usize;
    buf.resize(size, 0);
    c.broadcast(&mut buf, ROOT_RANK)?;

    let names = CounterRegistry::deserialize_names(&buf, count);
    debug!(
        "rank {}: {} counter names shared ({} bytes)",
        c.rank(),
        names.len(),
        size
    );
    Ok(names)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Pair of fake ranks: the root records every broadcast payload, a
    /// follower replays them in order.
    #[derive(Debug, Clone)]
    pub struct Wire {
        pub rank: i32,
        pub size: i32,
        pub payloads: Arc<Mutex<VecDeque<Vec<u8>>>>,
        pub barriers: Arc<Mutex<usize>>,
    }

    impl Wire {
        pub fn root(size: i32) -> Self {
            Self {
                rank: ROOT_RANK,
                size,
                payloads: Default::default(),
                barriers: Default::default(),
            }
        }

        pub fn follower(&self, rank: i32) -> Self {
            Self {
                rank,
                ..self.clone()
            }
        }
    }

    impl Collective for Wire {
        fn rank(&self) -> i32 {
            self.rank
        }

        fn size(&self) -> i32 {
            self.size
        }

        fn barrier(&self) -> Result<()> {
            *self.barriers.lock().unwrap() += 1;
            Ok(())
        }

        fn broadcast(&self, buf: &mut [u8], root: i32) -> Result<()> {
            let mut payloads = self.payloads.lock().unwrap();
            if self.rank == root {
                payloads.push_back(buf.to_vec());
                return Ok(());
            }
            let payload = payloads
                .pop_front()
                .ok_or_else(|| Error::Collective("nothing was broadcast".into()))?;
            if payload.len() != buf.len() {
                return Err(Error::Collective("size mismatch".into()));
            }
            buf.copy_from_slice(&payload);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::Wire;
    use super::*;

    #[test]
    fn names_reach_other_ranks() {
        let root = Wire::root(2);
        let follower = root.follower(1);

        let registry = CounterRegistry::from_names(["cnt-object-0-a-x", "cnt-object-1-a-b-y"]);
        let sent = share_names(&root, &registry).unwrap();
        assert_eq!(sent, vec!["cnt-object-0-a-x", "cnt-object-1-a-b-y"]);
        assert_eq!(root.payloads.lock().unwrap().len(), 3);

        let received = share_names(&follower, &CounterRegistry::new()).unwrap();
        assert_eq!(received, sent);
        assert!(follower.payloads.lock().unwrap().is_empty());
        assert_eq!(*root.barriers.lock().unwrap(), 2);
    }

    #[test]
    fn empty_registry_shares_nothing() {
        let root = Wire::root(2);
        assert!(share_names(&root, &CounterRegistry::new()).unwrap().is_empty());
        let received = share_names(&root.follower(1), &CounterRegistry::new()).unwrap();
        assert!(received.is_empty());
    }

    #[test]
    fn env_collective_without_transport() {
        let single = EnvCollective::new(0, 1);
        assert!(single.is_root());
        let mut buf = [1u8; 4];
        assert!(single.broadcast(&mut buf, ROOT_RANK).is_ok());

        let root = EnvCollective::new(0, 4);
        let registry = CounterRegistry::from_names(["a"]);
        assert_eq!(share_names(&root, &registry).unwrap(), vec!["a"]);

        let other = EnvCollective::new(3, 4);
        assert!(!other.is_root());
        assert!(matches!(
            share_names(&other, &CounterRegistry::new()),
            Err(Error::Collective(_))
        ));
        assert_eq!(EnvCollective::new(0, 0).size(), 1);
    }
}
