//! Process groups, communicator proxies and domain rules.
//!
//! Real message-passing bindings stay behind the [`CommProxy`] trait; the
//! crate ships a trivial single-process communicator and a loopback
//! communicator connecting in-process ranks, which the distributed protocols
//! are exercised against.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Barrier, Condvar, Mutex, RwLock};

use num_complex::Complex64;
use rustc_hash::FxHashMap;

use crate::error::TneError;
use crate::types::{GroupId, ProcessRank};

/// Id of the permanent world group (all ranks).
pub const WORLD_GROUP: GroupId = 0;

/// Id of the permanent self group (the local rank only).
pub const SELF_GROUP: GroupId = 1;

/// Result of splitting a communicator: the subgroup communicator plus the
/// parent-relative rank indices of its members, in subgroup rank order.
pub struct SplitResult {
    pub comm: Arc<dyn CommProxy>,
    pub members: Vec<usize>,
}

/// Communicator proxy: the engine-facing contract of a message-passing
/// runtime. All collective calls are synchronous with respect to the ranks of
/// the communicator.
pub trait CommProxy: Send + Sync {
    /// Rank of the calling process within this communicator.
    fn rank(&self) -> usize;

    /// Number of ranks in this communicator.
    fn size(&self) -> usize;

    /// Broadcasts `data` from `root` to all ranks; receivers may pass an
    /// empty buffer.
    fn broadcast(&self, data: &mut Vec<Complex64>, root: usize) -> Result<(), TneError>;

    /// Element-wise sum over all ranks, result visible everywhere.
    fn allreduce_sum(&self, data: &mut [Complex64]) -> Result<(), TneError>;

    /// Point-to-point send, pairwise ordered with respect to `to`.
    fn send(&self, data: &[Complex64], to: usize) -> Result<(), TneError>;

    /// Point-to-point receive, pairwise ordered with respect to `from`.
    fn recv(&self, from: usize) -> Result<Vec<Complex64>, TneError>;

    /// Blocks until all ranks arrive.
    fn barrier(&self);

    /// Splits the communicator by color; a negative color excludes the
    /// calling rank and yields `None`. Collective over all ranks.
    fn split(&self, color: i32) -> Option<SplitResult>;
}

/// The trivial communicator of a single process.
#[derive(Debug, Default)]
pub struct SelfComm;

impl CommProxy for SelfComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn broadcast(&self, _data: &mut Vec<Complex64>, root: usize) -> Result<(), TneError> {
        if root != 0 {
            return Err(TneError::CollectiveFailure(format!(
                "broadcast root {root} outside a single-rank group"
            )));
        }
        Ok(())
    }

    fn allreduce_sum(&self, _data: &mut [Complex64]) -> Result<(), TneError> {
        Ok(())
    }

    fn send(&self, _data: &[Complex64], to: usize) -> Result<(), TneError> {
        Err(TneError::CollectiveFailure(format!(
            "no rank {to} in a single-rank group"
        )))
    }

    fn recv(&self, from: usize) -> Result<Vec<Complex64>, TneError> {
        Err(TneError::CollectiveFailure(format!(
            "no rank {from} in a single-rank group"
        )))
    }

    fn barrier(&self) {}

    fn split(&self, color: i32) -> Option<SplitResult> {
        (color >= 0).then(|| SplitResult {
            comm: Arc::new(SelfComm),
            members: vec![0],
        })
    }
}

type SubworldMap = FxHashMap<i32, (Arc<LoopbackShared>, Arc<Barrier>, Vec<usize>)>;

#[derive(Default)]
struct LoopbackShared {
    slot: Mutex<Option<Vec<Complex64>>>,
    reduce: Mutex<(usize, Vec<Complex64>)>,
    mailboxes: Mutex<FxHashMap<(usize, usize), Vec<Vec<Complex64>>>>,
    mail_cv: Condvar,
    colors: Mutex<Vec<i32>>,
    subworlds: Mutex<Option<SubworldMap>>,
}

/// In-process communicator connecting `size` threads as ranks. Used to
/// exercise the collective protocols without a message-passing runtime.
pub struct LoopbackComm {
    rank: usize,
    size: usize,
    shared: Arc<LoopbackShared>,
    barrier: Arc<Barrier>,
}

impl LoopbackComm {
    /// Creates a connected world of `size` ranks, one communicator per rank.
    #[must_use]
    pub fn world(size: usize) -> Vec<Arc<dyn CommProxy>> {
        let shared = Arc::new(LoopbackShared {
            colors: Mutex::new(vec![0; size]),
            ..LoopbackShared::default()
        });
        let barrier = Arc::new(Barrier::new(size));
        (0..size)
            .map(|rank| {
                Arc::new(LoopbackComm {
                    rank,
                    size,
                    shared: Arc::clone(&shared),
                    barrier: Arc::clone(&barrier),
                }) as Arc<dyn CommProxy>
            })
            .collect()
    }
}

impl CommProxy for LoopbackComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn broadcast(&self, data: &mut Vec<Complex64>, root: usize) -> Result<(), TneError> {
        if root >= self.size {
            return Err(TneError::CollectiveFailure(format!(
                "broadcast root {root} outside group of size {}",
                self.size
            )));
        }
        if self.rank == root {
            *self.shared.slot.lock().unwrap() = Some(data.clone());
        }
        self.barrier.wait();
        if self.rank != root {
            *data = self.shared.slot.lock().unwrap().clone().unwrap();
        }
        self.barrier.wait();
        if self.rank == root {
            *self.shared.slot.lock().unwrap() = None;
        }
        Ok(())
    }

    fn allreduce_sum(&self, data: &mut [Complex64]) -> Result<(), TneError> {
        {
            let mut reduce = self.shared.reduce.lock().unwrap();
            if reduce.0 == 0 {
                reduce.1 = data.to_vec();
            } else {
                if reduce.1.len() != data.len() {
                    return Err(TneError::CollectiveFailure(
                        "allreduce length mismatch across ranks".to_string(),
                    ));
                }
                for (acc, value) in reduce.1.iter_mut().zip(data.iter()) {
                    *acc += value;
                }
            }
            reduce.0 += 1;
        }
        self.barrier.wait();
        data.copy_from_slice(&self.shared.reduce.lock().unwrap().1);
        self.barrier.wait();
        self.shared.reduce.lock().unwrap().0 = 0;
        self.barrier.wait();
        Ok(())
    }

    fn send(&self, data: &[Complex64], to: usize) -> Result<(), TneError> {
        if to >= self.size {
            return Err(TneError::CollectiveFailure(format!("no rank {to}")));
        }
        let mut mailboxes = self.shared.mailboxes.lock().unwrap();
        mailboxes
            .entry((self.rank, to))
            .or_default()
            .push(data.to_vec());
        self.shared.mail_cv.notify_all();
        Ok(())
    }

    fn recv(&self, from: usize) -> Result<Vec<Complex64>, TneError> {
        if from >= self.size {
            return Err(TneError::CollectiveFailure(format!("no rank {from}")));
        }
        let mut mailboxes = self.shared.mailboxes.lock().unwrap();
        loop {
            if let Some(queue) = mailboxes.get_mut(&(from, self.rank)) {
                if !queue.is_empty() {
                    return Ok(queue.remove(0));
                }
            }
            mailboxes = self.shared.mail_cv.wait(mailboxes).unwrap();
        }
    }

    fn barrier(&self) {
        self.barrier.wait();
    }

    fn split(&self, color: i32) -> Option<SplitResult> {
        // Gather all colors.
        {
            self.shared.colors.lock().unwrap()[self.rank] = color;
        }
        self.barrier.wait();
        // Rank 0 builds one shared state per distinct color.
        if self.rank == 0 {
            let colors = self.shared.colors.lock().unwrap().clone();
            let mut subworlds: SubworldMap = FxHashMap::default();
            for &c in colors.iter().filter(|&&c| c >= 0) {
                if subworlds.contains_key(&c) {
                    continue;
                }
                let members: Vec<usize> =
                    (0..self.size).filter(|&r| colors[r] == c).collect();
                let shared = Arc::new(LoopbackShared {
                    colors: Mutex::new(vec![0; members.len()]),
                    ..LoopbackShared::default()
                });
                let barrier = Arc::new(Barrier::new(members.len()));
                subworlds.insert(c, (shared, barrier, members));
            }
            *self.shared.subworlds.lock().unwrap() = Some(subworlds);
        }
        self.barrier.wait();
        let result = if color >= 0 {
            let subworlds = self.shared.subworlds.lock().unwrap();
            let (shared, barrier, members) = subworlds.as_ref().unwrap()[&color].clone();
            let sub_rank = members.iter().position(|&r| r == self.rank).unwrap();
            Some(SplitResult {
                comm: Arc::new(LoopbackComm {
                    rank: sub_rank,
                    size: members.len(),
                    shared,
                    barrier,
                }),
                members,
            })
        } else {
            None
        };
        self.barrier.wait();
        if self.rank == 0 {
            *self.shared.subworlds.lock().unwrap() = None;
        }
        result
    }
}

/// A set of ranks collectively owning and operating on tensors.
#[derive(Clone)]
pub struct ProcessGroup {
    id: GroupId,
    ranks: Vec<ProcessRank>,
    comm: Arc<dyn CommProxy>,
    memory_limit: u64,
}

impl std::fmt::Debug for ProcessGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessGroup")
            .field("id", &self.id)
            .field("ranks", &self.ranks)
            .field("memory_limit", &self.memory_limit)
            .finish()
    }
}

impl ProcessGroup {
    /// Creates a group over the given sorted global ranks.
    pub fn new(
        id: GroupId,
        mut ranks: Vec<ProcessRank>,
        comm: Arc<dyn CommProxy>,
        memory_limit: u64,
    ) -> Self {
        ranks.sort_unstable();
        ranks.dedup();
        assert_eq!(
            ranks.len(),
            comm.size(),
            "rank list must match communicator size"
        );
        Self {
            id,
            ranks,
            comm,
            memory_limit,
        }
    }

    /// Group id within the registry.
    #[must_use]
    pub fn id(&self) -> GroupId {
        self.id
    }

    /// Sorted global ranks of the group.
    #[must_use]
    pub fn ranks(&self) -> &[ProcessRank] {
        &self.ranks
    }

    /// Number of ranks.
    #[must_use]
    pub fn size(&self) -> usize {
        self.ranks.len()
    }

    /// Whether the global rank is a member.
    #[must_use]
    pub fn contains(&self, rank: ProcessRank) -> bool {
        self.ranks.binary_search(&rank).is_ok()
    }

    /// Whether every rank of `self` is also in `other`.
    #[must_use]
    pub fn is_subset_of(&self, other: &ProcessGroup) -> bool {
        self.ranks.iter().all(|&rank| other.contains(rank))
    }

    /// Per-process memory cap in bytes.
    #[must_use]
    pub fn memory_limit(&self) -> u64 {
        self.memory_limit
    }

    /// The communicator proxy of the group.
    #[must_use]
    pub fn comm(&self) -> &Arc<dyn CommProxy> {
        &self.comm
    }
}

/// Registry of live process groups. The world and self groups are permanent;
/// derived groups are reference-counted by the tensors using them.
pub struct GroupRegistry {
    inner: RwLock<FxHashMap<GroupId, (Arc<ProcessGroup>, usize)>>,
    next_id: AtomicU32,
}

impl GroupRegistry {
    /// Creates a registry holding the permanent world and self groups.
    #[must_use]
    pub fn new(world_comm: Arc<dyn CommProxy>, memory_limit: u64) -> Self {
        let world_size = world_comm.size();
        let my_rank = world_comm.rank() as ProcessRank;
        let world = Arc::new(ProcessGroup::new(
            WORLD_GROUP,
            (0..world_size as ProcessRank).collect(),
            world_comm,
            memory_limit,
        ));
        let self_group = Arc::new(ProcessGroup::new(
            SELF_GROUP,
            vec![my_rank],
            Arc::new(SelfComm),
            memory_limit,
        ));
        let mut groups = FxHashMap::default();
        groups.insert(WORLD_GROUP, (world, 1));
        groups.insert(SELF_GROUP, (self_group, 1));
        Self {
            inner: RwLock::new(groups),
            next_id: AtomicU32::new(2),
        }
    }

    /// The world group.
    #[must_use]
    pub fn world(&self) -> Arc<ProcessGroup> {
        self.get(WORLD_GROUP).unwrap()
    }

    /// Looks up a group by id.
    #[must_use]
    pub fn get(&self, id: GroupId) -> Option<Arc<ProcessGroup>> {
        self.inner.read().unwrap().get(&id).map(|(g, _)| Arc::clone(g))
    }

    /// Splits a group by color, registering the subgroup. Returns `None` for
    /// excluded ranks (negative color).
    pub fn split(&self, parent: GroupId, color: i32) -> Option<Arc<ProcessGroup>> {
        let parent = self.get(parent)?;
        let SplitResult { comm, members } = parent.comm().split(color)?;
        let ranks: Vec<ProcessRank> = members
            .into_iter()
            .map(|index| parent.ranks()[index])
            .collect();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let group = Arc::new(ProcessGroup::new(id, ranks, comm, parent.memory_limit()));
        self.inner
            .write()
            .unwrap()
            .insert(id, (Arc::clone(&group), 0));
        Some(group)
    }

    /// Bumps the reference count of a group.
    pub fn retain(&self, id: GroupId) {
        if let Some((_, count)) = self.inner.write().unwrap().get_mut(&id) {
            *count += 1;
        }
    }

    /// Drops one reference; unreferenced derived groups are removed. The
    /// world and self groups are never freed.
    pub fn release(&self, id: GroupId) {
        if id == WORLD_GROUP || id == SELF_GROUP {
            return;
        }
        let mut inner = self.inner.write().unwrap();
        if let Some((_, count)) = inner.get_mut(&id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                inner.remove(&id);
            }
        }
    }
}

/// Determines the execution domain of an operation: the smallest existence
/// domain among the operand groups. The domains must be properly nested.
pub fn execution_domain(groups: &[Arc<ProcessGroup>]) -> Result<Arc<ProcessGroup>, TneError> {
    assert!(!groups.is_empty(), "an operation needs at least one operand");
    let mut sorted: Vec<&Arc<ProcessGroup>> = groups.iter().collect();
    sorted.sort_by_key(|group| group.size());
    for pair in sorted.windows(2) {
        if !pair[0].is_subset_of(pair[1]) {
            return Err(TneError::DomainNesting(format!(
                "group {:?} is not contained in group {:?}",
                pair[0].ranks(),
                pair[1].ranks()
            )));
        }
    }
    Ok(Arc::clone(sorted[0]))
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::thread;

    #[test]
    fn test_self_comm_is_trivial() {
        let comm = SelfComm;
        let mut data = vec![Complex64::new(1.0, 2.0)];
        comm.broadcast(&mut data, 0).unwrap();
        comm.allreduce_sum(&mut data).unwrap();
        assert_eq!(data, vec![Complex64::new(1.0, 2.0)]);
        assert!(comm.broadcast(&mut data, 1).is_err());
        assert!(comm.split(-1).is_none());
        assert!(comm.split(0).is_some());
    }

    #[test]
    fn test_loopback_broadcast_all_ranks_identical() {
        let world = LoopbackComm::world(4);
        let payload = vec![Complex64::new(3.5, -1.0), Complex64::new(0.0, 2.0)];
        let handles: Vec<_> = world
            .into_iter()
            .enumerate()
            .map(|(rank, comm)| {
                let expected = payload.clone();
                thread::spawn(move || {
                    let mut data = if rank == 0 { expected.clone() } else { Vec::new() };
                    comm.broadcast(&mut data, 0).unwrap();
                    assert_eq!(data, expected);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_loopback_allreduce() {
        let world = LoopbackComm::world(3);
        let handles: Vec<_> = world
            .into_iter()
            .enumerate()
            .map(|(rank, comm)| {
                thread::spawn(move || {
                    let mut data = vec![Complex64::new(rank as f64, 1.0)];
                    comm.allreduce_sum(&mut data).unwrap();
                    assert_eq!(data, vec![Complex64::new(3.0, 3.0)]);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_loopback_point_to_point() {
        let world = LoopbackComm::world(2);
        let receiver = Arc::clone(&world[1]);
        let sender = Arc::clone(&world[0]);
        let handle = thread::spawn(move || receiver.recv(0).unwrap());
        sender.send(&[Complex64::new(7.0, 0.0)], 1).unwrap();
        assert_eq!(handle.join().unwrap(), vec![Complex64::new(7.0, 0.0)]);
    }

    #[test]
    fn test_loopback_split_by_parity() {
        let world = LoopbackComm::world(4);
        let handles: Vec<_> = world
            .into_iter()
            .enumerate()
            .map(|(rank, comm)| {
                thread::spawn(move || {
                    let split = comm.split((rank % 2) as i32).unwrap();
                    assert_eq!(split.comm.size(), 2);
                    assert_eq!(split.members, vec![rank % 2, rank % 2 + 2]);
                    // The subgroup communicator works on its own.
                    let mut data = vec![Complex64::new(1.0, 0.0)];
                    split.comm.allreduce_sum(&mut data).unwrap();
                    assert_eq!(data[0].re, 2.0);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_domain_nesting() {
        let registry = GroupRegistry::new(Arc::new(SelfComm), 1 << 30);
        let world = registry.world();
        let self_group = registry.get(SELF_GROUP).unwrap();
        let smallest =
            execution_domain(&[Arc::clone(&world), Arc::clone(&self_group)]).unwrap();
        assert_eq!(smallest.id(), SELF_GROUP);
    }

    #[test]
    fn test_group_refcounting() {
        let registry = GroupRegistry::new(Arc::new(SelfComm), 1 << 30);
        let sub = registry.split(WORLD_GROUP, 0).unwrap();
        let id = sub.id();
        registry.retain(id);
        registry.release(id);
        assert!(registry.get(id).is_none());
        // Permanent groups survive release.
        registry.release(WORLD_GROUP);
        assert!(registry.get(WORLD_GROUP).is_some());
    }
}
