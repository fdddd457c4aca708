//! Component I: global frame table, pool, and FIFO eviction.
//!
//! A frame and the page descriptor resident in it form a 1:1 reference
//! cycle; per Design Notes §9 this is modelled as two separately owned
//! tables keyed by a stable id (`FrameNumber`, page VA) rather than by
//! strong reference counting. The table only ever stores a lightweight
//! [`FrameOwner`] back-pointer; eviction itself is driven by the caller
//! (the fault handler / SPT claim path), which is the only place that
//! knows how to reach the owning process's supplemental page table.

use alloc::collections::{btree_map::BTreeMap, vec_deque::VecDeque};

use super::{FrameNumber, SwapError};

/// Identifies the page resident in a frame: which task (by pid) and which
/// virtual address within that task's SPT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameOwner {
    pub pid: u32,
    pub va: u64,
}

pub trait PhysicalFrameAllocator {
    fn allocate(&mut self) -> Option<FrameNumber>;
    fn deallocate(&mut self, frame: FrameNumber);
}

struct FrameDescriptor {
    owner: Option<FrameOwner>,
}

/// Pre-allocated descriptor pool (spec's "e.g. 100") plus unbounded
/// overflow; a FIFO list of in-use frames doubles as the eviction order
/// (a clock second-chance variant is explicitly permitted by the spec but
/// FIFO is simplest and is what this crate implements).
pub struct FrameTable {
    descriptors: BTreeMap<FrameNumber, FrameDescriptor>,
    in_use_fifo: VecDeque<FrameNumber>,
    free_pool: VecDeque<FrameNumber>,
}

impl FrameTable {
    pub fn new() -> Self {
        FrameTable {
            descriptors: BTreeMap::new(),
            in_use_fifo: VecDeque::new(),
            free_pool: VecDeque::new(),
        }
    }

    /// Obtains a frame for `owner`, evicting the oldest in-use frame via
    /// `evict` if the physical allocator is exhausted.
    ///
    /// `evict` is handed the owner of the chosen victim and must call
    /// `swap_out` on that page (clearing its user PTE) before returning
    /// `Ok`; only then is the victim frame reclaimed.
    pub fn frame_get(
        &mut self,
        owner: FrameOwner,
        alloc: &mut dyn PhysicalFrameAllocator,
        mut evict: impl FnMut(FrameOwner) -> Result<(), SwapError>,
    ) -> Result<FrameNumber, SwapError> {
        let frame = match self.free_pool.pop_front() {
            Some(f) => f,
            None => match alloc.allocate() {
                Some(f) => f,
                None => {
                    let victim = self.get_victim().ok_or(SwapError::DiskError)?;
                    evict(victim)?;
                    self.reclaim(victim);
                    victim
                }
            },
        };

        self.descriptors.insert(frame, FrameDescriptor { owner: Some(owner) });
        self.in_use_fifo.push_back(frame);
        Ok(frame)
    }

    /// Clears the page back-pointer and returns the descriptor to the pool
    /// without actually freeing the physical frame (it's about to be
    /// reused by whichever caller is evicting it).
    fn reclaim(&mut self, frame: FrameNumber) {
        self.in_use_fifo.retain(|f| *f != frame);
        self.descriptors.remove(&frame);
    }

    /// Releases `frame` back to the free pool. Used when a page is
    /// destroyed outright (not evicted for reuse).
    pub fn frame_return(&mut self, frame: FrameNumber) {
        self.in_use_fifo.retain(|f| *f != frame);
        self.descriptors.remove(&frame);
        self.free_pool.push_back(frame);
    }

    fn get_victim(&mut self) -> Option<FrameOwner> {
        let frame = *self.in_use_fifo.front()?;
        self.descriptors.get(&frame)?.owner
    }

    pub fn owner_of(&self, frame: FrameNumber) -> Option<FrameOwner> {
        self.descriptors.get(&frame).and_then(|d| d.owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeAllocator {
        next: u64,
        limit: u64,
    }

    impl PhysicalFrameAllocator for FakeAllocator {
        fn allocate(&mut self) -> Option<FrameNumber> {
            if self.next >= self.limit {
                return None;
            }
            let f = FrameNumber(self.next);
            self.next += 1;
            Some(f)
        }

        fn deallocate(&mut self, _frame: FrameNumber) {}
    }

    #[test]
    fn allocates_until_exhausted_then_evicts() {
        let mut table = FrameTable::new();
        let mut alloc = FakeAllocator { next: 0, limit: 2 };

        let a = table
            .frame_get(FrameOwner { pid: 1, va: 0x1000 }, &mut alloc, |_| Ok(()))
            .unwrap();
        let _b = table
            .frame_get(FrameOwner { pid: 1, va: 0x2000 }, &mut alloc, |_| Ok(()))
            .unwrap();

        let mut evicted = None;
        let c = table
            .frame_get(FrameOwner { pid: 1, va: 0x3000 }, &mut alloc, |victim| {
                evicted = Some(victim);
                Ok(())
            })
            .unwrap();

        assert_eq!(evicted, Some(FrameOwner { pid: 1, va: 0x1000 }));
        assert_eq!(c, a, "the reclaimed frame number should be reused");
    }

    #[test]
    fn frame_return_goes_to_pool_not_allocator() {
        let mut table = FrameTable::new();
        let mut alloc = FakeAllocator { next: 0, limit: 1 };

        let a = table
            .frame_get(FrameOwner { pid: 1, va: 0x1000 }, &mut alloc, |_| Ok(()))
            .unwrap();
        table.frame_return(a);

        let b = table
            .frame_get(FrameOwner { pid: 2, va: 0x4000 }, &mut alloc, |_| {
                panic!("should not need to evict: pool has a free frame")
            })
            .unwrap();
        assert_eq!(a, b);
    }
}
