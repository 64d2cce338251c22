use std::fmt;

/// Identifier of a logical CPU. Ids are dense: a host with N possible CPUs
/// uses ids `0..N`.
pub type CpuId = u32;

/// Sentinel returned by [`crate::TimerHost::current_cpu`] for execution
/// contexts that are not bound to any particular CPU.
pub const INVALID_CPU_ID: CpuId = u32::MAX;

/// A set of CPU ids, backed by a 64-bit mask.
///
/// Equality is cheap; the omni start path snapshots the online set and
/// re-reads it until two consecutive snapshots compare equal.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuSet(u64);

impl CpuSet {
    /// Largest number of CPUs a set can describe.
    pub const MAX_CPUS: u32 = 64;

    pub const fn empty() -> Self {
        CpuSet(0)
    }

    pub fn contains(&self, cpu: CpuId) -> bool {
        cpu < Self::MAX_CPUS && self.0 & (1u64 << cpu) != 0
    }

    pub fn insert(&mut self, cpu: CpuId) {
        debug_assert!(cpu < Self::MAX_CPUS);
        self.0 |= 1u64 << cpu;
    }

    pub fn remove(&mut self, cpu: CpuId) {
        if cpu < Self::MAX_CPUS {
            self.0 &= !(1u64 << cpu);
        }
    }

    pub fn len(&self) -> u32 {
        self.0.count_ones()
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Iterates the member ids in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = CpuId> + '_ {
        let bits = self.0;
        (0..Self::MAX_CPUS).filter(move |cpu| bits & (1u64 << cpu) != 0)
    }
}

impl FromIterator<CpuId> for CpuSet {
    fn from_iter<I: IntoIterator<Item = CpuId>>(iter: I) -> Self {
        let mut set = CpuSet::empty();
        for cpu in iter {
            set.insert(cpu);
        }
        set
    }
}

impl fmt::Debug for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}
