// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The memory resource governor.
//!
//! Process-wide state shared across vCPUs: the RAM registration table, the
//! allocation accounting, and the optional memory quota. A single lock
//! serializes writers; quota check-and-account is one critical section, so
//! concurrent allocation requests from different vCPUs cannot oversubscribe.

use haxdef::AllocRamInfo;
use haxdef::RamFlags;
use haxdef::SetMemlimit;
use haxdef::SetRamInfo;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryError {
    /// Resource exhaustion, distinct from I/O errors: the caller may free
    /// resources and retry. The allocation fails whole, never partially.
    #[error(
        "allocation of {requested:#x} bytes exceeds the memory quota \
         ({used:#x} of {quota:#x} in use)"
    )]
    QuotaExceeded { requested: u64, used: u64, quota: u64 },
    #[error("memory quota cannot change after {allocated:#x} bytes were allocated")]
    LimitAfterAlloc { allocated: u64 },
    #[error("write to read-only memory at {gpa:#x}")]
    WriteToRom { gpa: u64 },
    #[error("allocated block at va {va:#x} ({size:#x} bytes) was never registered")]
    UnregisteredAlloc { va: u64, size: u32 },
}

/// How a guest physical address is to be handled.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Backed by registered RAM at the given host virtual address.
    Ram { va: u64, readonly: bool },
    /// Unregistered or flagged invalid; route to MMIO emulation.
    Mmio,
}

#[derive(Debug, Copy, Clone)]
struct Region {
    size: u32,
    flags: RamFlags,
    va: u64,
}

#[derive(Debug, Copy, Clone)]
struct Alloc {
    size: u32,
    registered: bool,
}

#[derive(Debug, Default)]
struct Inner {
    /// Registered regions, keyed by guest physical start address.
    regions: BTreeMap<u64, Region>,
    /// Allocated blocks, keyed by backing virtual address.
    allocs: BTreeMap<u64, Alloc>,
    quota: Option<u64>,
    allocated: u64,
}

#[derive(Debug, Default)]
pub struct MemoryGovernor {
    inner: Mutex<Inner>,
}

impl MemoryGovernor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables or disables the memory quota. Must precede any allocation.
    pub fn set_memlimit(&self, limit: SetMemlimit) -> Result<(), MemoryError> {
        let mut inner = self.inner.lock();
        if inner.allocated != 0 {
            return Err(MemoryError::LimitAfterAlloc { allocated: inner.allocated });
        }
        inner.quota = (limit.enable_memlimit != 0).then_some(limit.memory_limit);
        Ok(())
    }

    /// Accounts a fresh RAM block against the quota. The block must be
    /// registered with [`set_ram`](Self::set_ram) before guest access.
    pub fn alloc_ram(&self, info: AllocRamInfo) -> Result<(), MemoryError> {
        let mut inner = self.inner.lock();
        let requested = u64::from(info.size);
        if let Some(quota) = inner.quota {
            if inner.allocated + requested > quota {
                tracing::warn!(
                    requested,
                    used = inner.allocated,
                    quota,
                    "RAM allocation exceeds memory quota"
                );
                return Err(MemoryError::QuotaExceeded {
                    requested,
                    used: inner.allocated,
                    quota,
                });
            }
        }
        inner.allocated += requested;
        inner.allocs.insert(info.va, Alloc { size: info.size, registered: false });
        Ok(())
    }

    /// Registers a guest RAM region. Idempotent per `pa_start`: registering
    /// the same start again replaces the prior mapping, latest flags win.
    pub fn set_ram(&self, info: SetRamInfo) {
        let mut inner = self.inner.lock();
        if let Some(alloc) = inner.allocs.get_mut(&info.va) {
            alloc.registered = true;
        }
        let region = Region { size: info.size, flags: info.flags, va: info.va };
        if inner.regions.insert(info.pa_start, region).is_some() {
            tracing::debug!(pa_start = info.pa_start, "replaced RAM registration");
        }
    }

    /// Resolves a guest physical address against the registered set.
    pub fn resolve(&self, gpa: u64) -> Resolution {
        let inner = self.inner.lock();
        let Some((&start, region)) = inner.regions.range(..=gpa).next_back() else {
            return Resolution::Mmio;
        };
        if gpa - start >= u64::from(region.size) || region.flags.invalid() {
            return Resolution::Mmio;
        }
        Resolution::Ram { va: region.va + (gpa - start), readonly: region.flags.rom() }
    }

    /// Validates a guest write: ROM regions reject it, everything else
    /// resolves as usual.
    pub fn validate_write(&self, gpa: u64) -> Result<Resolution, MemoryError> {
        match self.resolve(gpa) {
            Resolution::Ram { readonly: true, .. } => Err(MemoryError::WriteToRom { gpa }),
            resolution => Ok(resolution),
        }
    }

    /// Checks the allocation/registration invariant before the first vCPU
    /// runs: every allocated block must have been registered.
    pub fn verify_registered(&self) -> Result<(), MemoryError> {
        let inner = self.inner.lock();
        match inner.allocs.iter().find(|(_, alloc)| !alloc.registered) {
            Some((&va, alloc)) => Err(MemoryError::UnregisteredAlloc { va, size: alloc.size }),
            None => Ok(()),
        }
    }

    /// Total bytes currently accounted against the quota.
    pub fn allocated(&self) -> u64 {
        self.inner.lock().allocated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VA: u64 = 0x7f00_0000_0000;

    fn ram(pa_start: u64, size: u32, flags: RamFlags, va: u64) -> SetRamInfo {
        SetRamInfo { pa_start, size, flags, pad: [0; 3], va }
    }

    fn memlimit(enable: bool, quota: u64) -> SetMemlimit {
        SetMemlimit { enable_memlimit: enable.into(), pad: [0; 7], memory_limit: quota }
    }

    #[test]
    fn resolve_honors_bounds_and_flags() {
        let governor = MemoryGovernor::new();
        governor.set_ram(ram(0x10000, 0x1000, RamFlags::new(), VA));
        governor.set_ram(ram(0x20000, 0x1000, RamFlags::new().with_rom(true), VA + 0x1000));
        governor.set_ram(ram(0x30000, 0x1000, RamFlags::new().with_invalid(true), 0));

        assert_eq!(governor.resolve(0x10800), Resolution::Ram { va: VA + 0x800, readonly: false });
        assert_eq!(governor.resolve(0x11000), Resolution::Mmio);
        assert_eq!(governor.resolve(0x0), Resolution::Mmio);
        // INVALID routes to MMIO emulation even though registered.
        assert_eq!(governor.resolve(0x30000), Resolution::Mmio);

        assert!(governor.validate_write(0x10800).is_ok());
        assert!(matches!(
            governor.validate_write(0x20010),
            Err(MemoryError::WriteToRom { gpa: 0x20010 })
        ));
    }

    #[test]
    fn reregistration_replaces() {
        let governor = MemoryGovernor::new();
        governor.set_ram(ram(0x10000, 0x1000, RamFlags::new().with_invalid(true), 0));
        assert_eq!(governor.resolve(0x10000), Resolution::Mmio);

        // Same range, different flags: exactly one effective mapping, the
        // latest.
        governor.set_ram(ram(0x10000, 0x1000, RamFlags::new(), VA));
        assert_eq!(governor.resolve(0x10000), Resolution::Ram { va: VA, readonly: false });

        governor.set_ram(ram(0x10000, 0x1000, RamFlags::new().with_rom(true), VA));
        assert_eq!(governor.resolve(0x10000), Resolution::Ram { va: VA, readonly: true });
    }

    #[test]
    fn quota_boundary_is_deterministic() {
        let governor = MemoryGovernor::new();
        governor.set_memlimit(memlimit(true, 0x2000)).unwrap();

        governor.alloc_ram(AllocRamInfo { size: 0x1000, pad: 0, va: VA }).unwrap();
        // Reaching the quota exactly succeeds.
        governor.alloc_ram(AllocRamInfo { size: 0x1000, pad: 0, va: VA + 0x1000 }).unwrap();
        assert_eq!(governor.allocated(), 0x2000);

        let err = governor
            .alloc_ram(AllocRamInfo { size: 1, pad: 0, va: VA + 0x2000 })
            .unwrap_err();
        assert!(matches!(
            err,
            MemoryError::QuotaExceeded { requested: 1, used: 0x2000, quota: 0x2000 }
        ));
        // The failed allocation was not partially accounted.
        assert_eq!(governor.allocated(), 0x2000);
    }

    #[test]
    fn disabled_quota_is_unbounded() {
        let governor = MemoryGovernor::new();
        governor.set_memlimit(memlimit(false, 0x1000)).unwrap();
        governor
            .alloc_ram(AllocRamInfo { size: 0x10_0000, pad: 0, va: VA })
            .unwrap();
    }

    #[test]
    fn memlimit_rejected_after_allocation() {
        let governor = MemoryGovernor::new();
        governor.alloc_ram(AllocRamInfo { size: 0x1000, pad: 0, va: VA }).unwrap();
        let err = governor.set_memlimit(memlimit(true, 0x8000)).unwrap_err();
        assert!(matches!(err, MemoryError::LimitAfterAlloc { allocated: 0x1000 }));
    }

    #[test]
    fn allocations_are_a_subset_of_registrations() {
        let governor = MemoryGovernor::new();
        governor.alloc_ram(AllocRamInfo { size: 0x1000, pad: 0, va: VA }).unwrap();
        assert!(matches!(
            governor.verify_registered(),
            Err(MemoryError::UnregisteredAlloc { va: VA, size: 0x1000 })
        ));

        governor.set_ram(ram(0x10000, 0x1000, RamFlags::new(), VA));
        governor.verify_registered().unwrap();
    }
}
