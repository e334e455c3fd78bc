// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The fast-MMIO bypass.
//!
//! A restricted class of MMIO accesses is resolved with a single compact
//! [`FastMmio`] record carried in the channel's I/O buffer instead of a full
//! tunnel round trip. The VMM emulates strictly from the record's contents;
//! the general tunnel payload is not consulted for these exits.

use haxdef::FastMmio;
use haxdef::FastMmioDirection;
use std::mem::offset_of;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

/// Control register snapshot carried with every fast-MMIO record, so the VMM
/// can emulate page-table-dependent effects without a second round trip.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct CrSnapshot {
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
}

impl CrSnapshot {
    pub(crate) fn from_record(record: &FastMmio) -> Self {
        Self { cr0: record.cr0, cr2: record.cr2, cr3: record.cr3, cr4: record.cr4 }
    }

    pub(crate) fn record(
        &self,
        gpa: u64,
        value: u64,
        size: u8,
        direction: FastMmioDirection,
    ) -> FastMmio {
        FastMmio {
            gpa,
            value,
            size,
            direction,
            reg_index: 0,
            pad0: 0,
            cr0: self.cr0,
            cr2: self.cr2,
            cr3: self.cr3,
            cr4: self.cr4,
        }
    }
}

/// Whether an MMIO access may take the bypass.
///
/// Eligible accesses are single (non-string) transfers of 1, 2, 4, or 8
/// bytes, naturally aligned for their size. Natural alignment also keeps the
/// access within one 4 KiB page. Everything else — and anything with side
/// effects beyond the address/value/size/direction tuple plus the control
/// registers — takes the general MMIO tunnel exit.
pub fn fast_mmio_eligible(gpa: u64, size: u8) -> bool {
    matches!(size, 1 | 2 | 4 | 8) && gpa % u64::from(size) == 0
}

pub(crate) fn write_record(iobuf: &mut [u8], record: &FastMmio) {
    record.write_to_prefix(iobuf).expect("I/O buffer holds a fast MMIO record");
}

pub(crate) fn read_record(iobuf: &[u8]) -> FastMmio {
    FastMmio::read_from_prefix(iobuf).expect("I/O buffer holds a fast MMIO record").0
}

/// The record's value field bytes, for reporting a read result in place.
pub(crate) fn value_bytes(iobuf: &mut [u8]) -> &mut [u8; 8] {
    const START: usize = offset_of!(FastMmio, value);
    (&mut iobuf[START..START + 8]).try_into().expect("value field is 8 bytes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eligibility() {
        assert!(fast_mmio_eligible(0xfed0_0000, 1));
        assert!(fast_mmio_eligible(0xfed0_0004, 4));
        assert!(fast_mmio_eligible(0xfed0_0ff8, 8));
        // Unaligned or odd-sized accesses take the general path.
        assert!(!fast_mmio_eligible(0xfed0_0002, 4));
        assert!(!fast_mmio_eligible(0xfed0_0000, 3));
        assert!(!fast_mmio_eligible(0xfed0_0000, 16));
        // An aligned access cannot straddle a page.
        assert!(fast_mmio_eligible(0xfed0_1000 - 8, 8));
    }

    #[test]
    fn record_round_trip() {
        let cr = CrSnapshot { cr0: 1, cr2: 2, cr3: 3, cr4: 4 };
        let mut buf = vec![0u8; 64];
        write_record(&mut buf, &cr.record(0x1000, 0x55aa, 4, FastMmioDirection::WRITE));
        let record = read_record(&buf);
        assert_eq!(record.gpa, 0x1000);
        assert_eq!(record.value, 0x55aa);
        assert_eq!(record.size, 4);
        assert_eq!(record.direction, FastMmioDirection::WRITE);
        assert_eq!(record.reg_index, 0);
        assert_eq!(CrSnapshot::from_record(&record), cr);

        value_bytes(&mut buf).copy_from_slice(&0x77u64.to_ne_bytes());
        assert_eq!(read_record(&buf).value, 0x77);
    }
}
