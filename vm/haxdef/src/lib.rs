// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! HAXM kernel/user boundary definitions.
//!
//! These records are shared verbatim between the kernel-resident hypervisor
//! core and the user-space VMM: both sides compute field offsets from the same
//! layout rules, so field order, width, and padding here are the contract.
//! This crate is pure data; the protocol state machines live in the `hax`
//! crate.

#![no_std]

use bitfield_struct::bitfield;
use core::mem::align_of;
use core::mem::size_of;
use open_enum::open_enum;
use static_assertions::const_assert;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Unaligned;

/// The oldest API version this module can interoperate with.
pub const HAX_LEAST_API_VERSION: u32 = 1;
/// The current API version.
pub const HAX_CUR_API_VERSION: u32 = 4;
/// The API version that introduced the dual-address (`gpa2`) fast-MMIO form.
pub const HAX_API_VERSION_GPA2: u32 = 4;

/// Maximum number of entries in one MSR batch request.
pub const HAX_MAX_MSR_ARRAY: usize = 0x20;

/// `wstatus` bit 0: virtualization is working.
pub const HAX_CAP_STATUS_WORKING: u16 = 0x1;
/// `winfo` (not working): VT-x is not enabled.
pub const HAX_CAP_FAILREASON_VT: u16 = 0x1;
/// `winfo` (not working): NX is not enabled.
pub const HAX_CAP_FAILREASON_NX: u16 = 0x2;
/// `winfo` (working): EPT is enabled.
pub const HAX_CAP_EPT: u16 = 0x1;
/// `winfo` (working): the fast-MMIO bypass is available.
pub const HAX_CAP_FASTMMIO: u16 = 0x2;
/// `winfo` (working): unrestricted guest is available.
pub const HAX_CAP_UG: u16 = 0x4;
/// `winfo` (working): RAM blocks above 4 GiB are supported.
pub const HAX_CAP_64BIT_RAMBLOCK: u16 = 0x8;

/// RAM region flag: read-only.
pub const HAX_RAM_INFO_ROM: u8 = 0x01;
/// RAM region flag: unmapped, routed to MMIO emulation.
pub const HAX_RAM_INFO_INVALID: u8 = 0x80;

open_enum! {
    /// Reason code selecting the tunnel payload variant.
    ///
    /// Open because the peer may be newer than us; an unrecognized code is a
    /// protocol violation that the receiver must treat as fatal for the vCPU,
    /// never silently skip.
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub enum ExitReason: u32 {
        IO = 1,
        MMIO = 2,
        REAL_MODE = 3,
        INTERRUPT = 4,
        UNKNOWN_VMEXIT = 5,
        HLT = 6,
        STATE_CHANGE = 7,
        PAUSED = 8,
        FAST_MMIO = 9,
    }
}

open_enum! {
    /// Direction of a port I/O transfer, from the guest's point of view.
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes, Unaligned)]
    pub enum IoDirection: u8 {
        OUT = 0,
        IN = 1,
    }
}

open_enum! {
    /// Direction of a fast-MMIO transfer.
    ///
    /// `GPA_TO_GPA` moves `size` bytes from `gpa` to `gpa2` and is only valid
    /// once API v4 has been negotiated.
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes, Unaligned)]
    pub enum FastMmioDirection: u8 {
        READ = 0,
        WRITE = 1,
        GPA_TO_GPA = 2,
    }
}

/// One MSR entry in a batch request.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct VmxMsr {
    pub entry: u64,
    pub value: u64,
}

/// A bounded MSR batch: `nr_msr` of the fixed-capacity `entries` are valid,
/// `done` counts the entries the kernel has processed.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct MsrData {
    pub nr_msr: u16,
    pub done: u16,
    pub pad: [u16; 2],
    pub entries: [VmxMsr; HAX_MAX_MSR_ARRAY],
}

/// Legacy x87/SSE state in the Intel FXSAVE format (SDM table 3-56).
///
/// The fip/fcs and fdp/fds encodings overlay the 64-bit IP/DP forms in the
/// original layout; only the 64-bit form is carried here, which is
/// byte-for-byte identical.
#[repr(C, align(16))]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct FxLayout {
    pub fcw: u16,
    pub fsw: u16,
    pub ftw: u8,
    pub res1: u8,
    pub fop: u16,
    pub fpu_ip: u64,
    pub fpu_dp: u64,
    pub mxcsr: u32,
    pub mxcsr_mask: u32,
    pub st_mm: [[u8; 16]; 8],
    pub mmx_1: [[u8; 16]; 8],
    pub mmx_2: [[u8; 16]; 8],
    pub pad: [u8; 96],
}

const_assert!(size_of::<FxLayout>() == 512);
const_assert!(align_of::<FxLayout>() == 16);

/// Size of the tunnel's reason-specific payload area.
pub const TUNNEL_PAYLOAD_SIZE: usize = 24;

/// The per-vCPU exit record shared between the kernel core and the VMM.
///
/// The payload area is an untagged union in the original interface; here it
/// is raw bytes with typed views ([`TunnelIo`], [`TunnelMmio`],
/// [`TunnelState`]) read and written at offset zero. Exactly one view is
/// valid per exit, selected by `exit_reason`.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Tunnel {
    pub exit_reason: ExitReason,
    pub pad0: u32,
    pub exit_status: u32,
    pub user_event_pending: u32,
    pub ready_for_interrupt_injection: i32,
    pub request_interrupt_window: i32,
    pub payload: [u8; TUNNEL_PAYLOAD_SIZE],
}

impl Tunnel {
    pub fn io(&self) -> TunnelIo {
        TunnelIo::read_from_prefix(&self.payload).expect("payload holds an io view").0
    }

    pub fn set_io(&mut self, io: TunnelIo) {
        io.write_to_prefix(&mut self.payload).expect("payload holds an io view");
    }

    pub fn mmio(&self) -> TunnelMmio {
        TunnelMmio::read_from_prefix(&self.payload).expect("payload holds an mmio view").0
    }

    pub fn set_mmio(&mut self, mmio: TunnelMmio) {
        mmio.write_to_prefix(&mut self.payload).expect("payload holds an mmio view");
    }

    pub fn state(&self) -> TunnelState {
        TunnelState::read_from_prefix(&self.payload).expect("payload holds a state view").0
    }

    pub fn set_state(&mut self, state: TunnelState) {
        state.write_to_prefix(&mut self.payload).expect("payload holds a state view");
    }
}

/// Port I/O descriptor, valid when `exit_reason` is [`ExitReason::IO`].
///
/// The data itself travels in the buffer adjoining the tunnel, `count * size`
/// bytes starting at offset zero, processed as a contiguous run in port
/// order. `vaddr` is the kernel core's mapping of that buffer and is owned by
/// it; the VMM must not touch it.
#[repr(C, packed)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes, Unaligned)]
pub struct TunnelIo {
    pub direction: IoDirection,
    pub df: u8,
    pub size: u16,
    pub port: u16,
    pub count: u16,
    pub flags: TunnelIoFlags,
    pub pad0: u8,
    pub pad1: u16,
    pub pad2: u32,
    pub vaddr: u64,
}

#[bitfield(u8)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes, Unaligned)]
pub struct TunnelIoFlags {
    /// Set for string (INS/OUTS) instructions.
    pub string: bool,
    #[bits(7)]
    _reserved: u8,
}

/// MMIO descriptor, valid when `exit_reason` is [`ExitReason::MMIO`].
#[repr(C, packed)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes, Unaligned)]
pub struct TunnelMmio {
    pub gla: u64,
}

/// Placeholder for state-only exits carrying no address payload.
#[repr(C, packed)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes, Unaligned)]
pub struct TunnelState {
    pub dummy: u64,
}

const_assert!(size_of::<Tunnel>() == 48);
const_assert!(size_of::<TunnelIo>() == TUNNEL_PAYLOAD_SIZE);
const_assert!(size_of::<TunnelMmio>() <= TUNNEL_PAYLOAD_SIZE);
const_assert!(size_of::<TunnelState>() <= TUNNEL_PAYLOAD_SIZE);

/// Self-contained fast-MMIO transfer record.
///
/// Carries everything the VMM needs to emulate a simple MMIO access without a
/// second round trip: address, value, size, direction, and the control
/// register snapshot for page-table-dependent effects. Transient; valid only
/// for the duration of one fast-MMIO exit.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct FastMmio {
    pub gpa: u64,
    /// The transfer value, or the second guest physical address when
    /// `direction` is [`FastMmioDirection::GPA_TO_GPA`] (API v4+). The two
    /// forms share this word; the negotiated API version decides which is
    /// meaningful.
    pub value: u64,
    pub size: u8,
    pub direction: FastMmioDirection,
    /// Obsolete; retained for layout compatibility and never consulted.
    pub reg_index: u16,
    pub pad0: u32,
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
}

impl FastMmio {
    /// The second guest physical address of a dual-address transfer.
    ///
    /// Only meaningful under a negotiated API version of at least
    /// [`HAX_API_VERSION_GPA2`]; the `hax` crate gates access on the session.
    pub fn gpa2(&self) -> u64 {
        self.value
    }
}

const_assert!(size_of::<FastMmio>() == 56);

/// Module version record: the compatibility floor plus the current version.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct ModuleVersion {
    pub compat_version: u32,
    pub cur_version: u32,
}

/// VMM-side version record: the current version plus the least version the
/// VMM still supports. Exchanged once, at session start.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct VmmVersion {
    pub cur_version: u32,
    pub least_version: u32,
}

#[bitfield(u16)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct CapStatus {
    /// Virtualization is functional. When clear, `winfo` explains why.
    pub working: bool,
    /// The memory quota mechanism is available.
    pub mem_quota: bool,
    #[bits(14)]
    _reserved: u16,
}

/// Interpretation of `winfo` when the module reports not-working.
#[bitfield(u16)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct CapFailInfo {
    pub vt_disabled: bool,
    pub nx_disabled: bool,
    #[bits(14)]
    _reserved: u16,
}

/// Interpretation of `winfo` when the module reports working.
#[bitfield(u16)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct CapFeatureInfo {
    pub ept: bool,
    pub fast_mmio: bool,
    pub unrestricted_guest: bool,
    pub ram_block_64bit: bool,
    #[bits(12)]
    _reserved: u16,
}

/// Capability information, negotiated once per session.
///
/// Immutable after negotiation except `win_refcount`, which the kernel core
/// updates as host sessions open and close.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct CapabilityInfo {
    pub wstatus: CapStatus,
    /// Failure reasons when not working, feature bits when working.
    pub winfo: u16,
    pub win_refcount: u32,
    pub mem_quota: u64,
}

impl CapabilityInfo {
    /// `winfo` decoded as failure reasons. Valid only when
    /// `wstatus.working()` is false.
    pub fn fail_info(&self) -> CapFailInfo {
        CapFailInfo::from_bits(self.winfo)
    }

    /// `winfo` decoded as feature bits. Valid only when `wstatus.working()`
    /// is true.
    pub fn feature_info(&self) -> CapFeatureInfo {
        CapFeatureInfo::from_bits(self.winfo)
    }
}

const_assert!(size_of::<CapabilityInfo>() == 16);

/// Where a vCPU's tunnel and its adjoining I/O data buffer are mapped, and
/// how large the buffer is. Communicated out of band at channel setup.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct TunnelInfo {
    pub va: u64,
    pub io_va: u64,
    pub size: u16,
    pub pad: [u16; 3],
}

const_assert!(size_of::<TunnelInfo>() == 24);

/// Enables or disables the memory quota.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct SetMemlimit {
    pub enable_memlimit: u8,
    pub pad: [u8; 7],
    pub memory_limit: u64,
}

/// Requests backing for a fresh RAM block, accounted against the quota.
/// Every allocated block must subsequently be registered with
/// [`SetRamInfo`] before guest access.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct AllocRamInfo {
    pub size: u32,
    pub pad: u32,
    pub va: u64,
}

#[bitfield(u8)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct RamFlags {
    /// Read-only; guest writes are rejected.
    pub rom: bool,
    #[bits(6)]
    _reserved: u8,
    /// Unmapped; accesses bypass RAM handling and go to MMIO emulation.
    pub invalid: bool,
}

/// Registers one guest RAM region. Idempotent per `pa_start`: re-registering
/// the same range replaces the prior mapping.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct SetRamInfo {
    pub pa_start: u64,
    pub size: u32,
    pub flags: RamFlags,
    pub pad: [u8; 3],
    pub va: u64,
}

const_assert!(size_of::<SetRamInfo>() == 24);
const_assert!(size_of::<SetMemlimit>() == 16);
const_assert!(size_of::<AllocRamInfo>() == 16);
const_assert!(size_of::<MsrData>() == 8 + HAX_MAX_MSR_ARRAY * size_of::<VmxMsr>());
const_assert!(size_of::<ModuleVersion>() == 8);
const_assert!(size_of::<VmmVersion>() == 8);

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::offset_of;
    use zerocopy::FromZeros;

    #[test]
    fn tunnel_layout() {
        assert_eq!(offset_of!(Tunnel, exit_reason), 0);
        assert_eq!(offset_of!(Tunnel, exit_status), 8);
        assert_eq!(offset_of!(Tunnel, user_event_pending), 12);
        assert_eq!(offset_of!(Tunnel, ready_for_interrupt_injection), 16);
        assert_eq!(offset_of!(Tunnel, request_interrupt_window), 20);
        assert_eq!(offset_of!(Tunnel, payload), 24);
    }

    #[test]
    fn tunnel_io_layout() {
        assert_eq!(offset_of!(TunnelIo, direction), 0);
        assert_eq!(offset_of!(TunnelIo, df), 1);
        assert_eq!(offset_of!(TunnelIo, size), 2);
        assert_eq!(offset_of!(TunnelIo, port), 4);
        assert_eq!(offset_of!(TunnelIo, count), 6);
        assert_eq!(offset_of!(TunnelIo, flags), 8);
        assert_eq!(offset_of!(TunnelIo, vaddr), 16);
    }

    #[test]
    fn fast_mmio_layout() {
        assert_eq!(offset_of!(FastMmio, gpa), 0);
        assert_eq!(offset_of!(FastMmio, value), 8);
        assert_eq!(offset_of!(FastMmio, size), 16);
        assert_eq!(offset_of!(FastMmio, direction), 17);
        assert_eq!(offset_of!(FastMmio, reg_index), 18);
        assert_eq!(offset_of!(FastMmio, cr0), 24);
        assert_eq!(offset_of!(FastMmio, cr4), 48);
    }

    #[test]
    fn fx_layout() {
        assert_eq!(offset_of!(FxLayout, fop), 6);
        assert_eq!(offset_of!(FxLayout, fpu_ip), 8);
        assert_eq!(offset_of!(FxLayout, mxcsr), 24);
        assert_eq!(offset_of!(FxLayout, st_mm), 32);
        assert_eq!(offset_of!(FxLayout, pad), 416);
    }

    #[test]
    fn payload_views_round_trip() {
        let mut tunnel = Tunnel::new_zeroed();
        tunnel.exit_reason = ExitReason::IO;
        tunnel.set_io(TunnelIo {
            direction: IoDirection::IN,
            df: 0,
            size: 4,
            port: 0xcf8,
            count: 1,
            flags: TunnelIoFlags::new(),
            pad0: 0,
            pad1: 0,
            pad2: 0,
            vaddr: 0xffff_8000_0000_1000,
        });
        let io = tunnel.io();
        assert_eq!(io.direction, IoDirection::IN);
        assert_eq!({ io.port }, 0xcf8);
        assert_eq!({ io.vaddr }, 0xffff_8000_0000_1000);

        tunnel.exit_reason = ExitReason::MMIO;
        tunnel.set_mmio(TunnelMmio { gla: 0xfee0_0000 });
        assert_eq!({ tunnel.mmio().gla }, 0xfee0_0000);
    }

    #[test]
    fn winfo_dual_interpretation() {
        let caps = CapabilityInfo {
            wstatus: CapStatus::new(),
            winfo: 0x1,
            win_refcount: 0,
            mem_quota: 0,
        };
        assert!(caps.fail_info().vt_disabled());
        assert!(!caps.fail_info().nx_disabled());

        let caps = CapabilityInfo {
            wstatus: CapStatus::new().with_working(true),
            winfo: 0x3,
            win_refcount: 0,
            mem_quota: 0,
        };
        assert!(caps.feature_info().ept());
        assert!(caps.feature_info().fast_mmio());
    }

    #[test]
    fn ram_flags_bits() {
        let flags = RamFlags::new().with_rom(true);
        assert_eq!(flags.into_bits(), 0x01);
        let flags = RamFlags::new().with_invalid(true);
        assert_eq!(flags.into_bits(), 0x80);
    }
}
