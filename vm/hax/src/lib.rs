// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! HAXM exit-tunnel protocol runtime.
//!
//! Implements the cross-boundary exit protocol between the kernel-resident
//! hypervisor core and the user-space VMM: the per-vCPU tunnel channel, the
//! kernel-side exit dispatcher, the VMM-side tagged decode, the fast-MMIO
//! bypass, session capability/version negotiation, and the memory resource
//! governor. The wire contract itself lives in [`haxdef`].

#![forbid(unsafe_code)]

pub mod channel;
pub mod dispatch;
pub mod fastmmio;
pub mod memory;
pub mod session;

use thiserror::Error;

/// Errors on the per-vCPU exit path.
///
/// All of these terminate the affected vCPU's run loop; session setup and
/// memory governance have their own taxonomies in
/// [`session::NegotiationError`] and [`memory::MemoryError`].
#[derive(Debug, Error)]
pub enum Error {
    /// Protocol violation: the exit reason matches no known code. Never
    /// silently skipped.
    #[error("unknown exit reason {0:#x}")]
    UnknownExit(u32),
    #[error("unsupported I/O access size {0}")]
    InvalidIoSize(u16),
    #[error("invalid I/O direction {0:#x}")]
    InvalidIoDirection(u8),
    /// The declared transfer would overrun the negotiated data buffer.
    /// Rejected before any buffer access, never truncated.
    #[error("I/O transfer of {count} x {size} bytes overruns the {limit}-byte data buffer")]
    IoBufferOverrun { count: u16, size: u16, limit: usize },
    #[error("I/O data length {len} is not a multiple of access size {size}")]
    RaggedIo { len: usize, size: u16 },
    #[error("MMIO access at {gpa:#x} with size {size} is not eligible for the fast path")]
    FastMmioIneligible { gpa: u64, size: u8 },
    #[error("unknown fast MMIO direction {0:#x}")]
    UnknownFastMmioDirection(u8),
    /// The dual-address fast-MMIO form was used without the capability
    /// version that introduced it. A defined violation, not undefined
    /// behavior.
    #[error("dual-address fast MMIO requires API v{required}, negotiated v{negotiated}")]
    Gpa2Unsupported { negotiated: u32, required: u32 },
}

pub type Result<T, E = Error> = core::result::Result<T, E>;

pub use channel::TunnelChannel;
pub use dispatch::Dispatcher;
pub use dispatch::Exit;
pub use fastmmio::CrSnapshot;
pub use memory::MemoryGovernor;
pub use session::Module;
pub use session::Session;
