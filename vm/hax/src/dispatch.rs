// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Kernel-side exit delivery and VMM-side decode.
//!
//! The kernel core classifies each hardware VM exit; exits it cannot resolve
//! itself are written into the tunnel through [`Dispatcher`] and handed to
//! the VMM, which decodes them into the tagged [`Exit`] representation,
//! emulates, writes results back through the borrowed variant fields, and
//! resumes the vCPU. The payload bytes are only ever interpreted against the
//! variant selected by the exit reason.

use crate::Error;
use crate::Result;
use crate::channel::TunnelChannel;
use crate::fastmmio;
use crate::fastmmio::CrSnapshot;
use crate::fastmmio::fast_mmio_eligible;
use haxdef::ExitReason;
use haxdef::FastMmio;
use haxdef::FastMmioDirection;
use haxdef::HAX_API_VERSION_GPA2;
use haxdef::IoDirection;
use haxdef::TunnelIo;
use haxdef::TunnelIoFlags;
use haxdef::TunnelMmio;
use haxdef::TunnelState;

/// The kernel core's writer for one handoff turn.
pub struct Dispatcher<'a> {
    channel: &'a mut TunnelChannel,
}

impl<'a> Dispatcher<'a> {
    pub(crate) fn new(channel: &'a mut TunnelChannel) -> Self {
        Self { channel }
    }

    fn deliver_io(
        &mut self,
        direction: IoDirection,
        port: u16,
        size: u8,
        count: u16,
        string: bool,
        df: bool,
    ) -> Result<usize> {
        if !matches!(size, 1 | 2 | 4) {
            return Err(Error::InvalidIoSize(size.into()));
        }
        let len = usize::from(count) * usize::from(size);
        let limit = self.channel.iobuf.len();
        if count == 0 || len > limit {
            return Err(Error::IoBufferOverrun { count, size: size.into(), limit });
        }
        let tunnel = &mut self.channel.tunnel;
        tunnel.exit_reason = ExitReason::IO;
        tunnel.exit_status = 0;
        tunnel.set_io(TunnelIo {
            direction,
            df: df.into(),
            size: size.into(),
            port,
            count,
            flags: TunnelIoFlags::new().with_string(string),
            pad0: 0,
            pad1: 0,
            pad2: 0,
            vaddr: self.channel.iobuf.as_ptr() as u64,
        });
        Ok(len)
    }

    /// Delivers an OUT: `data` holds the full transfer, `count * size` bytes
    /// in port order, and is copied into the adjoining buffer at offset zero.
    pub fn io_out(&mut self, port: u16, size: u8, data: &[u8], string: bool, df: bool) -> Result<()> {
        if size == 0 || data.len() % usize::from(size) != 0 {
            return Err(Error::RaggedIo { len: data.len(), size: size.into() });
        }
        let count =
            u16::try_from(data.len() / usize::from(size)).map_err(|_| Error::IoBufferOverrun {
                count: u16::MAX,
                size: size.into(),
                limit: self.channel.iobuf.len(),
            })?;
        let len = self.deliver_io(IoDirection::OUT, port, size, count, string, df)?;
        self.channel.iobuf[..len].copy_from_slice(data);
        Ok(())
    }

    /// Delivers an IN of `count` elements; the VMM fills the buffer during
    /// its turn.
    pub fn io_in(&mut self, port: u16, size: u8, count: u16, string: bool, df: bool) -> Result<()> {
        let len = self.deliver_io(IoDirection::IN, port, size, count, string, df)?;
        self.channel.iobuf[..len].fill(0);
        Ok(())
    }

    /// Delivers a general MMIO exit for the faulting guest physical address.
    /// Width and direction are recovered by the VMM's instruction emulation;
    /// accesses meeting the bypass criteria should use the fast-MMIO methods
    /// instead.
    pub fn mmio(&mut self, gla: u64) {
        let tunnel = &mut self.channel.tunnel;
        tunnel.exit_reason = ExitReason::MMIO;
        tunnel.exit_status = 0;
        tunnel.set_mmio(TunnelMmio { gla });
    }

    fn deliver_state(&mut self, reason: ExitReason, status: u32) {
        let tunnel = &mut self.channel.tunnel;
        tunnel.exit_reason = reason;
        tunnel.exit_status = status;
        tunnel.set_state(TunnelState { dummy: 0 });
    }

    pub fn hlt(&mut self) {
        self.deliver_state(ExitReason::HLT, 0);
    }

    pub fn interrupt(&mut self) {
        self.deliver_state(ExitReason::INTERRUPT, 0);
    }

    pub fn paused(&mut self) {
        self.deliver_state(ExitReason::PAUSED, 0);
    }

    pub fn real_mode(&mut self) {
        self.deliver_state(ExitReason::REAL_MODE, 0);
    }

    /// Guest state change (shutdown, reboot request); `status` carries the
    /// detail.
    pub fn state_change(&mut self, status: u32) {
        self.deliver_state(ExitReason::STATE_CHANGE, status);
    }

    /// The hardware exit could not be classified; `status` carries the raw
    /// basic exit reason for diagnostics. The VMM treats this as fatal.
    pub fn unknown_vmexit(&mut self, status: u32) {
        tracing::warn!(status, "delivering unclassified vmexit");
        self.deliver_state(ExitReason::UNKNOWN_VMEXIT, status);
    }

    fn deliver_fast_mmio(&mut self, record: FastMmio) {
        fastmmio::write_record(&mut self.channel.iobuf, &record);
        self.deliver_state(ExitReason::FAST_MMIO, 0);
    }

    /// Delivers an MMIO write via the bypass. The access must satisfy
    /// [`fast_mmio_eligible`].
    pub fn fast_mmio_write(&mut self, gpa: u64, value: u64, size: u8, cr: CrSnapshot) -> Result<()> {
        if !fast_mmio_eligible(gpa, size) {
            return Err(Error::FastMmioIneligible { gpa, size });
        }
        self.deliver_fast_mmio(cr.record(gpa, value, size, FastMmioDirection::WRITE));
        Ok(())
    }

    /// Delivers an MMIO read via the bypass; the VMM stores the result in the
    /// record's value field.
    pub fn fast_mmio_read(&mut self, gpa: u64, size: u8, cr: CrSnapshot) -> Result<()> {
        if !fast_mmio_eligible(gpa, size) {
            return Err(Error::FastMmioIneligible { gpa, size });
        }
        self.deliver_fast_mmio(cr.record(gpa, 0, size, FastMmioDirection::READ));
        Ok(())
    }

    /// Delivers an address-to-address transfer (`gpa` to `gpa2`). Requires a
    /// negotiated API of at least [`HAX_API_VERSION_GPA2`]; older peers must
    /// use the single-value forms.
    pub fn fast_mmio_copy(&mut self, gpa: u64, gpa2: u64, size: u8, cr: CrSnapshot) -> Result<()> {
        if self.channel.api_version < HAX_API_VERSION_GPA2 {
            return Err(Error::Gpa2Unsupported {
                negotiated: self.channel.api_version,
                required: HAX_API_VERSION_GPA2,
            });
        }
        if !fast_mmio_eligible(gpa, size) || !fast_mmio_eligible(gpa2, size) {
            return Err(Error::FastMmioIneligible { gpa, size });
        }
        self.deliver_fast_mmio(cr.record(gpa, gpa2, size, FastMmioDirection::GPA_TO_GPA));
        Ok(())
    }
}

/// One decoded exit, borrowing the channel for the VMM's turn.
///
/// Result-bearing variants hand out mutable borrows into the shared region;
/// writing through them is how the VMM reports back before resuming.
#[derive(Debug)]
pub enum Exit<'a> {
    IoIn { port: u16, size: u8, string: bool, df: bool, data: &'a mut [u8] },
    IoOut { port: u16, size: u8, string: bool, df: bool, data: &'a [u8] },
    Mmio { gla: u64 },
    FastMmioRead { gpa: u64, size: u8, cr: CrSnapshot, data: &'a mut [u8; 8] },
    FastMmioWrite { gpa: u64, value: u64, size: u8, cr: CrSnapshot },
    FastMmioCopy { src_gpa: u64, dst_gpa: u64, size: u8, cr: CrSnapshot },
    Hlt,
    Interrupt,
    Paused,
    RealMode,
    StateChange { status: u32 },
    UnknownVmexit { status: u32 },
}

impl TunnelChannel {
    /// Decodes the exit the kernel core just delivered (the VMM's turn of
    /// the handoff).
    ///
    /// Malformed payloads are rejected before any buffer access; an
    /// unrecognized reason code is fatal for this vCPU.
    pub fn exit(&mut self) -> Result<Exit<'_>> {
        let reason = self.tunnel.exit_reason;
        let status = self.tunnel.exit_status;
        let exit = match reason {
            ExitReason::IO => {
                let io = self.tunnel.io();
                let size = io.size;
                let count = io.count;
                if !matches!(size, 1 | 2 | 4) {
                    return Err(Error::InvalidIoSize(size));
                }
                let len = usize::from(count) * usize::from(size);
                if count == 0 || len > self.iobuf.len() {
                    return Err(Error::IoBufferOverrun { count, size, limit: self.iobuf.len() });
                }
                let string = io.flags.string();
                let df = io.df != 0;
                let data = &mut self.iobuf[..len];
                match io.direction {
                    IoDirection::OUT => Exit::IoOut {
                        port: io.port,
                        size: size as u8,
                        string,
                        df,
                        data,
                    },
                    IoDirection::IN => Exit::IoIn {
                        port: io.port,
                        size: size as u8,
                        string,
                        df,
                        data,
                    },
                    direction => return Err(Error::InvalidIoDirection(direction.0)),
                }
            }
            ExitReason::MMIO => Exit::Mmio { gla: self.tunnel.mmio().gla },
            ExitReason::FAST_MMIO => {
                let record = fastmmio::read_record(&self.iobuf);
                if !fast_mmio_eligible(record.gpa, record.size) {
                    return Err(Error::FastMmioIneligible { gpa: record.gpa, size: record.size });
                }
                let cr = CrSnapshot::from_record(&record);
                match record.direction {
                    FastMmioDirection::READ => Exit::FastMmioRead {
                        gpa: record.gpa,
                        size: record.size,
                        cr,
                        data: fastmmio::value_bytes(&mut self.iobuf),
                    },
                    FastMmioDirection::WRITE => Exit::FastMmioWrite {
                        gpa: record.gpa,
                        value: record.value,
                        size: record.size,
                        cr,
                    },
                    FastMmioDirection::GPA_TO_GPA => {
                        if self.api_version < HAX_API_VERSION_GPA2 {
                            return Err(Error::Gpa2Unsupported {
                                negotiated: self.api_version,
                                required: HAX_API_VERSION_GPA2,
                            });
                        }
                        Exit::FastMmioCopy {
                            src_gpa: record.gpa,
                            dst_gpa: record.gpa2(),
                            size: record.size,
                            cr,
                        }
                    }
                    direction => return Err(Error::UnknownFastMmioDirection(direction.0)),
                }
            }
            ExitReason::HLT => Exit::Hlt,
            ExitReason::INTERRUPT => Exit::Interrupt,
            ExitReason::PAUSED => Exit::Paused,
            ExitReason::REAL_MODE => Exit::RealMode,
            ExitReason::STATE_CHANGE => Exit::StateChange { status },
            ExitReason::UNKNOWN_VMEXIT => Exit::UnknownVmexit { status },
            reason => {
                tracing::error!(reason = reason.0, "unknown exit reason");
                return Err(Error::UnknownExit(reason.0));
            }
        };
        Ok(exit)
    }
}
