// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The per-vCPU exit tunnel channel.
//!
//! One channel exists per vCPU for the vCPU's lifetime, holding exactly one
//! [`Tunnel`] plus the adjoining I/O data buffer of negotiated size. Access
//! is strictly alternating: the kernel core writes during its portion of the
//! handoff (via [`Dispatcher`](crate::dispatch::Dispatcher)), the VMM reads
//! and reports results during its portion (via
//! [`TunnelChannel::exit`](crate::dispatch)). The `&mut` borrows make
//! concurrent or out-of-turn access unrepresentable, and dropping the channel
//! tears it down.

use crate::dispatch::Dispatcher;
use haxdef::FastMmio;
use haxdef::Tunnel;
use haxdef::TunnelInfo;
use std::mem::size_of;
use zerocopy::FromZeros;

pub struct TunnelChannel {
    pub(crate) tunnel: Box<Tunnel>,
    pub(crate) iobuf: Box<[u8]>,
    pub(crate) api_version: u32,
}

impl TunnelChannel {
    /// Creates the channel with an I/O data buffer of `io_buf_size` bytes.
    ///
    /// Channels are created through
    /// [`Session::channel`](crate::session::Session::channel), which supplies
    /// the negotiated API version.
    pub(crate) fn new(io_buf_size: u16, api_version: u32) -> Self {
        assert!(
            usize::from(io_buf_size) >= size_of::<FastMmio>(),
            "I/O buffer must hold a fast MMIO record"
        );
        Self {
            tunnel: Box::new(Tunnel::new_zeroed()),
            iobuf: vec![0; io_buf_size.into()].into_boxed_slice(),
            api_version,
        }
    }

    /// Describes the mapping: tunnel address, I/O buffer address, and the
    /// negotiated buffer size.
    pub fn info(&self) -> TunnelInfo {
        TunnelInfo {
            va: std::ptr::from_ref(&*self.tunnel) as u64,
            io_va: self.iobuf.as_ptr() as u64,
            size: self.iobuf.len() as u16,
            pad: [0; 3],
        }
    }

    /// The API version negotiated for this session, governing versioned
    /// field validity (notably the dual-address fast-MMIO form).
    pub fn api_version(&self) -> u32 {
        self.api_version
    }

    /// A read-only view of the tunnel record.
    pub fn tunnel(&self) -> &Tunnel {
        &self.tunnel
    }

    /// Begins the kernel core's turn of the handoff.
    pub fn dispatcher(&mut self) -> Dispatcher<'_> {
        Dispatcher::new(self)
    }

    /// Request an exit when the interrupt window opens.
    ///
    /// Returns true if the window is already open (in which case the request
    /// is not registered).
    #[must_use]
    pub fn check_or_request_interrupt_window(&mut self) -> bool {
        if self.tunnel.ready_for_interrupt_injection != 0 {
            true
        } else {
            self.tunnel.request_interrupt_window = 1;
            false
        }
    }

    /// Kernel side: records whether an interrupt can be injected at the next
    /// resume. Clears any window request once the window is open.
    pub fn set_ready_for_interrupt_injection(&mut self, ready: bool) {
        self.tunnel.ready_for_interrupt_injection = ready.into();
        if ready {
            self.tunnel.request_interrupt_window = 0;
        }
    }

    pub fn set_user_event_pending(&mut self, pending: bool) {
        self.tunnel.user_event_pending = pending.into();
    }

    pub fn user_event_pending(&self) -> bool {
        self.tunnel.user_event_pending != 0
    }
}
