// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Capability and version negotiation.
//!
//! Runs once per session, before any vCPU exists: the VMM exchanges version
//! records with the module, the module reports its capability info, and only
//! a `Ready` session can create vCPU tunnel channels. Failure is fatal for
//! virtualization in this session — surfaced as a startup error, never
//! retried automatically.

use crate::channel::TunnelChannel;
use haxdef::CapFeatureInfo;
use haxdef::CapabilityInfo;
use haxdef::HAX_API_VERSION_GPA2;
use haxdef::ModuleVersion;
use haxdef::VmmVersion;
use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error(
        "incompatible API versions: module supports {module_compat}..={module_cur}, \
         vmm supports {vmm_least}..={vmm_cur}"
    )]
    Incompatible { module_compat: u32, module_cur: u32, vmm_least: u32, vmm_cur: u32 },
    #[error("virtualization unavailable: VT-x is disabled")]
    VtDisabled,
    #[error("virtualization unavailable: NX is disabled")]
    NxDisabled,
    #[error("virtualization unavailable (winfo {winfo:#x})")]
    NotWorking { winfo: u16 },
    #[error("session has not completed negotiation")]
    NotReady,
}

/// The kernel core's module-wide identity: version window, capability info,
/// and the live count of concurrent host sessions.
#[derive(Debug)]
pub struct Module {
    version: ModuleVersion,
    caps: CapabilityInfo,
    refcount: AtomicU32,
}

impl Module {
    pub fn new(version: ModuleVersion, caps: CapabilityInfo) -> Arc<Self> {
        Arc::new(Self {
            version,
            caps: CapabilityInfo { win_refcount: 0, ..caps },
            refcount: AtomicU32::new(0),
        })
    }

    pub fn version(&self) -> ModuleVersion {
        self.version
    }

    /// Capability info with the live session reference count folded in.
    pub fn capability(&self) -> CapabilityInfo {
        CapabilityInfo { win_refcount: self.refcount.load(Ordering::Relaxed), ..self.caps }
    }
}

#[derive(Debug)]
pub enum SessionState {
    Uninitialized,
    Negotiating,
    Ready { api_version: u32, features: CapFeatureInfo },
    Failed,
}

/// One VMM session against the module.
///
/// `Uninitialized → Negotiating → Ready | Failed`; the reference count is
/// held while `Ready` and released on drop.
#[derive(Debug)]
pub struct Session {
    module: Arc<Module>,
    state: SessionState,
}

impl Session {
    pub fn new(module: Arc<Module>) -> Self {
        Self { module, state: SessionState::Uninitialized }
    }

    /// Runs the one-time handshake against the module.
    pub fn negotiate(&mut self, vmm: VmmVersion) -> Result<(), NegotiationError> {
        self.state = SessionState::Negotiating;
        match self.check(vmm) {
            Ok((api_version, features)) => {
                self.module.refcount.fetch_add(1, Ordering::Relaxed);
                self.state = SessionState::Ready { api_version, features };
                tracing::info!(api_version, "session negotiated");
                Ok(())
            }
            Err(err) => {
                tracing::error!(error = %err, "session negotiation failed");
                self.state = SessionState::Failed;
                Err(err)
            }
        }
    }

    fn check(&self, vmm: VmmVersion) -> Result<(u32, CapFeatureInfo), NegotiationError> {
        let module = self.module.version;
        // Equal versions at the boundary succeed.
        if vmm.cur_version < module.compat_version || module.cur_version < vmm.least_version {
            return Err(NegotiationError::Incompatible {
                module_compat: module.compat_version,
                module_cur: module.cur_version,
                vmm_least: vmm.least_version,
                vmm_cur: vmm.cur_version,
            });
        }
        let caps = self.module.caps;
        if !caps.wstatus.working() {
            let fail = caps.fail_info();
            return Err(if fail.vt_disabled() {
                NegotiationError::VtDisabled
            } else if fail.nx_disabled() {
                NegotiationError::NxDisabled
            } else {
                NegotiationError::NotWorking { winfo: caps.winfo }
            });
        }
        Ok((module.cur_version.min(vmm.cur_version), caps.feature_info()))
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn api_version(&self) -> Option<u32> {
        match self.state {
            SessionState::Ready { api_version, .. } => Some(api_version),
            _ => None,
        }
    }

    pub fn features(&self) -> Option<CapFeatureInfo> {
        match self.state {
            SessionState::Ready { features, .. } => Some(features),
            _ => None,
        }
    }

    /// Whether the dual-address fast-MMIO form may be used.
    pub fn supports_gpa2(&self) -> bool {
        self.api_version().is_some_and(|v| v >= HAX_API_VERSION_GPA2)
    }

    /// Creates a per-vCPU tunnel channel with an I/O data buffer of
    /// `io_buf_size` bytes. Only a `Ready` session may run vCPUs.
    ///
    /// # Panics
    ///
    /// Panics if `io_buf_size` cannot hold a fast MMIO record.
    pub fn channel(&self, io_buf_size: u16) -> Result<TunnelChannel, NegotiationError> {
        match self.state {
            SessionState::Ready { api_version, .. } => {
                Ok(TunnelChannel::new(io_buf_size, api_version))
            }
            _ => Err(NegotiationError::NotReady),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if matches!(self.state, SessionState::Ready { .. }) {
            self.module.refcount.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use haxdef::CapStatus;
    use haxdef::HAX_CAP_EPT;
    use haxdef::HAX_CAP_FASTMMIO;
    use haxdef::HAX_CAP_FAILREASON_NX;
    use haxdef::HAX_CAP_FAILREASON_VT;
    use haxdef::HAX_CUR_API_VERSION;
    use haxdef::HAX_LEAST_API_VERSION;

    fn working_caps() -> CapabilityInfo {
        CapabilityInfo {
            wstatus: CapStatus::new().with_working(true),
            winfo: HAX_CAP_EPT | HAX_CAP_FASTMMIO,
            win_refcount: 0,
            mem_quota: 0,
        }
    }

    fn module(compat: u32, cur: u32) -> Arc<Module> {
        Module::new(ModuleVersion { compat_version: compat, cur_version: cur }, working_caps())
    }

    /// Builds a channel the way production code does: through a negotiated
    /// session whose current version on both sides is `api`.
    pub(crate) fn ready_channel(io_buf_size: u16, api: u32) -> TunnelChannel {
        let mut session = Session::new(module(HAX_LEAST_API_VERSION, api));
        session
            .negotiate(VmmVersion { cur_version: api, least_version: HAX_LEAST_API_VERSION })
            .unwrap();
        session.channel(io_buf_size).unwrap()
    }

    #[test]
    fn equal_versions_succeed() {
        let mut session = Session::new(module(4, 4));
        session.negotiate(VmmVersion { cur_version: 4, least_version: 4 }).unwrap();
        assert_eq!(session.api_version(), Some(4));
        assert!(session.supports_gpa2());
        assert!(session.features().unwrap().ept());
    }

    #[test]
    fn negotiated_version_is_min_of_currents() {
        let mut session = Session::new(module(1, HAX_CUR_API_VERSION));
        session.negotiate(VmmVersion { cur_version: 3, least_version: 1 }).unwrap();
        assert_eq!(session.api_version(), Some(3));
        assert!(!session.supports_gpa2());
    }

    #[test]
    fn stale_vmm_rejected() {
        let mut session = Session::new(module(2, 4));
        let err = session.negotiate(VmmVersion { cur_version: 1, least_version: 1 }).unwrap_err();
        assert!(matches!(err, NegotiationError::Incompatible { .. }));
        assert!(matches!(session.state(), SessionState::Failed));
        assert!(matches!(session.channel(4096), Err(NegotiationError::NotReady)));
    }

    #[test]
    fn stale_module_rejected() {
        let mut session = Session::new(module(1, 2));
        let err = session.negotiate(VmmVersion { cur_version: 4, least_version: 3 }).unwrap_err();
        assert!(matches!(err, NegotiationError::Incompatible { .. }));
    }

    #[test]
    fn vt_disabled_is_fatal_before_any_vcpu() {
        let caps = CapabilityInfo {
            wstatus: CapStatus::new(),
            winfo: HAX_CAP_FAILREASON_VT,
            win_refcount: 0,
            mem_quota: 0,
        };
        let module =
            Module::new(ModuleVersion { compat_version: 1, cur_version: 4 }, caps);
        let mut session = Session::new(module);
        let err = session
            .negotiate(VmmVersion { cur_version: 4, least_version: 1 })
            .unwrap_err();
        assert!(matches!(err, NegotiationError::VtDisabled));
        assert!(matches!(session.channel(4096), Err(NegotiationError::NotReady)));
    }

    #[test]
    fn nx_disabled_reported_distinctly() {
        let caps = CapabilityInfo {
            wstatus: CapStatus::new(),
            winfo: HAX_CAP_FAILREASON_NX,
            win_refcount: 0,
            mem_quota: 0,
        };
        let module =
            Module::new(ModuleVersion { compat_version: 1, cur_version: 4 }, caps);
        let mut session = Session::new(module);
        let err = session
            .negotiate(VmmVersion { cur_version: 4, least_version: 1 })
            .unwrap_err();
        assert!(matches!(err, NegotiationError::NxDisabled));
    }

    #[test]
    fn refcount_tracks_sessions() {
        let module = module(1, 4);
        let vmm = VmmVersion { cur_version: 4, least_version: 1 };

        let mut a = Session::new(module.clone());
        a.negotiate(vmm).unwrap();
        let mut b = Session::new(module.clone());
        b.negotiate(vmm).unwrap();
        assert_eq!(module.capability().win_refcount, 2);

        drop(a);
        assert_eq!(module.capability().win_refcount, 1);
        drop(b);
        assert_eq!(module.capability().win_refcount, 0);

        // Failed sessions never held a reference.
        let mut c = Session::new(module.clone());
        let _ = c.negotiate(VmmVersion { cur_version: 0, least_version: 0 });
        drop(c);
        assert_eq!(module.capability().win_refcount, 0);
    }
}
