//! Exclusive-lock arbitration.
//!
//! Two lock scopes exist: one per watched volume, and a single
//! process-wide reboot lock. Clients are remote endpoints; when an
//! endpoint dies with a lock held, the death notification is the release.
//! The arbiter is pure bookkeeping — the controller owns the volume map
//! and feeds in whatever context a decision needs.

use std::collections::HashMap;

use log::{info, warn};

use bosun_api::constants::EX_TEMPFAIL;

pub type EndpointId = u64;

/// Outcome of a lock request, mirrored onto the wire by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    Granted,
    Busy { device: Option<String> },
    NotFound,
}

/// What an unlock's exit status means for the volume's error counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDisposition {
    /// Clean finish; prior errors are forgiven.
    Success,

    /// Not done yet, but not a failure either: the builder hands work to
    /// a follow-up invocation.
    TempFail,

    /// A real failure; the error counter advances.
    Failure,
}

impl ExitDisposition {
    pub fn from_status(status: i32) -> Self {
        match status {
            0 => ExitDisposition::Success,
            s if s == EX_TEMPFAIL => ExitDisposition::TempFail,
            _ => ExitDisposition::Failure,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnlockOutcome {
    /// The caller never held this lock; nothing changed.
    NotHeld,
    Released { disposition: ExitDisposition },
}

/// Volumes crash-released by an endpoint's death.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DeadEndpoint {
    pub volumes: Vec<String>,
    pub reboot_released: bool,
}

#[derive(Debug, Default)]
pub struct LockArbiter {
    vol_locks: HashMap<String, EndpointId>,
    reboot: Option<EndpointId>,
}

impl LockArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests the exclusive update lock on a volume. `known` is whether
    /// the controller currently watches the volume.
    pub fn lock_volume(
        &mut self,
        devname: &str,
        known: bool,
        endpoint: EndpointId,
    ) -> LockOutcome {
        if !known {
            return LockOutcome::NotFound;
        }
        if self.reboot.is_some() {
            return LockOutcome::Busy { device: None };
        }
        match self.vol_locks.get(devname) {
            Some(holder) if *holder == endpoint => LockOutcome::Granted,
            Some(_) => LockOutcome::Busy {
                device: Some(devname.to_string()),
            },
            None => {
                info!("{devname}: locked for endpoint {endpoint}");
                self.vol_locks.insert(devname.to_string(), endpoint);
                LockOutcome::Granted
            }
        }
    }

    /// Releases a volume lock. Only the holding endpoint may release.
    pub fn unlock_volume(
        &mut self,
        devname: &str,
        endpoint: EndpointId,
        status: i32,
    ) -> UnlockOutcome {
        match self.vol_locks.get(devname) {
            Some(holder) if *holder == endpoint => {
                self.vol_locks.remove(devname);
                let disposition = ExitDisposition::from_status(status);
                info!("{devname}: unlocked (status {status})");
                UnlockOutcome::Released { disposition }
            }
            _ => UnlockOutcome::NotHeld,
        }
    }

    /// Requests the process-wide reboot lock. `busy_device` is the
    /// controller's verdict on pending work: any volume with caches still
    /// out of date (persistently failing volumes excepted) blocks reboot.
    pub fn lock_reboot(&mut self, endpoint: EndpointId, busy_device: Option<String>) -> LockOutcome {
        if let Some(holder) = self.reboot {
            if holder == endpoint {
                return LockOutcome::Granted;
            }
            return LockOutcome::Busy { device: None };
        }
        if let Some((device, _)) = self.vol_locks.iter().next() {
            return LockOutcome::Busy {
                device: Some(device.clone()),
            };
        }
        if busy_device.is_some() {
            return LockOutcome::Busy {
                device: busy_device,
            };
        }
        info!("reboot lock granted to endpoint {endpoint}");
        self.reboot = Some(endpoint);
        LockOutcome::Granted
    }

    /// An endpoint's communication channel went away. Everything it held
    /// is released; the caller treats volume releases as crash-releases.
    pub fn endpoint_died(&mut self, endpoint: EndpointId) -> DeadEndpoint {
        let mut dead = DeadEndpoint::default();
        self.vol_locks.retain(|devname, holder| {
            if *holder == endpoint {
                warn!("{devname}: lock holder {endpoint} died; crash-release");
                dead.volumes.push(devname.clone());
                false
            } else {
                true
            }
        });
        if self.reboot == Some(endpoint) {
            self.reboot = None;
            dead.reboot_released = true;
        }
        dead
    }

    /// Drops any lock held on a vanished volume.
    pub fn forget_volume(&mut self, devname: &str) {
        self.vol_locks.remove(devname);
    }

    pub fn holder(&self, devname: &str) -> Option<EndpointId> {
        self.vol_locks.get(devname).copied()
    }

    pub fn reboot_locked(&self) -> bool {
        self.reboot.is_some()
    }
}
