use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use kvm_ioctls::Kvm;

use crate::vm::error::{Error, Result};

/// Process-wide handle to the kernel virtualization interface.
///
/// Created once at startup; every guest is built from it. Owns the
/// per-session guest id counter and the file-operation token shared by
/// all co-resident guests.
pub struct Hypervisor {
    kvm: Kvm,
    run_size: usize,
    next_id: AtomicU64,
    op_token: Arc<OpToken>,
    fs_root: PathBuf,
}

impl Hypervisor {
    pub fn new() -> Result<Self> {
        let kvm = Kvm::new().map_err(Error::EnvUnavailable)?;
        let run_size = kvm.get_vcpu_mmap_size().map_err(Error::RunRegionSize)?;

        Ok(Self {
            kvm,
            run_size,
            next_id: AtomicU64::new(0),
            op_token: Arc::new(OpToken::new()),
            fs_root: PathBuf::from("."),
        })
    }

    pub fn kvm(&self) -> &Kvm {
        &self.kvm
    }

    /// Size of each vCPU's shared run region, queried once at init.
    pub fn run_region_size(&self) -> usize {
        self.run_size
    }

    /// Host directory the file protocol resolves guest paths against.
    pub fn fs_root(&self) -> &Path {
        &self.fs_root
    }

    pub fn set_fs_root(&mut self, root: impl Into<PathBuf>) {
        self.fs_root = root.into();
    }

    pub(crate) fn next_guest_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn op_token(&self) -> Arc<OpToken> {
        Arc::clone(&self.op_token)
    }
}

/// Single-permit token serializing file-protocol operations across all
/// guests of one hypervisor. An operation spans several VM exits, so the
/// permit outlives any one handler invocation.
pub struct OpToken {
    held: Mutex<bool>,
    freed: Condvar,
}

impl OpToken {
    pub(crate) fn new() -> Self {
        Self {
            held: Mutex::new(false),
            freed: Condvar::new(),
        }
    }

    /// Blocks until the token is free, then takes it.
    pub(crate) fn acquire(self: &Arc<Self>) -> OpPermit {
        let mut held = self.held.lock().unwrap();
        while *held {
            held = self.freed.wait(held).unwrap();
        }
        *held = true;
        OpPermit {
            token: Arc::clone(self),
        }
    }
}

/// Held for the duration of one file-protocol operation. Dropping it
/// releases the token, including when a guest exits mid-operation.
pub(crate) struct OpPermit {
    token: Arc<OpToken>,
}

impl Drop for OpPermit {
    fn drop(&mut self) {
        *self.token.held.lock().unwrap() = false;
        self.token.freed.notify_one();
    }
}
