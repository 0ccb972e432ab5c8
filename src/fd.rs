//! Owned kernel descriptors.

use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;

use tracing::{trace, warn};

use crate::sys::Kernel;

/// Exclusively owned descriptor minted by a [`Kernel`].
///
/// `Fd` is move-only. [`Fd::close`] consumes it, so a second close does not
/// compile; dropping an `Fd` that was never closed releases it and logs any
/// failure.
pub struct Fd {
    raw: RawFd,
    kernel: Arc<dyn Kernel>,
}

impl Fd {
    /// Take ownership of `raw`, which `kernel` just returned.
    pub fn new(kernel: Arc<dyn Kernel>, raw: RawFd) -> Self {
        trace!(fd = raw, "descriptor acquired");
        Self { raw, kernel }
    }

    /// Raw descriptor value. Stays owned by `self`.
    pub fn raw(&self) -> RawFd {
        self.raw
    }

    /// Kernel this descriptor belongs to.
    pub fn kernel(&self) -> &Arc<dyn Kernel> {
        &self.kernel
    }

    /// Release the descriptor.
    ///
    /// # Errors
    ///
    /// Returns the kernel's error; the descriptor is gone either way.
    pub fn close(mut self) -> io::Result<()> {
        let raw = std::mem::replace(&mut self.raw, -1);
        trace!(fd = raw, "descriptor closed");
        self.kernel.close(raw)
    }
}

impl Drop for Fd {
    fn drop(&mut self) {
        if self.raw < 0 {
            return;
        }
        if let Err(e) = self.kernel.close(self.raw) {
            warn!(fd = self.raw, error = %e, "failed to release descriptor");
        }
    }
}

impl fmt::Debug for Fd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Fd").field(&self.raw).finish()
    }
}
