//! Generic links created with `BPF_LINK_CREATE`.

use std::io;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use super::{Link, LinkError, LinkInfo};
use crate::fd::Fd;
use crate::program::{AttachType, Program};
use crate::sys::{Kernel, LinkCreateAttr, LinkUpdateAttr, ObjectKind};

const BPF_F_REPLACE: u32 = 0x4;

/// Arguments for [`RawLink::attach`].
#[derive(Debug, Clone)]
pub struct RawLinkOptions<'a> {
    /// Program to attach.
    pub program: &'a Program,
    /// Attach-type tag.
    pub attach: AttachType,
    /// Target descriptor (cgroup, netns, ...), `0` for none.
    pub target_fd: RawFd,
    /// BTF id of the attach target, `0` for none.
    pub btf_id: u32,
    /// Link flags.
    pub flags: u32,
}

impl<'a> RawLinkOptions<'a> {
    /// Options with no target, BTF id or flags.
    pub fn new(program: &'a Program, attach: AttachType) -> Self {
        Self {
            program,
            attach,
            target_fd: 0,
            btf_id: 0,
            flags: 0,
        }
    }

    /// Set the target descriptor.
    #[must_use]
    pub fn target(mut self, fd: RawFd) -> Self {
        self.target_fd = fd;
        self
    }

    /// Set the BTF id of the attach target.
    #[must_use]
    pub fn btf_id(mut self, id: u32) -> Self {
        self.btf_id = id;
        self
    }

    /// Set the link flags.
    #[must_use]
    pub fn flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }
}

/// A generic link owning one kernel handle.
///
/// Closed is terminal: everything but [`Link::close`] then fails with
/// [`LinkError::Closed`].
#[derive(Debug)]
pub struct RawLink {
    fd: Option<Fd>,
    attach: Option<AttachType>,
    pinned: Option<PathBuf>,
}

impl RawLink {
    /// Attach a program through the generic link primitive.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::IncompatibleProgram`] when the program's declared
    /// types rule out `opts.attach`, or [`LinkError::Attach`] when the kernel
    /// refuses.
    pub fn attach(kernel: &Arc<dyn Kernel>, opts: &RawLinkOptions<'_>) -> Result<Self, LinkError> {
        let program = opts.program;
        if !program.is_compatible_with(opts.attach) {
            return Err(LinkError::IncompatibleProgram {
                op: "attach",
                program: program.name().to_owned(),
                program_type: program.prog_type(),
                attach: opts.attach,
            });
        }

        let attr = LinkCreateAttr {
            prog_fd: program.fd(),
            target_fd: opts.target_fd,
            attach_type: opts.attach,
            target_btf_id: opts.btf_id,
            flags: opts.flags,
        };
        let raw = kernel
            .link_create(&attr)
            .map_err(|source| LinkError::Attach {
                attach: opts.attach,
                source,
            })?;

        debug!(fd = raw, attach = %opts.attach, program = program.name(), "link attached");
        Ok(Self {
            fd: Some(Fd::new(Arc::clone(kernel), raw)),
            attach: Some(opts.attach),
            pinned: None,
        })
    }

    /// Reopen a link previously pinned at `path`.
    ///
    /// The result is indistinguishable from a freshly attached link, except
    /// that it remembers `path` as its pin.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::LoadPinned`] if nothing can be opened at `path`,
    /// [`LinkError::NotALink`] if the pinned object is a program or map.
    pub fn load_pinned(kernel: &Arc<dyn Kernel>, path: &Path) -> Result<Self, LinkError> {
        let load_err = |source: io::Error| LinkError::LoadPinned {
            path: path.to_path_buf(),
            source,
        };

        let raw = kernel.obj_get(path).map_err(load_err)?;
        let fd = Fd::new(Arc::clone(kernel), raw);
        if kernel.object_kind(raw).map_err(load_err)? != ObjectKind::Link {
            return Err(LinkError::NotALink {
                path: path.to_path_buf(),
            });
        }

        let attach = match kernel.link_info(raw) {
            Ok(info) => info.link_type.attach_type(),
            Err(e) => {
                debug!(fd = raw, error = %e, "link info unavailable, attach type unknown");
                None
            }
        };

        debug!(fd = raw, path = %path.display(), "pinned link loaded");
        Ok(Self {
            fd: Some(fd),
            attach,
            pinned: Some(path.to_path_buf()),
        })
    }

    pub(crate) fn live(&self, op: &'static str) -> Result<&Fd, LinkError> {
        self.fd.as_ref().ok_or(LinkError::Closed { op, object: "link" })
    }

    /// Raw link descriptor, `None` once closed.
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.fd.as_ref().map(Fd::raw)
    }

    /// Attach type, when known.
    ///
    /// Links loaded from a pin only know it when the kernel's link type
    /// implies a single attach type.
    pub fn attach_type(&self) -> Option<AttachType> {
        self.attach
    }

    /// Whether the link has been closed.
    pub fn is_closed(&self) -> bool {
        self.fd.is_none()
    }

    /// Whether the link is currently pinned.
    pub fn is_pinned(&self) -> bool {
        self.pinned.is_some()
    }

    /// Path the link is pinned at, if any.
    pub fn pinned_path(&self) -> Option<&Path> {
        self.pinned.as_deref()
    }

    /// System-wide link id.
    ///
    /// # Errors
    ///
    /// See [`Link::info`].
    pub fn id(&self) -> Result<u32, LinkError> {
        self.info().map(|info| info.id)
    }

    /// Replace the program only if `old` is still the one attached.
    ///
    /// # Errors
    ///
    /// As [`Link::update`]; the kernel reports `EPERM` when `old` is stale.
    pub fn update_replacing(&mut self, new: &Program, old: &Program) -> Result<(), LinkError> {
        self.update_with(new, old.fd(), BPF_F_REPLACE)
    }

    fn update_with(&mut self, new: &Program, old_fd: RawFd, flags: u32) -> Result<(), LinkError> {
        let fd = self.live("update")?;
        if let Some(attach) = self.attach {
            if !new.is_compatible_with(attach) {
                return Err(LinkError::IncompatibleProgram {
                    op: "update",
                    program: new.name().to_owned(),
                    program_type: new.prog_type(),
                    attach,
                });
            }
        }

        let attr = LinkUpdateAttr {
            link_fd: fd.raw(),
            new_prog_fd: new.fd(),
            old_prog_fd: old_fd,
            flags,
        };
        fd.kernel()
            .link_update(&attr)
            .map_err(|source| LinkError::Update {
                program: new.name().to_owned(),
                source,
            })?;
        debug!(fd = fd.raw(), program = new.name(), "link program replaced");
        Ok(())
    }
}

impl Link for RawLink {
    fn close(&mut self) -> Result<(), LinkError> {
        let Some(fd) = self.fd.take() else {
            return Ok(());
        };
        let raw = fd.raw();
        fd.close().map_err(|source| LinkError::Close { source })?;
        debug!(fd = raw, "link closed");
        Ok(())
    }

    fn pin(&mut self, path: &Path) -> Result<(), LinkError> {
        let fd = self.live("pin")?;
        if self.pinned.as_deref() == Some(path) {
            return Ok(());
        }

        fd.kernel()
            .obj_pin(fd.raw(), path)
            .map_err(|source| LinkError::Pin {
                path: path.to_path_buf(),
                source,
            })?;
        debug!(fd = fd.raw(), path = %path.display(), "link pinned");

        let kernel = Arc::clone(fd.kernel());
        let Some(old) = self.pinned.replace(path.to_path_buf()) else {
            return Ok(());
        };
        match kernel.unlink(&old) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => {
                warn!(path = %old.display(), error = %source, "failed to remove previous pin");
                Err(LinkError::Unpin { path: old, source })
            }
        }
    }

    fn unpin(&mut self) -> Result<(), LinkError> {
        let kernel = Arc::clone(self.live("unpin")?.kernel());
        let Some(path) = self.pinned.take() else {
            return Ok(());
        };

        match kernel.unlink(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "link unpinned");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => {
                self.pinned = Some(path.clone());
                Err(LinkError::Unpin { path, source })
            }
        }
    }

    fn update(&mut self, new: &Program) -> Result<(), LinkError> {
        self.update_with(new, 0, 0)
    }

    fn info(&self) -> Result<LinkInfo, LinkError> {
        let fd = self.live("info")?;
        fd.kernel()
            .link_info(fd.raw())
            .map_err(|source| LinkError::Info { source })
    }
}
