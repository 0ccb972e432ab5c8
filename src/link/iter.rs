//! BPF seq_file iterators.
//!
//! An [`Iter`] is a link of attach type [`AttachType::TraceIter`]. Each
//! [`Iter::open`] mints an independent [`IterStream`]; reading it runs the
//! attached program inside the kernel and returns what it printed.

use std::io::{self, Read};
use std::os::fd::RawFd;
use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use super::{Link, LinkError, LinkInfo, RawLink, RawLinkOptions};
use crate::fd::Fd;
use crate::program::{AttachType, Program};
use crate::sys::Kernel;

/// Diagnostic name of iterator streams.
pub const ITER_STREAM_NAME: &str = "bpf_iter";

/// Arguments for [`attach_iter`].
#[derive(Debug, Clone, Copy)]
pub struct IterOptions<'a> {
    /// A tracing program loaded with expected attach type
    /// [`AttachType::TraceIter`]. Which kernel object it walks is fixed at
    /// load time.
    pub program: &'a Program,
}

/// Attach a seq_file iterator.
///
/// # Errors
///
/// See [`RawLink::attach`].
pub fn attach_iter(kernel: &Arc<dyn Kernel>, opts: IterOptions<'_>) -> Result<Iter, LinkError> {
    let link = RawLink::attach(
        kernel,
        &RawLinkOptions::new(opts.program, AttachType::TraceIter),
    )?;
    Ok(Iter { link })
}

/// Load an iterator pinned at `path`.
///
/// Only the object kind is checked here. A pinned link of another type
/// loads fine and fails at [`Iter::open`] with `EINVAL`.
///
/// # Errors
///
/// See [`RawLink::load_pinned`].
pub fn load_pinned_iter(kernel: &Arc<dyn Kernel>, path: &Path) -> Result<Iter, LinkError> {
    let link = RawLink::load_pinned(kernel, path)?;
    Ok(Iter { link })
}

/// An attached iterator.
#[derive(Debug)]
pub struct Iter {
    link: RawLink,
}

impl Iter {
    /// Create a new instance of the iterator.
    ///
    /// Every call returns an independent stream. Reading it triggers the
    /// program.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Closed`] after [`Link::close`], or
    /// [`LinkError::Open`] when the kernel rejects the request.
    pub fn open(&self) -> Result<IterStream, LinkError> {
        let link_fd = self.link.live("open")?;
        let kernel = link_fd.kernel();
        let raw = kernel
            .iter_create(link_fd.raw())
            .map_err(|source| LinkError::Open { source })?;
        debug!(fd = raw, link_fd = link_fd.raw(), "iterator opened");
        Ok(IterStream {
            fd: Some(Fd::new(Arc::clone(kernel), raw)),
            eof: false,
        })
    }

    /// The underlying generic link.
    pub fn raw(&self) -> &RawLink {
        &self.link
    }

    /// Give up the iterator wrapper, keeping the link.
    pub fn into_raw(self) -> RawLink {
        self.link
    }
}

impl Link for Iter {
    /// Close the iterator link.
    ///
    /// Whether streams opened earlier keep producing output afterwards is
    /// up to the kernel. They stay safe to read and close either way.
    fn close(&mut self) -> Result<(), LinkError> {
        self.link.close()
    }

    fn pin(&mut self, path: &Path) -> Result<(), LinkError> {
        self.link.pin(path)
    }

    fn unpin(&mut self) -> Result<(), LinkError> {
        self.link.unpin()
    }

    fn update(&mut self, new: &Program) -> Result<(), LinkError> {
        self.link.update(new)
    }

    fn info(&self) -> Result<LinkInfo, LinkError> {
        self.link.info()
    }
}

/// A readable iterator instance.
///
/// Each read re-runs the program. `Ok(0)` marks the end of this pass and
/// is final: later reads return `Ok(0)` again without entering the kernel,
/// and a fresh pass needs a new [`Iter::open`].
///
/// The stream owns its own handle and outlives the [`Iter`] it came from.
#[derive(Debug)]
pub struct IterStream {
    fd: Option<Fd>,
    eof: bool,
}

impl IterStream {
    /// Diagnostic name, always [`ITER_STREAM_NAME`].
    pub fn name(&self) -> &'static str {
        ITER_STREAM_NAME
    }

    /// Raw stream descriptor, `None` once closed.
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.fd.as_ref().map(Fd::raw)
    }

    /// Whether the program has signalled the end of output.
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Read everything the program produces until EOF.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Closed`] after close, [`LinkError::Read`] when
    /// the kernel fails a read.
    pub fn read_to_vec(&mut self) -> Result<Vec<u8>, LinkError> {
        if self.fd.is_none() {
            return Err(LinkError::Closed {
                op: "read",
                object: "iterator stream",
            });
        }
        let mut out = Vec::new();
        self.read_to_end(&mut out)
            .map_err(|source| LinkError::Read { source })?;
        Ok(out)
    }

    /// Release the stream. Closing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Close`] if the kernel fails to release it.
    pub fn close(&mut self) -> Result<(), LinkError> {
        let Some(fd) = self.fd.take() else {
            return Ok(());
        };
        let raw = fd.raw();
        fd.close().map_err(|source| LinkError::Close { source })?;
        debug!(fd = raw, "iterator stream closed");
        Ok(())
    }
}

impl Read for IterStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(fd) = self.fd.as_ref() else {
            return Err(io::Error::other(LinkError::Closed {
                op: "read",
                object: "iterator stream",
            }));
        };
        if self.eof || buf.is_empty() {
            return Ok(0);
        }
        loop {
            match fd.kernel().read(fd.raw(), buf) {
                Ok(0) => {
                    self.eof = true;
                    return Ok(0);
                }
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}
