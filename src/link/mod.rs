//! Links: persistent bindings of a loaded program to an attach point.
//!
//! [`RawLink`] is the generic attachment. Specialized variants such as
//! [`Iter`] wrap a `RawLink` and forward the shared [`Link`] capabilities
//! to it.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::program::{AttachType, Program, ProgramType};

pub mod iter;
pub mod raw;

pub use crate::sys::{LinkInfo, LinkType};
pub use iter::{attach_iter, load_pinned_iter, Iter, IterOptions, IterStream, ITER_STREAM_NAME};
pub use raw::{RawLink, RawLinkOptions};

/// Errors produced by link and iterator operations.
#[derive(Debug, Error)]
pub enum LinkError {
    /// The kernel refused to create the link.
    #[error("can't link program as {attach}: {source}")]
    Attach {
        /// Requested attach type.
        attach: AttachType,
        /// Kernel error.
        #[source]
        source: io::Error,
    },
    /// The program's type does not fit the attach type.
    #[error("{op}: program {program} of type {program_type} is not compatible with {attach}")]
    IncompatibleProgram {
        /// Operation that was refused (`attach` or `update`).
        op: &'static str,
        /// Program name.
        program: String,
        /// Declared program type.
        program_type: ProgramType,
        /// Attach type of the link.
        attach: AttachType,
    },
    /// Opening a pinned object failed.
    #[error("load pinned link {}: {source}", .path.display())]
    LoadPinned {
        /// Pin path.
        path: PathBuf,
        /// Kernel error.
        #[source]
        source: io::Error,
    },
    /// The pinned object is not a link.
    #[error("{} is not a link", .path.display())]
    NotALink {
        /// Pin path.
        path: PathBuf,
    },
    /// Pinning failed.
    #[error("pin link to {}: {source}", .path.display())]
    Pin {
        /// Requested pin path.
        path: PathBuf,
        /// Kernel error.
        #[source]
        source: io::Error,
    },
    /// Removing the pin failed.
    #[error("unpin link from {}: {source}", .path.display())]
    Unpin {
        /// Current pin path.
        path: PathBuf,
        /// Kernel error.
        #[source]
        source: io::Error,
    },
    /// The kernel refused to swap the program.
    #[error("update link program to {program}: {source}")]
    Update {
        /// Replacement program name.
        program: String,
        /// Kernel error.
        #[source]
        source: io::Error,
    },
    /// Creating an iterator instance failed.
    #[error("can't create iterator: {source}")]
    Open {
        /// Kernel error.
        #[source]
        source: io::Error,
    },
    /// Reading an iterator instance failed.
    #[error("read iterator: {source}")]
    Read {
        /// Kernel error.
        #[source]
        source: io::Error,
    },
    /// Querying link metadata failed.
    #[error("link info: {source}")]
    Info {
        /// Kernel error.
        #[source]
        source: io::Error,
    },
    /// Releasing the handle failed.
    #[error("close: {source}")]
    Close {
        /// Kernel error.
        #[source]
        source: io::Error,
    },
    /// The object was already closed.
    #[error("{op} on closed {object}")]
    Closed {
        /// Operation attempted.
        op: &'static str,
        /// `"link"` or `"iterator stream"`.
        object: &'static str,
    },
}

impl LinkError {
    /// OS error code of the underlying kernel failure, if any.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::Attach { source, .. }
            | Self::LoadPinned { source, .. }
            | Self::Pin { source, .. }
            | Self::Unpin { source, .. }
            | Self::Update { source, .. }
            | Self::Open { source }
            | Self::Read { source }
            | Self::Info { source }
            | Self::Close { source } => source.raw_os_error(),
            Self::IncompatibleProgram { .. } | Self::NotALink { .. } | Self::Closed { .. } => None,
        }
    }

    /// Whether this is a use-after-close error.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed { .. })
    }
}

/// Capabilities shared by every link variant.
///
/// Variants compose a [`RawLink`] and forward these calls to it.
pub trait Link: std::fmt::Debug + Send {
    /// Release the link's handle.
    ///
    /// The attachment itself persists while the link is pinned. Closing an
    /// already closed link is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Close`] if the kernel fails to release the handle.
    fn close(&mut self) -> Result<(), LinkError>;

    /// Persist the link at `path` in the pinning filesystem.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Pin`] if the path is taken or not on bpffs,
    /// [`LinkError::Closed`] after close.
    fn pin(&mut self, path: &Path) -> Result<(), LinkError>;

    /// Remove the link's pin, if any.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Unpin`] if the entry cannot be removed,
    /// [`LinkError::Closed`] after close.
    fn unpin(&mut self) -> Result<(), LinkError>;

    /// Atomically replace the attached program.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::IncompatibleProgram`] or [`LinkError::Update`]
    /// if the replacement is refused, [`LinkError::Closed`] after close.
    fn update(&mut self, new: &Program) -> Result<(), LinkError>;

    /// Kernel metadata for the link.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Info`] on kernel failure, [`LinkError::Closed`]
    /// after close.
    fn info(&self) -> Result<LinkInfo, LinkError>;
}
