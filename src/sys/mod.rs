//! Kernel primitives consumed by the link layer.
//!
//! The [`Kernel`] trait is the narrow boundary to `bpf(2)`: every method
//! issues one blocking kernel operation and returns either a raw descriptor
//! or an OS error. [`linux::LinuxKernel`] talks to the running kernel;
//! [`sim::SimKernel`] is an in-process model of the same commands.

use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::path::Path;

use crate::program::AttachType;

pub mod linux;
pub mod sim;

/// Arguments for `BPF_LINK_CREATE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkCreateAttr {
    /// Program descriptor to attach.
    pub prog_fd: RawFd,
    /// Target descriptor (cgroup, netns, ...), `0` when unused.
    pub target_fd: RawFd,
    /// Attach-type tag.
    pub attach_type: AttachType,
    /// Target BTF id, `0` when unused.
    pub target_btf_id: u32,
    /// `BPF_F_*` link flags.
    pub flags: u32,
}

/// Arguments for `BPF_LINK_UPDATE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkUpdateAttr {
    /// Link descriptor.
    pub link_fd: RawFd,
    /// Replacement program descriptor.
    pub new_prog_fd: RawFd,
    /// Program expected to be attached, used with `BPF_F_REPLACE`.
    pub old_prog_fd: RawFd,
    /// Update flags.
    pub flags: u32,
}

/// Kernel object behind a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    /// A BPF link.
    Link,
    /// A BPF program.
    Program,
    /// A BPF map.
    Map,
    /// Anything else, including iterator streams.
    Other,
}

/// Kernel link type (`enum bpf_link_type`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkType {
    /// `BPF_LINK_TYPE_RAW_TRACEPOINT`.
    RawTracepoint,
    /// `BPF_LINK_TYPE_TRACING`.
    Tracing,
    /// `BPF_LINK_TYPE_CGROUP`.
    Cgroup,
    /// `BPF_LINK_TYPE_ITER`.
    Iter,
    /// `BPF_LINK_TYPE_NETNS`.
    Netns,
    /// `BPF_LINK_TYPE_XDP`.
    Xdp,
    /// Any other link type, by raw value.
    Other(u32),
}

impl LinkType {
    /// Raw kernel value.
    pub fn as_raw(self) -> u32 {
        match self {
            Self::RawTracepoint => 1,
            Self::Tracing => 2,
            Self::Cgroup => 3,
            Self::Iter => 4,
            Self::Netns => 5,
            Self::Xdp => 6,
            Self::Other(raw) => raw,
        }
    }

    /// Map a raw kernel value back to a link type.
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::RawTracepoint,
            2 => Self::Tracing,
            3 => Self::Cgroup,
            4 => Self::Iter,
            5 => Self::Netns,
            6 => Self::Xdp,
            other => Self::Other(other),
        }
    }

    /// Link type the kernel creates for an attach type.
    pub fn for_attach(attach: AttachType) -> Self {
        match attach {
            AttachType::TraceIter => Self::Iter,
            AttachType::TraceRawTp => Self::RawTracepoint,
            AttachType::TraceFentry
            | AttachType::TraceFexit
            | AttachType::ModifyReturn
            | AttachType::LsmMac => Self::Tracing,
            AttachType::CgroupInetIngress | AttachType::CgroupInetEgress => Self::Cgroup,
            AttachType::SkLookup => Self::Netns,
            AttachType::Xdp => Self::Xdp,
            AttachType::Other(_) => Self::Other(0),
        }
    }

    /// Attach type implied by this link type, when it is unambiguous.
    pub fn attach_type(self) -> Option<AttachType> {
        match self {
            Self::Iter => Some(AttachType::TraceIter),
            Self::Xdp => Some(AttachType::Xdp),
            Self::Netns => Some(AttachType::SkLookup),
            _ => None,
        }
    }
}

impl fmt::Display for LinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RawTracepoint => f.write_str("raw_tracepoint"),
            Self::Tracing => f.write_str("tracing"),
            Self::Cgroup => f.write_str("cgroup"),
            Self::Iter => f.write_str("iter"),
            Self::Netns => f.write_str("netns"),
            Self::Xdp => f.write_str("xdp"),
            Self::Other(raw) => write!(f, "link_type({raw})"),
        }
    }
}

/// Kernel-reported link metadata (`struct bpf_link_info` header).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkInfo {
    /// Link type.
    pub link_type: LinkType,
    /// System-wide link id.
    pub id: u32,
    /// Id of the currently attached program.
    pub prog_id: u32,
}

/// Blocking kernel primitives used by links and iterator streams.
///
/// Descriptors returned by this trait are owned by the caller, which must
/// hand each of them back to [`Kernel::close`] exactly once.
pub trait Kernel: fmt::Debug + Send + Sync {
    /// `BPF_LINK_CREATE`: attach a program, returning the link descriptor.
    fn link_create(&self, attr: &LinkCreateAttr) -> io::Result<RawFd>;

    /// `BPF_LINK_UPDATE`: atomically replace the program behind a link.
    fn link_update(&self, attr: &LinkUpdateAttr) -> io::Result<()>;

    /// `BPF_ITER_CREATE`: mint a readable iterator instance from a link.
    fn iter_create(&self, link_fd: RawFd) -> io::Result<RawFd>;

    /// `BPF_OBJ_PIN`: persist an object at a path in the pinning filesystem.
    fn obj_pin(&self, fd: RawFd, path: &Path) -> io::Result<()>;

    /// `BPF_OBJ_GET`: open a pinned object, returning a new descriptor.
    fn obj_get(&self, path: &Path) -> io::Result<RawFd>;

    /// Remove a pinned entry.
    fn unlink(&self, path: &Path) -> io::Result<()>;

    /// Classify the object behind a descriptor.
    fn object_kind(&self, fd: RawFd) -> io::Result<ObjectKind>;

    /// `BPF_OBJ_GET_INFO_BY_FD` for a link descriptor.
    fn link_info(&self, fd: RawFd) -> io::Result<LinkInfo>;

    /// Read from an iterator instance; `Ok(0)` means the program is done.
    fn read(&self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize>;

    /// Release a descriptor.
    fn close(&self, fd: RawFd) -> io::Result<()>;
}
