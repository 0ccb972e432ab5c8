//! Loaded-program references and the attach-type vocabulary.
//!
//! Loading and verifying programs happens elsewhere. This crate only
//! receives a descriptor plus the program's declared types and checks
//! them at the attach-type boundary.

use std::fmt;
use std::os::fd::RawFd;

/// Kernel program type (`enum bpf_prog_type`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgramType {
    /// `BPF_PROG_TYPE_SOCKET_FILTER`.
    SocketFilter,
    /// `BPF_PROG_TYPE_KPROBE`.
    Kprobe,
    /// `BPF_PROG_TYPE_XDP`.
    Xdp,
    /// `BPF_PROG_TYPE_CGROUP_SKB`.
    CgroupSkb,
    /// `BPF_PROG_TYPE_RAW_TRACEPOINT`.
    RawTracepoint,
    /// `BPF_PROG_TYPE_TRACING`.
    Tracing,
    /// `BPF_PROG_TYPE_LSM`.
    Lsm,
    /// `BPF_PROG_TYPE_SK_LOOKUP`.
    SkLookup,
    /// Any other kernel program type, by raw value.
    Other(u32),
}

impl ProgramType {
    /// Raw kernel value.
    pub fn as_raw(self) -> u32 {
        match self {
            Self::SocketFilter => 1,
            Self::Kprobe => 2,
            Self::Xdp => 6,
            Self::CgroupSkb => 8,
            Self::RawTracepoint => 17,
            Self::Tracing => 26,
            Self::Lsm => 29,
            Self::SkLookup => 30,
            Self::Other(raw) => raw,
        }
    }

    /// Map a raw kernel value back to a program type.
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::SocketFilter,
            2 => Self::Kprobe,
            6 => Self::Xdp,
            8 => Self::CgroupSkb,
            17 => Self::RawTracepoint,
            26 => Self::Tracing,
            29 => Self::Lsm,
            30 => Self::SkLookup,
            other => Self::Other(other),
        }
    }
}

impl fmt::Display for ProgramType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SocketFilter => f.write_str("socket_filter"),
            Self::Kprobe => f.write_str("kprobe"),
            Self::Xdp => f.write_str("xdp"),
            Self::CgroupSkb => f.write_str("cgroup_skb"),
            Self::RawTracepoint => f.write_str("raw_tracepoint"),
            Self::Tracing => f.write_str("tracing"),
            Self::Lsm => f.write_str("lsm"),
            Self::SkLookup => f.write_str("sk_lookup"),
            Self::Other(raw) => write!(f, "prog_type({raw})"),
        }
    }
}

/// Attach-type tag (`enum bpf_attach_type`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttachType {
    /// `BPF_CGROUP_INET_INGRESS`.
    CgroupInetIngress,
    /// `BPF_CGROUP_INET_EGRESS`.
    CgroupInetEgress,
    /// `BPF_TRACE_RAW_TP`.
    TraceRawTp,
    /// `BPF_TRACE_FENTRY`.
    TraceFentry,
    /// `BPF_TRACE_FEXIT`.
    TraceFexit,
    /// `BPF_MODIFY_RETURN`.
    ModifyReturn,
    /// `BPF_LSM_MAC`.
    LsmMac,
    /// `BPF_TRACE_ITER`: seq_file iterators.
    TraceIter,
    /// `BPF_SK_LOOKUP`.
    SkLookup,
    /// `BPF_XDP`.
    Xdp,
    /// Any other attach type, by raw value. Compatibility is left to the kernel.
    Other(u32),
}

impl AttachType {
    /// Raw kernel value.
    pub fn as_raw(self) -> u32 {
        match self {
            Self::CgroupInetIngress => 0,
            Self::CgroupInetEgress => 1,
            Self::TraceRawTp => 23,
            Self::TraceFentry => 24,
            Self::TraceFexit => 25,
            Self::ModifyReturn => 26,
            Self::LsmMac => 27,
            Self::TraceIter => 28,
            Self::SkLookup => 36,
            Self::Xdp => 37,
            Self::Other(raw) => raw,
        }
    }

    /// Map a raw kernel value back to an attach type.
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::CgroupInetIngress,
            1 => Self::CgroupInetEgress,
            23 => Self::TraceRawTp,
            24 => Self::TraceFentry,
            25 => Self::TraceFexit,
            26 => Self::ModifyReturn,
            27 => Self::LsmMac,
            28 => Self::TraceIter,
            36 => Self::SkLookup,
            37 => Self::Xdp,
            other => Self::Other(other),
        }
    }

    /// Program types the kernel accepts for this attach type.
    ///
    /// Returns `None` for [`AttachType::Other`], where only the kernel knows.
    pub fn program_types(self) -> Option<&'static [ProgramType]> {
        let types: &'static [ProgramType] = match self {
            Self::CgroupInetIngress | Self::CgroupInetEgress => &[ProgramType::CgroupSkb],
            Self::TraceRawTp => &[ProgramType::Tracing, ProgramType::RawTracepoint],
            Self::TraceFentry | Self::TraceFexit | Self::ModifyReturn | Self::TraceIter => {
                &[ProgramType::Tracing]
            }
            Self::LsmMac => &[ProgramType::Lsm],
            Self::SkLookup => &[ProgramType::SkLookup],
            Self::Xdp => &[ProgramType::Xdp],
            Self::Other(_) => return None,
        };
        Some(types)
    }
}

impl fmt::Display for AttachType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CgroupInetIngress => f.write_str("cgroup_inet_ingress"),
            Self::CgroupInetEgress => f.write_str("cgroup_inet_egress"),
            Self::TraceRawTp => f.write_str("trace_raw_tp"),
            Self::TraceFentry => f.write_str("trace_fentry"),
            Self::TraceFexit => f.write_str("trace_fexit"),
            Self::ModifyReturn => f.write_str("modify_return"),
            Self::LsmMac => f.write_str("lsm_mac"),
            Self::TraceIter => f.write_str("trace_iter"),
            Self::SkLookup => f.write_str("sk_lookup"),
            Self::Xdp => f.write_str("xdp"),
            Self::Other(raw) => write!(f, "attach_type({raw})"),
        }
    }
}

/// Reference to a program loaded by an external loader.
///
/// The descriptor is borrowed: the caller keeps it open for as long as the
/// reference is used, and this crate never closes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    fd: RawFd,
    prog_type: ProgramType,
    expected_attach: Option<AttachType>,
    name: Option<String>,
}

impl Program {
    /// Describe a loaded program by descriptor and type.
    pub fn new(fd: RawFd, prog_type: ProgramType) -> Self {
        Self {
            fd,
            prog_type,
            expected_attach: None,
            name: None,
        }
    }

    /// Record the attach type the program was loaded for
    /// (`expected_attach_type` at load time).
    #[must_use]
    pub fn with_expected_attach(mut self, attach: AttachType) -> Self {
        self.expected_attach = Some(attach);
        self
    }

    /// Attach a name used in log output.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Borrowed program descriptor.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Declared program type.
    pub fn prog_type(&self) -> ProgramType {
        self.prog_type
    }

    /// Attach type the program was loaded for, if declared.
    pub fn expected_attach(&self) -> Option<AttachType> {
        self.expected_attach
    }

    /// Diagnostic name, or `"<anonymous>"`.
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("<anonymous>")
    }

    /// Whether this program can be bound to `attach`.
    ///
    /// Checks the program type against the types the attach point accepts,
    /// and the declared expected attach type when there is one. Unknown
    /// attach types are accepted and left for the kernel to judge.
    pub fn is_compatible_with(&self, attach: AttachType) -> bool {
        if let Some(expected) = self.expected_attach {
            if expected != attach {
                return false;
            }
        }
        match attach.program_types() {
            Some(types) => types.contains(&self.prog_type),
            None => true,
        }
    }
}
