//! bpflink: BPF link handles.
//!
//! Binds loaded programs to attach points, pins links in the BPF
//! filesystem, swaps programs atomically, and turns iterator links into
//! readable streams that run the program on every read.
//!
//! Program loading is out of scope: callers hand in a [`Program`]
//! describing an already loaded program. Kernel access goes through the
//! [`sys::Kernel`] trait.
//!
//! See `DESIGN.md` for full architecture documentation.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod fd;
pub mod link;
pub mod logging;
pub mod program;
pub mod sys;

pub use fd::Fd;
pub use link::{
    attach_iter, load_pinned_iter, Iter, IterOptions, IterStream, Link, LinkError, LinkInfo,
    LinkType, RawLink, RawLinkOptions,
};
pub use program::{AttachType, Program, ProgramType};
