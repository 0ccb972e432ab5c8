//! `bpf(2)` on the running Linux kernel.
//!
//! Attribute structs mirror the prefix of `union bpf_attr` used by each
//! command; the kernel zero-extends anything past the size we pass.

#![allow(unsafe_code)]

use std::ffi::CString;
use std::io;
use std::mem;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use tracing::trace;

use super::{Kernel, LinkCreateAttr, LinkInfo, LinkType, LinkUpdateAttr, ObjectKind};

const BPF_OBJ_PIN: libc::c_int = 6;
const BPF_OBJ_GET: libc::c_int = 7;
const BPF_OBJ_GET_INFO_BY_FD: libc::c_int = 15;
const BPF_LINK_CREATE: libc::c_int = 28;
const BPF_LINK_UPDATE: libc::c_int = 29;
const BPF_ITER_CREATE: libc::c_int = 33;

#[repr(C)]
#[derive(Default)]
struct ObjAttr {
    pathname: u64,
    bpf_fd: u32,
    file_flags: u32,
}

#[repr(C)]
#[derive(Default)]
struct LinkCreateRaw {
    prog_fd: u32,
    target_fd: u32,
    attach_type: u32,
    flags: u32,
    target_btf_id: u32,
    _pad: u32,
}

#[repr(C)]
#[derive(Default)]
struct LinkUpdateRaw {
    link_fd: u32,
    new_prog_fd: u32,
    flags: u32,
    old_prog_fd: u32,
}

#[repr(C)]
#[derive(Default)]
struct IterCreateRaw {
    link_fd: u32,
    flags: u32,
}

#[repr(C)]
#[derive(Default)]
struct InfoByFdRaw {
    bpf_fd: u32,
    info_len: u32,
    info: u64,
}

#[repr(C)]
#[derive(Default)]
struct LinkInfoRaw {
    link_type: u32,
    id: u32,
    prog_id: u32,
    _pad: u32,
}

/// [`Kernel`] backed by real `bpf(2)` syscalls.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxKernel;

impl LinuxKernel {
    /// Create a handle to the running kernel.
    pub fn new() -> Self {
        Self
    }
}

#[cfg(target_os = "linux")]
fn sys_bpf<T>(cmd: libc::c_int, attr: &mut T) -> io::Result<libc::c_long> {
    let size = libc::c_uint::try_from(mem::size_of::<T>())
        .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    // SAFETY: `attr` is a live, exclusively borrowed `#[repr(C)]` struct of
    // exactly `size` bytes laid out as the prefix of `union bpf_attr` for
    // `cmd`. Any pointers stored inside it reference buffers that outlive
    // this call.
    let ret = unsafe { libc::syscall(libc::SYS_bpf, cmd, attr as *mut T, size) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret)
}

#[cfg(not(target_os = "linux"))]
fn sys_bpf<T>(_cmd: libc::c_int, _attr: &mut T) -> io::Result<libc::c_long> {
    Err(io::Error::from(io::ErrorKind::Unsupported))
}

fn fd_arg(fd: RawFd) -> io::Result<u32> {
    u32::try_from(fd).map_err(|_| io::Error::from_raw_os_error(libc::EBADF))
}

fn fd_ret(ret: libc::c_long) -> io::Result<RawFd> {
    RawFd::try_from(ret).map_err(|_| io::Error::other(format!("descriptor {ret} out of range")))
}

fn c_path(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("path contains a NUL byte: {}", path.display()),
        )
    })
}

impl Kernel for LinuxKernel {
    fn link_create(&self, attr: &LinkCreateAttr) -> io::Result<RawFd> {
        let mut raw = LinkCreateRaw {
            prog_fd: fd_arg(attr.prog_fd)?,
            target_fd: fd_arg(attr.target_fd)?,
            attach_type: attr.attach_type.as_raw(),
            flags: attr.flags,
            target_btf_id: attr.target_btf_id,
            ..LinkCreateRaw::default()
        };
        let fd = fd_ret(sys_bpf(BPF_LINK_CREATE, &mut raw)?)?;
        trace!(fd, attach = %attr.attach_type, "BPF_LINK_CREATE");
        Ok(fd)
    }

    fn link_update(&self, attr: &LinkUpdateAttr) -> io::Result<()> {
        let mut raw = LinkUpdateRaw {
            link_fd: fd_arg(attr.link_fd)?,
            new_prog_fd: fd_arg(attr.new_prog_fd)?,
            flags: attr.flags,
            old_prog_fd: fd_arg(attr.old_prog_fd)?,
        };
        sys_bpf(BPF_LINK_UPDATE, &mut raw)?;
        Ok(())
    }

    fn iter_create(&self, link_fd: RawFd) -> io::Result<RawFd> {
        let mut raw = IterCreateRaw {
            link_fd: fd_arg(link_fd)?,
            flags: 0,
        };
        let fd = fd_ret(sys_bpf(BPF_ITER_CREATE, &mut raw)?)?;
        trace!(fd, link_fd, "BPF_ITER_CREATE");
        Ok(fd)
    }

    fn obj_pin(&self, fd: RawFd, path: &Path) -> io::Result<()> {
        let pathname = c_path(path)?;
        let mut raw = ObjAttr {
            pathname: pathname.as_ptr() as u64,
            bpf_fd: fd_arg(fd)?,
            file_flags: 0,
        };
        sys_bpf(BPF_OBJ_PIN, &mut raw)?;
        Ok(())
    }

    fn obj_get(&self, path: &Path) -> io::Result<RawFd> {
        let pathname = c_path(path)?;
        let mut raw = ObjAttr {
            pathname: pathname.as_ptr() as u64,
            ..ObjAttr::default()
        };
        fd_ret(sys_bpf(BPF_OBJ_GET, &mut raw)?)
    }

    fn unlink(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }

    fn object_kind(&self, fd: RawFd) -> io::Result<ObjectKind> {
        let target = std::fs::read_link(format!("/proc/self/fd/{fd}"))?;
        let kind = match target.as_os_str().as_bytes() {
            b"anon_inode:bpf-link" => ObjectKind::Link,
            b"anon_inode:bpf-prog" => ObjectKind::Program,
            b"anon_inode:bpf-map" => ObjectKind::Map,
            _ => ObjectKind::Other,
        };
        Ok(kind)
    }

    fn link_info(&self, fd: RawFd) -> io::Result<LinkInfo> {
        let mut info = LinkInfoRaw::default();
        let mut raw = InfoByFdRaw {
            bpf_fd: fd_arg(fd)?,
            info_len: u32::try_from(mem::size_of::<LinkInfoRaw>())
                .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?,
            info: &mut info as *mut LinkInfoRaw as u64,
        };
        sys_bpf(BPF_OBJ_GET_INFO_BY_FD, &mut raw)?;
        Ok(LinkInfo {
            link_type: LinkType::from_raw(info.link_type),
            id: info.id,
            prog_id: info.prog_id,
        })
    }

    fn read(&self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
        // SAFETY: `buf` is a valid, exclusively borrowed region of
        // `buf.len()` bytes for the duration of the call.
        let ret = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        usize::try_from(ret).map_err(|_| io::Error::other("negative read length"))
    }

    fn close(&self, fd: RawFd) -> io::Result<()> {
        // SAFETY: the caller owns `fd` and gives it up here; it is never
        // used again after this call.
        let ret = unsafe { libc::close(fd) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}
