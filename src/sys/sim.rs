//! In-process model of the BPF link commands.
//!
//! `SimKernel` keeps programs, links, iterator instances and a pinning
//! namespace in memory. It follows the kernel's observable rules closely
//! enough to exercise the link layer without privileges: errno values,
//! type checks at attach and update, `EEXIST` on occupied pin paths, and
//! iterator instances that re-run their program on each read until EOF.
//!
//! [`SimKernel::restart`] drops every descriptor, as process exit would,
//! while pinned objects survive.

use std::collections::{HashMap, HashSet};
use std::io;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use super::{Kernel, LinkCreateAttr, LinkInfo, LinkType, LinkUpdateAttr, ObjectKind};
use crate::program::{AttachType, Program, ProgramType};

/// Default mount point of the simulated pinning filesystem.
pub const DEFAULT_BPFFS_ROOT: &str = "/sys/fs/bpf";

const BPF_F_REPLACE: u32 = 0x4;
const FIRST_FD: RawFd = 3;

/// Kernel command that can be made to fail with [`SimKernel::fail_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// `BPF_LINK_CREATE`.
    LinkCreate,
    /// `BPF_LINK_UPDATE`.
    LinkUpdate,
    /// `BPF_ITER_CREATE`.
    IterCreate,
    /// `BPF_OBJ_PIN`.
    ObjPin,
    /// `BPF_OBJ_GET`.
    ObjGet,
    /// `unlink(2)` of a pin path.
    Unlink,
    /// `read(2)` on an iterator instance.
    Read,
    /// `close(2)`.
    Close,
}

#[derive(Debug)]
struct SimProgram {
    prog_type: ProgramType,
    expected_attach: Option<AttachType>,
    output: Vec<u8>,
    runs: u64,
}

#[derive(Debug)]
struct SimLink {
    link_type: LinkType,
    attach: AttachType,
    prog_id: u32,
}

#[derive(Debug)]
struct IterInstance {
    prog_id: u32,
    pos: usize,
    done: bool,
}

#[derive(Debug)]
enum Object {
    Program(u32),
    Link(u32),
    Iter(IterInstance),
}

#[derive(Debug, Clone, Copy)]
enum Pinned {
    Program(u32),
    Link(u32),
}

#[derive(Debug)]
struct State {
    next_fd: RawFd,
    next_id: u32,
    programs: HashMap<u32, SimProgram>,
    links: HashMap<u32, SimLink>,
    fds: HashMap<RawFd, Object>,
    pins: HashMap<PathBuf, Pinned>,
    dirs: HashSet<PathBuf>,
    faults: HashMap<Command, i32>,
}

fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

impl State {
    fn fault(&mut self, cmd: Command) -> io::Result<()> {
        match self.faults.remove(&cmd) {
            Some(code) => Err(errno(code)),
            None => Ok(()),
        }
    }

    fn alloc_id(&mut self) -> io::Result<u32> {
        let id = self.next_id;
        self.next_id = id.checked_add(1).ok_or_else(|| errno(libc::ENOSPC))?;
        Ok(id)
    }

    fn install(&mut self, object: Object) -> io::Result<RawFd> {
        let fd = self.next_fd;
        self.next_fd = fd.checked_add(1).ok_or_else(|| errno(libc::EMFILE))?;
        self.fds.insert(fd, object);
        Ok(fd)
    }

    fn object(&self, fd: RawFd) -> io::Result<&Object> {
        self.fds.get(&fd).ok_or_else(|| errno(libc::EBADF))
    }

    fn program_id(&self, fd: RawFd) -> io::Result<u32> {
        match self.object(fd)? {
            Object::Program(id) => Ok(*id),
            _ => Err(errno(libc::EINVAL)),
        }
    }

    fn link_id(&self, fd: RawFd) -> io::Result<u32> {
        match self.object(fd)? {
            Object::Link(id) => Ok(*id),
            _ => Err(errno(libc::EINVAL)),
        }
    }

    fn program(&self, id: u32) -> io::Result<&SimProgram> {
        self.programs.get(&id).ok_or_else(|| errno(libc::ENOENT))
    }

    /// Drop links nothing refers to any more.
    fn collect_links(&mut self) {
        let mut live: HashSet<u32> = HashSet::new();
        for object in self.fds.values() {
            if let Object::Link(id) = object {
                live.insert(*id);
            }
        }
        for pinned in self.pins.values() {
            if let Pinned::Link(id) = pinned {
                live.insert(*id);
            }
        }
        self.links.retain(|id, _| live.contains(id));
    }
}

fn accepts(prog: &SimProgram, attach: AttachType) -> bool {
    let mut probe = Program::new(0, prog.prog_type);
    if let Some(expected) = prog.expected_attach {
        probe = probe.with_expected_attach(expected);
    }
    attach.program_types().is_some() && probe.is_compatible_with(attach)
}

/// Simulated kernel for tests and dry runs.
#[derive(Debug)]
pub struct SimKernel {
    root: PathBuf,
    read_chunk: usize,
    state: Mutex<State>,
}

impl SimKernel {
    /// Simulated kernel with bpffs mounted at [`DEFAULT_BPFFS_ROOT`].
    pub fn new() -> Self {
        Self::with_root(DEFAULT_BPFFS_ROOT)
    }

    /// Simulated kernel with bpffs mounted at `root`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let mut dirs = HashSet::new();
        dirs.insert(root.clone());
        Self {
            root,
            read_chunk: usize::MAX,
            state: Mutex::new(State {
                next_fd: FIRST_FD,
                next_id: 1,
                programs: HashMap::new(),
                links: HashMap::new(),
                fds: HashMap::new(),
                pins: HashMap::new(),
                dirs,
                faults: HashMap::new(),
            }),
        }
    }

    /// Cap how many bytes a single program run emits per read.
    #[must_use]
    pub fn with_read_chunk(mut self, bytes: usize) -> Self {
        self.read_chunk = bytes.max(1);
        self
    }

    /// Mount point of the pinning filesystem.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Load a program whose every run emits `output`, returning its reference.
    ///
    /// # Errors
    ///
    /// Returns `EMFILE`/`ENOSPC` only when descriptor or id space runs out.
    pub fn load_program(
        &self,
        prog_type: ProgramType,
        expected_attach: Option<AttachType>,
        output: &[u8],
    ) -> io::Result<Program> {
        let mut state = self.lock();
        let id = state.alloc_id()?;
        state.programs.insert(
            id,
            SimProgram {
                prog_type,
                expected_attach,
                output: output.to_vec(),
                runs: 0,
            },
        );
        let fd = state.install(Object::Program(id))?;
        debug!(fd, id, %prog_type, "sim: program loaded");
        let mut program = Program::new(fd, prog_type);
        if let Some(attach) = expected_attach {
            program = program.with_expected_attach(attach);
        }
        Ok(program)
    }

    /// Load a `BPF_TRACE_ITER` tracing program emitting `output`.
    ///
    /// # Errors
    ///
    /// See [`SimKernel::load_program`].
    pub fn load_iter_program(&self, output: &[u8]) -> io::Result<Program> {
        self.load_program(ProgramType::Tracing, Some(AttachType::TraceIter), output)
    }

    /// Create a directory inside the pinning filesystem.
    ///
    /// # Errors
    ///
    /// `EPERM` outside the mount, `ENOENT` without a parent, `EEXIST` if taken.
    pub fn create_dir(&self, path: &Path) -> io::Result<()> {
        let mut state = self.lock();
        if !path.starts_with(&self.root) {
            return Err(errno(libc::EPERM));
        }
        let parent_ok = path.parent().is_some_and(|p| state.dirs.contains(p));
        if !parent_ok {
            return Err(errno(libc::ENOENT));
        }
        if state.dirs.contains(path) || state.pins.contains_key(path) {
            return Err(errno(libc::EEXIST));
        }
        state.dirs.insert(path.to_path_buf());
        Ok(())
    }

    /// Make the next `cmd` fail with `code`.
    pub fn fail_next(&self, cmd: Command, code: i32) {
        self.lock().faults.insert(cmd, code);
    }

    /// Drop every open descriptor, as if the owning process exited.
    pub fn restart(&self) {
        let mut state = self.lock();
        let dropped = state.fds.len();
        state.fds.clear();
        state.collect_links();
        debug!(dropped, "sim: process restart");
    }

    /// Number of descriptors currently open.
    pub fn open_fds(&self) -> usize {
        self.lock().fds.len()
    }

    /// Number of live links.
    pub fn link_count(&self) -> usize {
        self.lock().links.len()
    }

    /// Whether something is pinned at `path`.
    pub fn is_pinned(&self, path: &Path) -> bool {
        self.lock().pins.contains_key(path)
    }

    /// How many times `program` has produced output.
    pub fn program_runs(&self, program: &Program) -> u64 {
        let state = self.lock();
        let runs = state
            .program_id(program.fd())
            .ok()
            .and_then(|id| state.programs.get(&id))
            .map(|p| p.runs);
        runs.unwrap_or(0)
    }
}

impl Default for SimKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel for SimKernel {
    fn link_create(&self, attr: &LinkCreateAttr) -> io::Result<RawFd> {
        let mut state = self.lock();
        state.fault(Command::LinkCreate)?;
        let prog_id = state.program_id(attr.prog_fd)?;
        let prog = state.program(prog_id)?;
        if !accepts(prog, attr.attach_type) {
            return Err(errno(libc::EINVAL));
        }
        if attr.attach_type == AttachType::TraceIter && (attr.target_fd != 0 || attr.flags != 0) {
            return Err(errno(libc::EINVAL));
        }
        let id = state.alloc_id()?;
        state.links.insert(
            id,
            SimLink {
                link_type: LinkType::for_attach(attr.attach_type),
                attach: attr.attach_type,
                prog_id,
            },
        );
        state.install(Object::Link(id))
    }

    fn link_update(&self, attr: &LinkUpdateAttr) -> io::Result<()> {
        let mut state = self.lock();
        state.fault(Command::LinkUpdate)?;
        let link_id = state.link_id(attr.link_fd)?;
        let new_id = state.program_id(attr.new_prog_fd)?;
        let old_id = if attr.flags & BPF_F_REPLACE != 0 {
            Some(state.program_id(attr.old_prog_fd)?)
        } else {
            None
        };
        let link = state.links.get(&link_id).ok_or_else(|| errno(libc::ENOLINK))?;
        let (attach, current) = (link.attach, link.prog_id);
        if old_id.is_some_and(|old| old != current) {
            return Err(errno(libc::EPERM));
        }
        let current_type = state.program(current)?.prog_type;
        let new_prog = state.program(new_id)?;
        if new_prog.prog_type != current_type || !accepts(new_prog, attach) {
            return Err(errno(libc::EINVAL));
        }
        if let Some(link) = state.links.get_mut(&link_id) {
            link.prog_id = new_id;
        }
        Ok(())
    }

    fn iter_create(&self, link_fd: RawFd) -> io::Result<RawFd> {
        let mut state = self.lock();
        state.fault(Command::IterCreate)?;
        let link_id = state.link_id(link_fd)?;
        let link = state.links.get(&link_id).ok_or_else(|| errno(libc::ENOLINK))?;
        if link.link_type != LinkType::Iter {
            return Err(errno(libc::EINVAL));
        }
        let prog_id = link.prog_id;
        state.install(Object::Iter(IterInstance {
            prog_id,
            pos: 0,
            done: false,
        }))
    }

    fn obj_pin(&self, fd: RawFd, path: &Path) -> io::Result<()> {
        let mut state = self.lock();
        state.fault(Command::ObjPin)?;
        let pinned = match state.object(fd)? {
            Object::Program(id) => Pinned::Program(*id),
            Object::Link(id) => Pinned::Link(*id),
            Object::Iter(_) => return Err(errno(libc::EINVAL)),
        };
        if !path.starts_with(&self.root) || path == self.root {
            return Err(errno(libc::EPERM));
        }
        let parent_ok = path.parent().is_some_and(|p| state.dirs.contains(p));
        if !parent_ok {
            return Err(errno(libc::ENOENT));
        }
        if state.pins.contains_key(path) || state.dirs.contains(path) {
            return Err(errno(libc::EEXIST));
        }
        state.pins.insert(path.to_path_buf(), pinned);
        Ok(())
    }

    fn obj_get(&self, path: &Path) -> io::Result<RawFd> {
        let mut state = self.lock();
        state.fault(Command::ObjGet)?;
        let pinned = *state.pins.get(path).ok_or_else(|| errno(libc::ENOENT))?;
        let object = match pinned {
            Pinned::Program(id) => Object::Program(id),
            Pinned::Link(id) => Object::Link(id),
        };
        state.install(object)
    }

    fn unlink(&self, path: &Path) -> io::Result<()> {
        let mut state = self.lock();
        state.fault(Command::Unlink)?;
        state
            .pins
            .remove(path)
            .ok_or_else(|| errno(libc::ENOENT))?;
        state.collect_links();
        Ok(())
    }

    fn object_kind(&self, fd: RawFd) -> io::Result<ObjectKind> {
        let state = self.lock();
        let kind = match state.object(fd)? {
            Object::Program(_) => ObjectKind::Program,
            Object::Link(_) => ObjectKind::Link,
            Object::Iter(_) => ObjectKind::Other,
        };
        Ok(kind)
    }

    fn link_info(&self, fd: RawFd) -> io::Result<LinkInfo> {
        let state = self.lock();
        let id = state.link_id(fd)?;
        let link = state.links.get(&id).ok_or_else(|| errno(libc::ENOLINK))?;
        Ok(LinkInfo {
            link_type: link.link_type,
            id,
            prog_id: link.prog_id,
        })
    }

    fn read(&self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
        let mut guard = self.lock();
        guard.fault(Command::Read)?;
        if buf.is_empty() {
            return Ok(0);
        }
        let state = &mut *guard;
        let iter = match state.fds.get_mut(&fd) {
            Some(Object::Iter(iter)) => iter,
            Some(_) => return Err(errno(libc::EINVAL)),
            None => return Err(errno(libc::EBADF)),
        };
        if iter.done {
            return Ok(0);
        }
        let prog = state
            .programs
            .get_mut(&iter.prog_id)
            .ok_or_else(|| errno(libc::ENOENT))?;
        let remaining = prog.output.get(iter.pos..).unwrap_or_default();
        if remaining.is_empty() {
            iter.done = true;
            return Ok(0);
        }
        let n = remaining.len().min(buf.len()).min(self.read_chunk);
        buf[..n].copy_from_slice(&remaining[..n]);
        iter.pos = iter.pos.saturating_add(n);
        prog.runs = prog.runs.saturating_add(1);
        Ok(n)
    }

    fn close(&self, fd: RawFd) -> io::Result<()> {
        let mut state = self.lock();
        state.fault(Command::Close)?;
        state.fds.remove(&fd).ok_or_else(|| errno(libc::EBADF))?;
        state.collect_links();
        Ok(())
    }
}
