//! Generic link lifecycle against the simulated kernel.

use std::path::Path;
use std::sync::Arc;

use bpflink::sys::sim::{Command, SimKernel};
use bpflink::sys::Kernel;
use bpflink::{AttachType, Link, LinkError, LinkType, ProgramType, RawLink, RawLinkOptions};

fn setup() -> (Arc<SimKernel>, Arc<dyn Kernel>) {
    let sim = Arc::new(SimKernel::new());
    let kernel: Arc<dyn Kernel> = sim.clone();
    (sim, kernel)
}

fn iter_link(sim: &SimKernel, kernel: &Arc<dyn Kernel>) -> RawLink {
    let prog = match sim.load_iter_program(b"out") {
        Ok(prog) => prog,
        Err(err) => panic!("program should load: {err}"),
    };
    match RawLink::attach(kernel, &RawLinkOptions::new(&prog, AttachType::TraceIter)) {
        Ok(link) => link,
        Err(err) => panic!("attach should succeed: {err}"),
    }
}

#[test]
fn attach_then_close_succeeds() {
    let (sim, kernel) = setup();
    let mut link = iter_link(&sim, &kernel);
    assert_eq!(sim.link_count(), 1);
    assert!(link.close().is_ok());
    assert_eq!(sim.link_count(), 0);
}

#[test]
fn kernel_refusal_is_attach_error() {
    let (sim, kernel) = setup();
    let prog = sim.load_iter_program(b"").expect("load");
    sim.fail_next(Command::LinkCreate, libc::EPERM);
    let err = RawLink::attach(&kernel, &RawLinkOptions::new(&prog, AttachType::TraceIter))
        .expect_err("permission denied");
    match err {
        LinkError::Attach { attach, ref source } => {
            assert_eq!(attach, AttachType::TraceIter);
            assert_eq!(source.raw_os_error(), Some(libc::EPERM));
        }
        other => panic!("expected attach error, got: {other}"),
    }
}

#[test]
fn info_reports_link_and_program() {
    let (sim, kernel) = setup();
    let link = iter_link(&sim, &kernel);
    let info = link.info().expect("info");
    assert_eq!(info.link_type, LinkType::Iter);
    assert_eq!(link.id().expect("id"), info.id);
}

#[test]
fn pin_and_load_pinned_share_the_attachment() {
    let (sim, kernel) = setup();
    let mut link = iter_link(&sim, &kernel);
    let path = Path::new("/sys/fs/bpf/tasks");
    link.pin(path).expect("pin");
    assert!(link.is_pinned());
    assert_eq!(link.pinned_path(), Some(path));

    let loaded = RawLink::load_pinned(&kernel, path).expect("load pinned");
    assert_eq!(loaded.attach_type(), Some(AttachType::TraceIter));
    assert_eq!(loaded.pinned_path(), Some(path));
    assert_eq!(
        loaded.info().expect("info").id,
        link.info().expect("info").id
    );
    assert_ne!(loaded.raw_fd(), link.raw_fd());
}

#[test]
fn pin_twice_at_same_path_is_noop() {
    let (sim, kernel) = setup();
    let mut link = iter_link(&sim, &kernel);
    let path = Path::new("/sys/fs/bpf/tasks");
    link.pin(path).expect("pin");
    link.pin(path).expect("second pin at same path");
}

#[test]
fn pin_at_occupied_path_fails() {
    let (sim, kernel) = setup();
    let mut first = iter_link(&sim, &kernel);
    let mut second = iter_link(&sim, &kernel);
    let path = Path::new("/sys/fs/bpf/tasks");
    first.pin(path).expect("pin");

    let err = second.pin(path).expect_err("path taken");
    assert!(matches!(err, LinkError::Pin { .. }));
    assert_eq!(err.raw_os_error(), Some(libc::EEXIST));
    assert!(!second.is_pinned());
}

#[test]
fn pin_outside_bpffs_fails() {
    let (sim, kernel) = setup();
    let mut link = iter_link(&sim, &kernel);
    let err = link.pin(Path::new("/tmp/tasks")).expect_err("not bpffs");
    assert!(matches!(err, LinkError::Pin { .. }));
}

#[test]
fn repinning_moves_the_pin() {
    let (sim, kernel) = setup();
    let mut link = iter_link(&sim, &kernel);
    let old = Path::new("/sys/fs/bpf/old");
    let new = Path::new("/sys/fs/bpf/new");
    link.pin(old).expect("pin");
    link.pin(new).expect("repin");

    assert!(!sim.is_pinned(old));
    assert!(sim.is_pinned(new));
    assert_eq!(link.pinned_path(), Some(new));
}

#[test]
fn repinning_after_old_entry_vanished_succeeds() {
    let (sim, kernel) = setup();
    let mut link = iter_link(&sim, &kernel);
    let old = Path::new("/sys/fs/bpf/old");
    let new = Path::new("/sys/fs/bpf/new");
    link.pin(old).expect("pin");
    kernel.unlink(old).expect("remove pin behind the link's back");

    link.pin(new).expect("repin ignores missing old entry");
    assert!(sim.is_pinned(new));
    assert_eq!(link.pinned_path(), Some(new));
}

#[test]
fn repinning_reports_failure_to_remove_old_entry() {
    let (sim, kernel) = setup();
    let mut link = iter_link(&sim, &kernel);
    let old = Path::new("/sys/fs/bpf/old");
    let new = Path::new("/sys/fs/bpf/new");
    link.pin(old).expect("pin");

    sim.fail_next(Command::Unlink, libc::EACCES);
    match link.pin(new) {
        Err(LinkError::Unpin { path, source }) => {
            assert_eq!(path, old);
            assert_eq!(source.raw_os_error(), Some(libc::EACCES));
        }
        other => panic!("expected unpin error, got {other:?}"),
    }
    assert!(sim.is_pinned(new));
    assert!(sim.is_pinned(old));
    assert_eq!(link.pinned_path(), Some(new));
}

#[test]
fn unpin_removes_entry() {
    let (sim, kernel) = setup();
    let mut link = iter_link(&sim, &kernel);
    let path = Path::new("/sys/fs/bpf/tasks");
    link.pin(path).expect("pin");
    link.unpin().expect("unpin");
    assert!(!sim.is_pinned(path));
    assert!(!link.is_pinned());
    link.unpin().expect("unpin when not pinned");
}

#[test]
fn pinned_link_outlives_close() {
    let (sim, kernel) = setup();
    let mut link = iter_link(&sim, &kernel);
    link.pin(Path::new("/sys/fs/bpf/tasks")).expect("pin");
    link.close().expect("close");
    assert_eq!(sim.link_count(), 1);
}

#[test]
fn load_pinned_missing_path_fails() {
    let (_sim, kernel) = setup();
    let err = RawLink::load_pinned(&kernel, Path::new("/sys/fs/bpf/missing"))
        .expect_err("nothing pinned");
    assert!(matches!(err, LinkError::LoadPinned { .. }));
    assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
}

#[test]
fn load_pinned_program_is_not_a_link() {
    let (sim, kernel) = setup();
    let prog = sim.load_iter_program(b"").expect("load");
    let path = Path::new("/sys/fs/bpf/prog");
    kernel.obj_pin(prog.fd(), path).expect("pin program");
    let fds_before = sim.open_fds();

    let err = RawLink::load_pinned(&kernel, path).expect_err("program, not link");
    assert!(matches!(err, LinkError::NotALink { .. }));
    assert_eq!(sim.open_fds(), fds_before);
}

#[test]
fn update_swaps_program() {
    let (sim, kernel) = setup();
    let mut link = iter_link(&sim, &kernel);
    let before = link.info().expect("info").prog_id;

    let replacement = sim.load_iter_program(b"new").expect("load");
    link.update(&replacement).expect("update");
    let after = link.info().expect("info").prog_id;
    assert_ne!(before, after);
}

#[test]
fn update_with_incompatible_program_fails() {
    let (sim, kernel) = setup();
    let mut link = iter_link(&sim, &kernel);
    let xdp = sim
        .load_program(ProgramType::Xdp, None, b"")
        .expect("load");
    let err = link.update(&xdp).expect_err("xdp cannot replace iterator");
    assert!(matches!(
        err,
        LinkError::IncompatibleProgram { op: "update", .. }
    ));
}

#[test]
fn kernel_rejected_update_is_update_error() {
    let (sim, kernel) = setup();
    let mut link = iter_link(&sim, &kernel);
    let replacement = sim.load_iter_program(b"").expect("load");
    sim.fail_next(Command::LinkUpdate, libc::EOPNOTSUPP);
    let err = link.update(&replacement).expect_err("injected");
    assert!(matches!(err, LinkError::Update { .. }));
}

#[test]
fn update_replacing_checks_current_program() {
    let (sim, kernel) = setup();
    let original = sim.load_iter_program(b"a").expect("load");
    let mut link = RawLink::attach(&kernel, &RawLinkOptions::new(&original, AttachType::TraceIter))
        .expect("attach");
    let second = sim.load_iter_program(b"b").expect("load");
    let third = sim.load_iter_program(b"c").expect("load");

    link.update_replacing(&second, &original)
        .expect("original is current");
    let err = link
        .update_replacing(&third, &original)
        .expect_err("original is stale");
    assert_eq!(err.raw_os_error(), Some(libc::EPERM));
}

#[test]
fn operations_after_close_fail() {
    let (sim, kernel) = setup();
    let mut link = iter_link(&sim, &kernel);
    let prog = sim.load_iter_program(b"").expect("load");
    link.close().expect("close");

    assert!(link.pin(Path::new("/sys/fs/bpf/x")).expect_err("pin").is_closed());
    assert!(link.update(&prog).expect_err("update").is_closed());
    assert!(link.unpin().expect_err("unpin").is_closed());
    assert!(link.info().expect_err("info").is_closed());
    assert!(link.close().is_ok());
}
