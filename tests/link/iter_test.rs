//! Iterator links and streams against the simulated kernel.

use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::thread;

use bpflink::sys::sim::{Command, SimKernel};
use bpflink::sys::Kernel;
use bpflink::{
    attach_iter, load_pinned_iter, AttachType, Iter, IterOptions, Link, LinkError, ProgramType,
    RawLink, RawLinkOptions,
};

const OUTPUT: &[u8] = b"pid 1 systemd\npid 2 kthreadd\npid 3 rcu_gp\n";

fn setup(output: &[u8]) -> (Arc<SimKernel>, Arc<dyn Kernel>, Iter) {
    let sim = Arc::new(SimKernel::new().with_read_chunk(8));
    let kernel: Arc<dyn Kernel> = sim.clone();
    let prog = match sim.load_iter_program(output) {
        Ok(prog) => prog,
        Err(err) => panic!("program should load: {err}"),
    };
    let iter = match attach_iter(&kernel, IterOptions { program: &prog }) {
        Ok(iter) => iter,
        Err(err) => panic!("iterator should attach: {err}"),
    };
    (sim, kernel, iter)
}

#[test]
fn reading_to_completion_yields_eof() {
    let (_sim, _kernel, iter) = setup(OUTPUT);
    let mut stream = iter.open().expect("open");
    let out = stream.read_to_vec().expect("read");
    assert_eq!(out, OUTPUT);
    assert!(stream.is_eof());
    stream.close().expect("close");
}

#[test]
fn each_read_runs_the_program() {
    let sim = Arc::new(SimKernel::new().with_read_chunk(8));
    let kernel: Arc<dyn Kernel> = sim.clone();
    let prog = sim.load_iter_program(b"0123456789abcdef").expect("load");
    let iter = attach_iter(&kernel, IterOptions { program: &prog }).expect("attach");

    let mut stream = iter.open().expect("open");
    let mut buf = [0u8; 64];
    assert_eq!(stream.read(&mut buf).expect("first read"), 8);
    assert_eq!(sim.program_runs(&prog), 1);
    assert_eq!(stream.read(&mut buf).expect("second read"), 8);
    assert_eq!(sim.program_runs(&prog), 2);
    assert_eq!(stream.read(&mut buf).expect("eof"), 0);
    assert_eq!(sim.program_runs(&prog), 2);
}

#[test]
fn two_opens_yield_independent_streams() {
    let (_sim, _kernel, iter) = setup(OUTPUT);
    let mut first = iter.open().expect("open first");
    let mut second = iter.open().expect("open second");
    assert_ne!(first.raw_fd(), second.raw_fd());

    let mut buf = [0u8; 4];
    let n = first.read(&mut buf).expect("partial read");
    assert_eq!(&buf[..n], &OUTPUT[..n]);

    first.close().expect("close first");
    assert_eq!(second.read_to_vec().expect("second still readable"), OUTPUT);
}

#[test]
fn fresh_open_starts_a_new_pass() {
    let (_sim, _kernel, iter) = setup(OUTPUT);
    let mut first = iter.open().expect("open");
    assert_eq!(first.read_to_vec().expect("read"), OUTPUT);
    let mut again = iter.open().expect("reopen");
    assert_eq!(again.read_to_vec().expect("read"), OUTPUT);
}

#[test]
fn open_after_close_fails() {
    let (_sim, _kernel, mut iter) = setup(OUTPUT);
    iter.close().expect("close");
    let err = iter.open().expect_err("closed link");
    assert!(matches!(err, LinkError::Closed { op: "open", .. }));
}

#[test]
fn kernel_rejected_open_is_open_error() {
    let (sim, _kernel, iter) = setup(OUTPUT);
    sim.fail_next(Command::IterCreate, libc::ENOMEM);
    let err = iter.open().expect_err("injected");
    assert!(matches!(err, LinkError::Open { .. }));
    assert_eq!(err.raw_os_error(), Some(libc::ENOMEM));
    assert!(iter.open().is_ok());
}

#[test]
fn open_on_non_iterator_link_fails() {
    let sim = Arc::new(SimKernel::new());
    let kernel: Arc<dyn Kernel> = sim.clone();
    let prog = sim
        .load_program(ProgramType::Xdp, None, b"")
        .expect("load");
    let mut link = RawLink::attach(&kernel, &RawLinkOptions::new(&prog, AttachType::Xdp).target(1))
        .expect("attach xdp");
    let path = Path::new("/sys/fs/bpf/xdp");
    link.pin(path).expect("pin");

    let iter = load_pinned_iter(&kernel, path).expect("load as iterator");
    let err = iter.open().expect_err("xdp link has no iterator");
    assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
}

#[test]
fn update_changes_output_of_new_streams() {
    let (sim, _kernel, mut iter) = setup(b"old\n");
    let mut before = iter.open().expect("open before update");

    let replacement = sim.load_iter_program(b"new\n").expect("load");
    iter.update(&replacement).expect("update");

    let mut after = iter.open().expect("open after update");
    assert_eq!(after.read_to_vec().expect("read"), b"new\n");
    assert_eq!(before.read_to_vec().expect("read"), b"old\n");
}

#[test]
fn streams_survive_link_close_without_crashing() {
    let (_sim, _kernel, mut iter) = setup(OUTPUT);
    let mut stream = iter.open().expect("open");
    iter.close().expect("close link");

    // Kernel-defined outcome; the simulated kernel keeps the stream alive.
    match stream.read_to_vec() {
        Ok(out) => assert_eq!(out, OUTPUT),
        Err(err) => assert!(matches!(err, LinkError::Read { .. })),
    }
    stream.close().expect("close stream");
}

#[test]
fn streams_can_be_read_from_different_threads() {
    let (_sim, _kernel, iter) = setup(OUTPUT);
    let streams: Vec<_> = (0..4).map(|_| iter.open().expect("open")).collect();

    let handles: Vec<_> = streams
        .into_iter()
        .map(|mut stream| thread::spawn(move || stream.read_to_vec()))
        .collect();

    for handle in handles {
        let out = match handle.join() {
            Ok(result) => result.expect("read"),
            Err(_) => panic!("reader thread panicked"),
        };
        assert_eq!(out, OUTPUT);
    }
}

#[test]
fn iterator_forwards_pin_and_info() {
    let (sim, _kernel, mut iter) = setup(OUTPUT);
    let path = Path::new("/sys/fs/bpf/tasks");
    iter.pin(path).expect("pin");
    assert!(sim.is_pinned(path));
    assert_eq!(iter.raw().pinned_path(), Some(path));
    assert_eq!(
        iter.info().expect("info").id,
        iter.raw().id().expect("id")
    );
    iter.unpin().expect("unpin");
    assert!(!sim.is_pinned(path));
}
