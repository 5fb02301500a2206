mod common;

use common::*;
use cowfork::{FaultError, ProcessContext, pgfault, pgfault_upcall, set_pgfault_handler};
use exokern::{
    KernelError, PFErrorCode,
    addressing::PAGE_SIZE,
    env::{EnvId, EnvStatus},
    memlayout::{PFTEMP, UTEXT, UXSTACK},
    mm::page_table::PteFlags,
    syscall::{Syscall, UserMemory},
    trap::UTrapframe,
};

const A: usize = UTEXT.into_usize();
const B: usize = A + PAGE_SIZE;

fn write_fault(addr: usize) -> UTrapframe {
    UTrapframe {
        fault_va: va(addr),
        err: PFErrorCode::USER | PFErrorCode::WRITE_ACCESS | PFErrorCode::PRESENT,
    }
}

#[test]
fn child_write_privatizes() {
    let (kernel, pid) = boot(64);
    let parent = kernel.enter(pid).unwrap();
    let mut ctx = ProcessContext::new(&parent);
    map_page(&parent, A, 0xaa, PUW);
    let (child, _) = fork_and_enter(&kernel, &parent, &mut ctx);
    let child_env = kernel.enter(child).unwrap();

    let parent_a = pte(&kernel, pid, A);
    let free = kernel.free_frames();
    child_env.store(va(A + 0x10), &[0xcc; 4]).unwrap();

    let child_a = pte(&kernel, child, A);
    assert_eq!(child_a.flags(), PUW);
    assert_ne!(child_a.pa(), parent_a.pa());
    assert_eq!(pte(&kernel, pid, A), parent_a);
    assert_eq!(kernel.page_ref_count(parent_a.pa().unwrap()), 1);
    assert_eq!(kernel.free_frames(), free - 1);
    assert_eq!(kernel.faults_delivered(child), 1);
    assert!(kernel.lookup(child, PFTEMP).is_none());

    // The copy keeps the rest of the page.
    assert_eq!(read_byte(&child_env, A), 0xaa);
    assert_eq!(read_byte(&child_env, A + 0x10), 0xcc);
    assert_eq!(read_byte(&child_env, A + PAGE_SIZE - 1), 0xaa);
    assert_eq!(read_byte(&parent, A + 0x10), 0xaa);
}

#[test]
fn second_write_does_not_fault() {
    let (kernel, pid) = boot(64);
    let parent = kernel.enter(pid).unwrap();
    let mut ctx = ProcessContext::new(&parent);
    map_page(&parent, A, 0xaa, PUW);
    let (child, _) = fork_and_enter(&kernel, &parent, &mut ctx);
    let child_env = kernel.enter(child).unwrap();

    child_env.store(va(A), b"one").unwrap();
    child_env.store(va(A), b"two").unwrap();
    child_env.store(va(A + 0x800), b"three").unwrap();
    assert_eq!(kernel.faults_delivered(child), 1);

    let mut buf = [0u8; 3];
    child_env.load(va(A), &mut buf).unwrap();
    assert_eq!(&buf, b"two");
}

#[test]
fn reads_never_fault() {
    let (kernel, pid) = boot(64);
    let parent = kernel.enter(pid).unwrap();
    let mut ctx = ProcessContext::new(&parent);
    map_page(&parent, A, 0xaa, PUW);
    map_page(&parent, B, 0xbb, PU);
    let (child, _) = fork_and_enter(&kernel, &parent, &mut ctx);
    let child_env = kernel.enter(child).unwrap();

    assert_eq!(read_byte(&child_env, A), 0xaa);
    assert_eq!(read_byte(&child_env, B), 0xbb);
    assert_eq!(read_byte(&parent, A), 0xaa);
    assert_eq!(kernel.faults_delivered(child), 0);
    assert_eq!(kernel.faults_delivered(pid), 0);
}

#[test]
fn both_sides_write() {
    let (kernel, pid) = boot(64);
    let parent = kernel.enter(pid).unwrap();
    let mut ctx = ProcessContext::new(&parent);
    map_page(&parent, A, 0xaa, PUW);
    let (child, _) = fork_and_enter(&kernel, &parent, &mut ctx);
    let child_env = kernel.enter(child).unwrap();

    let shared = pte(&kernel, pid, A).pa().unwrap();
    let free = kernel.free_frames();

    parent.store(va(A), b"p").unwrap();
    assert_eq!(kernel.page_ref_count(shared), 1);
    assert_eq!(kernel.free_frames(), free - 1);

    // The child still owns the original frame, and still copies it.
    assert_eq!(pte(&kernel, child, A).pa(), Some(shared));
    child_env.store(va(A), b"c").unwrap();
    assert_eq!(kernel.page_ref_count(shared), 0);
    assert_eq!(kernel.free_frames(), free - 1);

    assert_eq!(read_byte(&parent, A), b'p');
    assert_eq!(read_byte(&child_env, A), b'c');
    assert_eq!(read_byte(&child_env, A + 1), 0xaa);
}

#[test]
fn write_to_read_only_page_terminates() {
    let (kernel, pid) = boot(64);
    let parent = kernel.enter(pid).unwrap();
    let mut ctx = ProcessContext::new(&parent);
    map_page(&parent, B, 0xbb, PU);
    let (child, _) = fork_and_enter(&kernel, &parent, &mut ctx);
    let child_env = kernel.enter(child).unwrap();

    assert_eq!(child_env.store(va(B), b"x"), Err(KernelError::Terminated));
    assert_eq!(kernel.env_status(child), EnvStatus::Free);
    assert_eq!(read_byte(&parent, B), 0xbb);
}

#[test]
fn read_of_unmapped_page_terminates() {
    let (kernel, pid) = boot(64);
    let parent = kernel.enter(pid).unwrap();
    let mut ctx = ProcessContext::new(&parent);
    set_pgfault_handler(&parent, &mut ctx, pgfault_upcall).unwrap();

    let mut buf = [0u8; 1];
    assert_eq!(parent.load(va(B), &mut buf), Err(KernelError::Terminated));
    assert_eq!(kernel.env_status(pid), EnvStatus::Free);
    assert_eq!(kernel.free_frames(), 64);
}

#[test]
fn handler_rejects_invalid_faults() {
    let (kernel, pid) = boot(64);
    let parent = kernel.enter(pid).unwrap();
    map_page(&parent, A, 0xaa, PUW);
    map_page(&parent, B, 0xbb, PU);
    let free = kernel.free_frames();

    let read = UTrapframe {
        fault_va: va(A),
        err: PFErrorCode::USER,
    };
    assert_eq!(pgfault(&parent, &read), Err(FaultError::NotWrite(va(A))));
    assert_eq!(
        pgfault(&parent, &write_fault(B + 8)),
        Err(FaultError::NotCopyOnWrite(va(B + 8)))
    );
    assert_eq!(
        pgfault(&parent, &write_fault(A + 2 * PAGE_SIZE)),
        Err(FaultError::NotCopyOnWrite(va(A + 2 * PAGE_SIZE)))
    );
    assert_eq!(pgfault_upcall(&parent, &read), Err(KernelError::InvalidAccess));

    // Nothing was repaired.
    assert_eq!(kernel.free_frames(), free);
    assert_eq!(pte(&kernel, pid, A).flags(), PUW);
    assert_eq!(pte(&kernel, pid, B).flags(), PU);
}

#[test]
fn handler_reports_exhausted_memory() {
    let (kernel, pid) = boot(1);
    let parent = kernel.enter(pid).unwrap();
    map_page(&parent, A, 0xaa, PU | PteFlags::COW);

    assert_eq!(
        pgfault(&parent, &write_fault(A)),
        Err(FaultError::Kernel(KernelError::NoMemory))
    );
    assert_eq!(
        pgfault_upcall(&parent, &write_fault(A)),
        Err(KernelError::NoMemory)
    );
    assert_eq!(pte(&kernel, pid, A).flags(), PU | PteFlags::COW);
}

#[test]
fn handler_copies_in_place() {
    let (kernel, pid) = boot(8);
    let parent = kernel.enter(pid).unwrap();
    map_page(&parent, A, 0x5a, PU | PteFlags::COW);
    let old = pte(&kernel, pid, A).pa();

    pgfault(&parent, &write_fault(A + 0x123)).unwrap();
    let new = pte(&kernel, pid, A);
    assert_eq!(new.flags(), PUW);
    assert_ne!(new.pa(), old);
    assert_eq!(kernel.page_ref_count(old.unwrap()), 0);
    assert_eq!(read_byte(&parent, A + 0x123), 0x5a);
}

#[test]
fn handler_install_is_idempotent() {
    let (kernel, pid) = boot(8);
    let parent = kernel.enter(pid).unwrap();
    let mut ctx = ProcessContext::new(&parent);

    set_pgfault_handler(&parent, &mut ctx, pgfault_upcall).unwrap();
    let xstack = pte(&kernel, pid, UXSTACK.into_usize());
    set_pgfault_handler(&parent, &mut ctx, pgfault_upcall).unwrap();

    assert_eq!(kernel.free_frames(), 7);
    assert_eq!(pte(&kernel, pid, UXSTACK.into_usize()), xstack);
    assert!(ctx.pgfault_handler().is_some());
    assert_eq!(parent.getenvid(), ctx.thisenv);
    assert_ne!(ctx.thisenv, EnvId::SELF);
}

#[test]
fn parent_and_child_write_concurrently() {
    let (kernel, pid) = boot(128);
    let parent = kernel.enter(pid).unwrap();
    let mut ctx = ProcessContext::new(&parent);
    for i in 0..16 {
        map_page(&parent, A + i * PAGE_SIZE, 0xaa, PUW);
    }
    let (child, _) = fork_and_enter(&kernel, &parent, &mut ctx);
    let child_env = kernel.enter(child).unwrap();
    let free = kernel.free_frames();

    std::thread::scope(|s| {
        for (env, tag) in [(parent, b'p'), (child_env, b'c')] {
            s.spawn(move || {
                for i in 0..16 {
                    env.store(va(A + i * PAGE_SIZE), &[tag]).unwrap();
                }
            });
        }
    });

    for i in 0..16 {
        assert_eq!(read_byte(&parent, A + i * PAGE_SIZE), b'p');
        assert_eq!(read_byte(&child_env, A + i * PAGE_SIZE), b'c');
        assert_eq!(read_byte(&child_env, A + i * PAGE_SIZE + 1), 0xaa);
    }
    assert_eq!(kernel.faults_delivered(pid), 16);
    assert_eq!(kernel.faults_delivered(child), 16);
    // Every original frame was copied twice and then dropped.
    assert_eq!(kernel.free_frames(), free - 16);
}
