#![allow(dead_code)]

use cowfork::{ProcessContext, fork};
use exokern::{
    Kernel, UserEnv,
    addressing::{PAGE_SIZE, Va},
    env::EnvId,
    mm::page_table::{Pte, PteFlags},
    syscall::{Forked, Syscall, UserMemory},
};

pub const PU: PteFlags = PteFlags::P.union(PteFlags::U);
pub const PUW: PteFlags = PU.union(PteFlags::W);

pub fn va(addr: usize) -> Va {
    Va::new(addr).unwrap()
}

pub fn boot(frames: usize) -> (Kernel, EnvId) {
    let kernel = Kernel::builder().frames(frames).max_envs(16).boot();
    let id = kernel.create_env().unwrap();
    (kernel, id)
}

/// Map a fresh page at `addr` filled with `fill`, then restrict it to `perm`.
pub fn map_page(env: &UserEnv<'_>, addr: usize, fill: u8, perm: PteFlags) {
    env.page_alloc(EnvId::SELF, va(addr), PUW).unwrap();
    env.store(va(addr), &[fill; PAGE_SIZE]).unwrap();
    if perm != PUW {
        env.page_map(EnvId::SELF, va(addr), EnvId::SELF, va(addr), perm)
            .unwrap();
    }
}

pub fn read_byte(env: &UserEnv<'_>, addr: usize) -> u8 {
    let mut buf = [0u8; 1];
    env.load(va(addr), &mut buf).unwrap();
    buf[0]
}

pub fn pte(kernel: &Kernel, id: EnvId, addr: usize) -> Pte {
    kernel.lookup(id, va(addr)).unwrap()
}

/// Fork `parent` and run the child side of the fork in the child.
///
/// Returns the child's id and its context.
pub fn fork_and_enter(
    kernel: &Kernel,
    parent: &UserEnv<'_>,
    ctx: &mut ProcessContext,
) -> (EnvId, ProcessContext) {
    let child = match fork(parent, ctx).unwrap() {
        Forked::Parent(child) => child,
        Forked::Child => panic!("parent returned as child"),
    };
    let mut child_ctx = *ctx;
    let child_env = kernel.enter(child).unwrap();
    assert_eq!(fork(&child_env, &mut child_ctx), Ok(Forked::Child));
    (child, child_ctx)
}
