//! Copy-on-write page fault handler.
//!
//! After a fork, parent and child share every writable page read-only with
//! [`PteFlags::COW`] set. The first write to such a page faults, and the
//! kernel runs the handler registered with [`set_pgfault_handler`] on the
//! process's exception stack. The handler
//! 1. checks that the fault is a write to a copy-on-write page,
//! 2. allocates a fresh page at [`PFTEMP`] and copies the faulting page into
//!    it,
//! 3. maps the copy over the faulting page, writable and without
//!    [`PteFlags::COW`], and
//! 4. unmaps [`PFTEMP`].
//!
//! The other process keeps its mapping of the original frame. Any other
//! fault means the process touched memory it must not touch; the process is
//! destroyed.
use crate::ProcessContext;
use exokern::{
    KernelError,
    addressing::{PAGE_SIZE, Va},
    env::EnvId,
    memlayout::{PFTEMP, UXSTACK},
    mm::page_table::PteFlags,
    syscall::{PgfaultUpcall, Syscall, UserContext},
    trap::UTrapframe,
};
use log::{trace, warn};

/// A page fault the handler refuses to repair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FaultError {
    /// The faulting access was a read.
    #[error("read fault at {0}")]
    NotWrite(Va),
    /// The faulting page is not a copy-on-write page.
    #[error("write fault at {0} on a page that is not copy-on-write")]
    NotCopyOnWrite(Va),
    /// A system call failed while repairing the fault.
    #[error("cannot repair page fault: {0}")]
    Kernel(#[from] KernelError),
}

/// Give the faulting process a private, writable copy of a copy-on-write
/// page.
///
/// Consumes exactly one frame. The shared frame loses the faulting process's
/// reference and stays mapped wherever else it was mapped.
pub fn pgfault(ctx: &dyn UserContext, utf: &UTrapframe) -> Result<(), FaultError> {
    let addr = utf.fault_va;
    if !utf.err.is_write() {
        return Err(FaultError::NotWrite(addr));
    }
    let is_cow = ctx.page_table_present(addr)
        && ctx
            .page_lookup(addr)
            .is_some_and(|pte| pte.flags().contains(PteFlags::P | PteFlags::COW));
    if !is_cow {
        return Err(FaultError::NotCopyOnWrite(addr));
    }

    let page = addr.page_down();
    let perm = PteFlags::P | PteFlags::U | PteFlags::W;
    ctx.page_alloc(EnvId::SELF, PFTEMP, perm)?;
    let mut buf = [0u8; PAGE_SIZE];
    ctx.load(page, &mut buf)?;
    ctx.store(PFTEMP, &buf)?;
    ctx.page_map(EnvId::SELF, PFTEMP, EnvId::SELF, page, perm)?;
    ctx.page_unmap(EnvId::SELF, PFTEMP)?;
    trace!("[{}] copied {} on write", ctx.getenvid(), page);
    Ok(())
}

/// The entry point registered with the kernel.
///
/// Runs [`pgfault`]. A fault it refuses is logged and reported to the kernel,
/// which then destroys the process.
pub fn pgfault_upcall(ctx: &dyn UserContext, utf: &UTrapframe) -> Result<(), KernelError> {
    pgfault(ctx, utf).map_err(|e| {
        warn!("[{}] {}", ctx.getenvid(), e);
        match e {
            FaultError::Kernel(e) => e,
            FaultError::NotWrite(_) | FaultError::NotCopyOnWrite(_) => KernelError::InvalidAccess,
        }
    })
}

/// Install `handler` as the page fault handler of the calling process.
///
/// The first call allocates the exception stack. Later calls only replace
/// the handler.
pub fn set_pgfault_handler(
    sys: &dyn Syscall,
    ctx: &mut ProcessContext,
    handler: PgfaultUpcall,
) -> Result<(), KernelError> {
    if ctx.pgfault_handler.is_none() {
        sys.page_alloc(EnvId::SELF, UXSTACK, PteFlags::P | PteFlags::U | PteFlags::W)?;
    }
    sys.env_set_pgfault_upcall(EnvId::SELF, handler)?;
    ctx.pgfault_handler = Some(handler);
    Ok(())
}
