//! `fork` and `sfork`.
use crate::{
    Error, ProcessContext,
    duppage::{PageClass, duppage},
    pgfault::{pgfault_upcall, set_pgfault_handler},
};
use exokern::{
    addressing::{NPTENTRIES, Va},
    env::EnvStatus,
    memlayout::UXSTACK,
    mm::page_table::PteFlags,
    syscall::{Forked, Syscall},
};
use log::info;

// Virtual page numbers of the user pages below the exception stack, skipping
// the ranges whose page table does not exist.
fn user_pages(sys: &dyn Syscall) -> impl Iterator<Item = usize> + '_ {
    let end = UXSTACK.vpn();
    (0..end.div_ceil(NPTENTRIES))
        .filter(move |pdx| {
            Va::from_vpn(pdx * NPTENTRIES).is_some_and(|va| sys.page_table_present(va))
        })
        .flat_map(move |pdx| pdx * NPTENTRIES..((pdx + 1) * NPTENTRIES).min(end))
        .filter(move |vpn| {
            Va::from_vpn(*vpn)
                .and_then(|va| sys.page_lookup(va))
                .is_some_and(|pte| pte.flags().contains(PteFlags::P | PteFlags::U))
        })
}

/// Creates a new process by duplicating the calling process using
/// copy-on-write.
///
/// Returns [`Forked::Parent`] with the child's id in the parent and
/// [`Forked::Child`] in the child. On the child side, `ctx` is the child's
/// copy of its parent's context; [`ProcessContext::thisenv`] is rebound to
/// the child.
///
/// ### Steps (parent side)
/// 1. Install [`pgfault_upcall`] as the page fault handler.
/// 2. Create the child with [`Syscall::exofork`].
/// 3. Call [`duppage`] on every present user page below the exception stack.
/// 4. Allocate the child's exception stack and register its upcall.
/// 5. Mark the child runnable.
///
/// A failing step aborts the fork with its error. The partially built child
/// is left as it is and never becomes runnable.
pub fn fork(sys: &dyn Syscall, ctx: &mut ProcessContext) -> Result<Forked, Error> {
    set_pgfault_handler(sys, ctx, pgfault_upcall)?;

    let child = match sys.exofork()? {
        Forked::Parent(child) => child,
        Forked::Child => {
            ctx.thisenv = sys.getenvid();
            return Ok(Forked::Child);
        }
    };

    let (mut cow, mut shared) = (0, 0);
    for vpn in user_pages(sys) {
        match duppage(sys, child, vpn)? {
            PageClass::CopyOnWrite => cow += 1,
            PageClass::SharedReadOnly => shared += 1,
            PageClass::Absent => (),
        }
    }

    sys.page_alloc(child, UXSTACK, PteFlags::P | PteFlags::U | PteFlags::W)?;
    let handler = ctx.pgfault_handler.unwrap_or(pgfault_upcall);
    sys.env_set_pgfault_upcall(child, handler)?;
    sys.env_set_status(child, EnvStatus::Runnable)?;

    info!(
        "[{}] forked {}: {} copy-on-write pages, {} shared pages",
        ctx.thisenv, child, cow, shared
    );
    Ok(Forked::Parent(child))
}

/// Shared-memory fork: parent and child would share everything but the
/// stack.
///
/// Not implemented. Always returns [`Error::NotSupported`] and touches
/// nothing.
pub fn sfork(_sys: &dyn Syscall, _ctx: &mut ProcessContext) -> Result<Forked, Error> {
    Err(Error::NotSupported)
}
