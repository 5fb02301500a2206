//! Sharing a single page with a child.
use exokern::{
    KernelError,
    addressing::Va,
    env::EnvId,
    mm::page_table::PteFlags,
    syscall::Syscall,
};

/// How a page is shared between parent and child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageClass {
    /// Writable or already copy-on-write. Both sides map the frame read-only
    /// with [`PteFlags::COW`].
    CopyOnWrite,
    /// Read-only. Both sides map the frame with the parent's permissions.
    SharedReadOnly,
    /// Not mapped; there is nothing to share.
    Absent,
}

/// Classify a page by the flags of its mapping.
pub fn classify(flags: PteFlags) -> PageClass {
    if !flags.contains(PteFlags::P) {
        PageClass::Absent
    } else if flags.intersects(PteFlags::W | PteFlags::COW) {
        PageClass::CopyOnWrite
    } else {
        PageClass::SharedReadOnly
    }
}

/// Map the caller's virtual page `vpn` into `child` at the same address.
///
/// A [`PageClass::CopyOnWrite`] page is mapped into the child first and then
/// remapped in the caller, both times with `P | U | COW`. In the other order
/// the child could observe a page that the caller can still write.
/// A [`PageClass::SharedReadOnly`] page keeps its permissions, restricted to
/// [`PteFlags::SYSCALL`].
///
/// # Returns
/// The class of the page. An absent page maps nothing.
pub fn duppage(sys: &dyn Syscall, child: EnvId, vpn: usize) -> Result<PageClass, KernelError> {
    let va = Va::from_vpn(vpn).ok_or(KernelError::InvalidArgument)?;
    let Some(pte) = sys.page_lookup(va) else {
        return Ok(PageClass::Absent);
    };
    let class = classify(pte.flags());
    match class {
        PageClass::CopyOnWrite => {
            let perm = PteFlags::P | PteFlags::U | PteFlags::COW;
            sys.page_map(EnvId::SELF, va, child, va, perm)?;
            sys.page_map(EnvId::SELF, va, EnvId::SELF, va, perm)?;
        }
        PageClass::SharedReadOnly => {
            sys.page_map(EnvId::SELF, va, child, va, pte.flags() & PteFlags::SYSCALL)?;
        }
        PageClass::Absent => (),
    }
    Ok(class)
}
