use crate::{
    KernelConfig, KernelConfigBuilder, KernelError,
    addressing::{PAGE_SIZE, Pa, Va},
    env::{EnvId, EnvStatus, EnvTable},
    memlayout::UTOP,
    mm::{
        FramePool, Page,
        page_table::{PageTableMappingError, Pte, PteFlags},
    },
    syscall::{Forked, PgfaultUpcall, Syscall, UserMemory},
};
use abyss::PFErrorCode;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::{ops::Range, sync::Arc};

pub(crate) struct KernelState {
    pub(crate) envs: EnvTable,
}

/// The simulated machine.
///
/// A `Kernel` owns the frame pool and the environment table. Code runs inside
/// an environment through the [`UserEnv`] handle returned by
/// [`Kernel::enter`]. Every system call takes the kernel lock for its whole
/// duration, so system calls are atomic with respect to each other. The lock
/// is never held while a page fault upcall runs.
pub struct Kernel {
    pub(crate) state: Mutex<KernelState>,
    pool: Arc<FramePool>,
}

impl Kernel {
    /// Boot a machine with `config`.
    pub fn new(config: KernelConfig) -> Self {
        info!(
            "booting: {} frames, {} environment slots",
            config.frames, config.max_envs
        );
        Kernel {
            state: Mutex::new(KernelState {
                envs: EnvTable::new(config.max_envs),
            }),
            pool: FramePool::new(config.frames),
        }
    }

    /// Start configuring a machine.
    pub fn builder() -> KernelConfigBuilder {
        KernelConfigBuilder::default()
    }

    /// Create a runnable environment with an empty address space and no
    /// parent.
    pub fn create_env(&self) -> Result<EnvId, KernelError> {
        let mut state = self.state.lock();
        let id = state.envs.alloc(EnvId::SELF)?;
        if let Some(env) = state.envs.get_mut(id) {
            env.status = EnvStatus::Runnable;
        }
        info!("[{}] new env", id);
        Ok(id)
    }

    /// Run code inside the environment `id`.
    ///
    /// # Errors
    /// [`KernelError::BadEnv`] unless `id` names a runnable environment.
    pub fn enter(&self, id: EnvId) -> Result<UserEnv<'_>, KernelError> {
        match self.env_status(id) {
            EnvStatus::Runnable => Ok(UserEnv { kernel: self, id }),
            _ => Err(KernelError::BadEnv),
        }
    }

    /// Status of the environment `id`; [`EnvStatus::Free`] if it does not
    /// exist.
    pub fn env_status(&self, id: EnvId) -> EnvStatus {
        self.state
            .lock()
            .envs
            .get(id)
            .map(|env| env.status)
            .unwrap_or(EnvStatus::Free)
    }

    /// Parent of the environment `id`, if it exists and has one.
    pub fn env_parent(&self, id: EnvId) -> Option<EnvId> {
        self.state
            .lock()
            .envs
            .get(id)
            .map(|env| env.parent)
            .filter(|parent| *parent != EnvId::SELF)
    }

    /// Number of live environments.
    pub fn nr_envs(&self) -> usize {
        self.state.lock().envs.iter().count()
    }

    /// Page table entry of the environment `id` for the page containing `va`.
    pub fn lookup(&self, id: EnvId, va: Va) -> Option<Pte> {
        self.state
            .lock()
            .envs
            .get(id)?
            .page_table
            .walk(va.page_down())
            .ok()
    }

    /// Every mapping of the environment `id`, in address order.
    pub fn mappings(&self, id: EnvId) -> Vec<(Va, Pte)> {
        self.state
            .lock()
            .envs
            .get(id)
            .map(|env| env.page_table.iter().collect())
            .unwrap_or_default()
    }

    /// Number of mappings that refer to the frame at `pa`.
    pub fn page_ref_count(&self, pa: Pa) -> usize {
        self.pool.ref_count(pa)
    }

    /// Number of free frames.
    pub fn free_frames(&self) -> usize {
        self.pool.free_frames()
    }

    /// Number of page faults delivered to the upcall of the environment `id`.
    pub fn faults_delivered(&self, id: EnvId) -> usize {
        self.state
            .lock()
            .envs
            .get(id)
            .map(|env| env.faults)
            .unwrap_or(0)
    }
}

/// Handle to a running environment.
///
/// Calls through this handle are calls made by the code of environment
/// [`UserEnv::id`]: system calls via [`Syscall`] and memory accesses via
/// [`UserMemory`].
#[derive(Clone, Copy)]
pub struct UserEnv<'k> {
    pub(crate) kernel: &'k Kernel,
    pub(crate) id: EnvId,
}

impl core::fmt::Debug for UserEnv<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "UserEnv({})", self.id)
    }
}

fn check_va(va: Va) -> Result<(), KernelError> {
    if va.is_page_aligned() && va < UTOP {
        Ok(())
    } else {
        Err(KernelError::InvalidArgument)
    }
}

fn check_perm(perm: PteFlags) -> Result<(), KernelError> {
    if perm.contains(PteFlags::P | PteFlags::U) && PteFlags::SYSCALL.contains(perm) {
        Ok(())
    } else {
        Err(KernelError::InvalidArgument)
    }
}

impl<'k> UserEnv<'k> {
    /// Id of this environment.
    pub fn id(&self) -> EnvId {
        self.id
    }

    /// The machine this environment runs on.
    pub fn kernel(&self) -> &'k Kernel {
        self.kernel
    }

    /// Destroy this environment after an unrecoverable fault.
    pub(crate) fn terminate(&self) -> KernelError {
        if self.kernel.state.lock().envs.destroy(self.id).is_some() {
            warn!("[{}] destroyed", self.id);
        }
        KernelError::Terminated
    }

    // Find the frame backing `va` for an access, delivering a page fault if
    // the page table rejects it. The retried access must succeed.
    fn translate(&self, va: Va, write: bool) -> Result<Page, KernelError> {
        let mut retried = false;
        loop {
            let err = {
                let state = self.kernel.state.lock();
                let env = state.envs.get(self.id).ok_or(KernelError::Terminated)?;
                let mut err = PFErrorCode::USER;
                if write {
                    err |= PFErrorCode::WRITE_ACCESS;
                }
                match env.page_table.get_user_page(va.page_down()) {
                    Ok((page, flags))
                        if flags.contains(PteFlags::P | PteFlags::U)
                            && (!write || flags.contains(PteFlags::W)) =>
                    {
                        return Ok(page.clone());
                    }
                    Ok(_) => err | PFErrorCode::PRESENT,
                    Err(_) => err,
                }
            };
            if retried {
                warn!("[{}] page fault at {} ({:?}) not resolved", self.id, va, err);
                return Err(self.terminate());
            }
            self.page_fault(va, err)?;
            retried = true;
        }
    }

    // Split `len` bytes at `va` into per-page pieces.
    fn access(
        &self,
        va: Va,
        len: usize,
        write: bool,
        mut f: impl FnMut(&Page, usize, Range<usize>),
    ) -> Result<(), KernelError> {
        let mut done = 0;
        while done < len {
            let cur = Va::new(va.into_usize() + done).ok_or(KernelError::BadAddress)?;
            let n = (PAGE_SIZE - cur.offset()).min(len - done);
            let page = self.translate(cur, write)?;
            f(&page, cur.offset(), done..done + n);
            done += n;
        }
        Ok(())
    }
}

impl Syscall for UserEnv<'_> {
    fn getenvid(&self) -> EnvId {
        self.id
    }

    fn page_lookup(&self, va: Va) -> Option<Pte> {
        self.kernel.lookup(self.id, va)
    }

    fn page_table_present(&self, va: Va) -> bool {
        self.kernel
            .state
            .lock()
            .envs
            .get(self.id)
            .is_some_and(|env| env.page_table.is_table_present(va))
    }

    fn page_alloc(&self, env: EnvId, va: Va, perm: PteFlags) -> Result<(), KernelError> {
        let mut state = self.kernel.state.lock();
        let target = state.envs.envid2env(self.id, env, true)?;
        check_va(va)?;
        check_perm(perm)?;
        let page = Page::new(&self.kernel.pool).ok_or(KernelError::NoMemory)?;
        if let Some(env) = state.envs.get_mut(target) {
            env.page_table.map(va, page, perm)?;
        }
        Ok(())
    }

    fn page_map(
        &self,
        srcenv: EnvId,
        srcva: Va,
        dstenv: EnvId,
        dstva: Va,
        perm: PteFlags,
    ) -> Result<(), KernelError> {
        let mut state = self.kernel.state.lock();
        let src = state.envs.envid2env(self.id, srcenv, true)?;
        let dst = state.envs.envid2env(self.id, dstenv, true)?;
        check_va(srcva)?;
        check_va(dstva)?;
        check_perm(perm)?;
        let page = match state.envs.get(src).map(|env| env.page_table.get_user_page(srcva)) {
            Some(Ok((_, flags))) if perm.contains(PteFlags::W) && !flags.contains(PteFlags::W) => {
                return Err(KernelError::InvalidArgument);
            }
            Some(Ok((page, _))) => page.clone(),
            _ => return Err(KernelError::InvalidArgument),
        };
        if let Some(env) = state.envs.get_mut(dst) {
            env.page_table.map(dstva, page, perm)?;
        }
        Ok(())
    }

    fn page_unmap(&self, env: EnvId, va: Va) -> Result<(), KernelError> {
        let mut state = self.kernel.state.lock();
        let target = state.envs.envid2env(self.id, env, true)?;
        check_va(va)?;
        match state.envs.get_mut(target).map(|env| env.page_table.unmap(va)) {
            Some(Err(PageTableMappingError::NotExist)) | Some(Ok(_)) | None => Ok(()),
            Some(Err(e)) => Err(e.into()),
        }
    }

    fn exofork(&self) -> Result<Forked, KernelError> {
        let mut state = self.kernel.state.lock();
        let env = state.envs.get_mut(self.id).ok_or(KernelError::BadEnv)?;
        if env.exofork_pending {
            env.exofork_pending = false;
            return Ok(Forked::Child);
        }
        let child = state.envs.alloc(self.id)?;
        if let Some(env) = state.envs.get_mut(child) {
            env.exofork_pending = true;
        }
        info!("[{}] new env {}", self.id, child);
        Ok(Forked::Parent(child))
    }

    fn env_set_pgfault_upcall(
        &self,
        env: EnvId,
        upcall: PgfaultUpcall,
    ) -> Result<(), KernelError> {
        let mut state = self.kernel.state.lock();
        let target = state.envs.envid2env(self.id, env, true)?;
        if let Some(env) = state.envs.get_mut(target) {
            env.pgfault_upcall = Some(upcall);
        }
        Ok(())
    }

    fn env_set_status(&self, env: EnvId, status: EnvStatus) -> Result<(), KernelError> {
        if status == EnvStatus::Free {
            return Err(KernelError::InvalidArgument);
        }
        let mut state = self.kernel.state.lock();
        let target = state.envs.envid2env(self.id, env, true)?;
        if let Some(env) = state.envs.get_mut(target) {
            debug!("[{}] status of {} -> {:?}", self.id, target, status);
            env.status = status;
        }
        Ok(())
    }

    fn env_destroy(&self, env: EnvId) -> Result<(), KernelError> {
        let mut state = self.kernel.state.lock();
        let target = state.envs.envid2env(self.id, env, true)?;
        let env = state.envs.destroy(target);
        drop(state);
        if let Some(env) = env {
            info!(
                "[{}] destroying env {} ({} pages mapped)",
                self.id,
                target,
                env.page_table.nr_mapped()
            );
        }
        Ok(())
    }
}

impl UserMemory for UserEnv<'_> {
    fn load(&self, va: Va, buf: &mut [u8]) -> Result<(), KernelError> {
        self.access(va, buf.len(), false, |page, ofs, range| {
            page.read(ofs, &mut buf[range])
        })
    }

    fn store(&self, va: Va, data: &[u8]) -> Result<(), KernelError> {
        self.access(va, data.len(), true, |page, ofs, range| {
            page.write(ofs, &data[range])
        })
    }
}
