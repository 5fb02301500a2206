//! Environments.
//!
//! An environment is the exokernel's notion of a process: an address space
//! plus the small amount of state the kernel needs to run it and to deliver
//! its page faults. Environments live in a fixed-size table; an [`EnvId`]
//! names a slot of that table together with a generation number, so that an
//! id of a destroyed environment never names the environment that later
//! reuses its slot.
use crate::{KernelError, mm::page_table::PageTable, syscall::PgfaultUpcall};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Maximum number of environments of a machine.
pub const NENV: usize = 1 << LOG2NENV;

const LOG2NENV: usize = 10;

/// Generation numbers start right above the slot index bits.
const ENVGENSHIFT: usize = 12;

/// Identifier of an environment.
///
/// The low bits hold the index of the environment table slot, the upper bits
/// a generation number that changes every time the slot is reused.
/// [`EnvId::SELF`] stands for the calling environment in every system call.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct EnvId(pub u32);

impl EnvId {
    /// The calling environment.
    pub const SELF: EnvId = EnvId(0);

    /// Slot of the environment table this id refers to.
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize & (NENV - 1)
    }
}

impl core::fmt::Debug for EnvId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "EnvId({:08x})", self.0)
    }
}

impl core::fmt::Display for EnvId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Scheduling status of an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum EnvStatus {
    /// The slot is unused.
    Free = 0,
    /// The environment may be scheduled.
    Runnable = 1,
    /// The environment exists but must not run yet, e.g. a child that its
    /// parent is still setting up.
    NotRunnable = 2,
}

pub(crate) struct Env {
    pub(crate) id: EnvId,
    pub(crate) parent: EnvId,
    pub(crate) status: EnvStatus,
    pub(crate) page_table: PageTable,
    pub(crate) pgfault_upcall: Option<PgfaultUpcall>,
    // Set by exofork on the child; the child's first exofork observes it.
    pub(crate) exofork_pending: bool,
    pub(crate) in_upcall: bool,
    pub(crate) faults: usize,
}

struct Slot {
    last_id: EnvId,
    env: Option<Env>,
}

/// The environment table.
pub(crate) struct EnvTable {
    slots: Box<[Slot]>,
}

impl EnvTable {
    pub(crate) fn new(size: usize) -> Self {
        EnvTable {
            slots: (0..size.min(NENV))
                .map(|_| Slot {
                    last_id: EnvId::default(),
                    env: None,
                })
                .collect(),
        }
    }

    /// Allocate a fresh environment with an empty address space.
    ///
    /// The new environment is [`EnvStatus::NotRunnable`].
    pub(crate) fn alloc(&mut self, parent: EnvId) -> Result<EnvId, KernelError> {
        let (index, slot) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| slot.env.is_none())
            .ok_or(KernelError::NoFreeEnv)?;

        let mut generation = (slot.last_id.0 + (1 << ENVGENSHIFT)) & !(NENV as u32 - 1);
        if generation == 0 || generation > i32::MAX as u32 {
            generation = 1 << ENVGENSHIFT;
        }
        let id = EnvId(generation | index as u32);
        slot.last_id = id;
        slot.env = Some(Env {
            id,
            parent,
            status: EnvStatus::NotRunnable,
            page_table: PageTable::new(),
            pgfault_upcall: None,
            exofork_pending: false,
            in_upcall: false,
            faults: 0,
        });
        Ok(id)
    }

    pub(crate) fn get(&self, id: EnvId) -> Option<&Env> {
        self.slots
            .get(id.index())
            .and_then(|slot| slot.env.as_ref())
            .filter(|env| env.id == id)
    }

    pub(crate) fn get_mut(&mut self, id: EnvId) -> Option<&mut Env> {
        self.slots
            .get_mut(id.index())
            .and_then(|slot| slot.env.as_mut())
            .filter(|env| env.id == id)
    }

    /// Resolve `id` as seen by the environment `cur`.
    ///
    /// [`EnvId::SELF`] resolves to `cur`. With `checkperm`, the target must be
    /// `cur` itself or one of its immediate children.
    pub(crate) fn envid2env(
        &self,
        cur: EnvId,
        id: EnvId,
        checkperm: bool,
    ) -> Result<EnvId, KernelError> {
        let id = if id == EnvId::SELF { cur } else { id };
        let env = self.get(id).ok_or(KernelError::BadEnv)?;
        if checkperm && env.id != cur && env.parent != cur {
            return Err(KernelError::BadEnv);
        }
        Ok(env.id)
    }

    /// Remove the environment from the table.
    ///
    /// Its address space goes with it, releasing every frame that no other
    /// environment maps.
    pub(crate) fn destroy(&mut self, id: EnvId) -> Option<Env> {
        self.slots
            .get_mut(id.index())
            .filter(|slot| slot.env.as_ref().is_some_and(|env| env.id == id))
            .and_then(|slot| slot.env.take())
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Env> {
        self.slots.iter().filter_map(|slot| slot.env.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_carry_generation() {
        let mut envs = EnvTable::new(4);
        let a = envs.alloc(EnvId::SELF).unwrap();
        assert_eq!(a.index(), 0);
        assert_eq!(a, EnvId(1 << ENVGENSHIFT));
        assert_ne!(a, EnvId::SELF);

        assert!(envs.destroy(a).is_some());
        assert!(envs.destroy(a).is_none());
        let b = envs.alloc(EnvId::SELF).unwrap();
        assert_eq!(b.index(), 0);
        assert_ne!(a, b);
        assert!(envs.get(a).is_none());
        assert_eq!(envs.get(b).map(|env| env.status), Some(EnvStatus::NotRunnable));
    }

    #[test]
    fn table_exhaustion() {
        let mut envs = EnvTable::new(2);
        envs.alloc(EnvId::SELF).unwrap();
        envs.alloc(EnvId::SELF).unwrap();
        assert_eq!(envs.alloc(EnvId::SELF), Err(KernelError::NoFreeEnv));
    }

    #[test]
    fn only_self_and_children_pass_permission_check() {
        let mut envs = EnvTable::new(8);
        let parent = envs.alloc(EnvId::SELF).unwrap();
        let child = envs.alloc(parent).unwrap();
        let grandchild = envs.alloc(child).unwrap();

        assert_eq!(envs.envid2env(parent, EnvId::SELF, true), Ok(parent));
        assert_eq!(envs.envid2env(parent, child, true), Ok(child));
        assert_eq!(envs.envid2env(parent, grandchild, true), Err(KernelError::BadEnv));
        assert_eq!(envs.envid2env(child, parent, true), Err(KernelError::BadEnv));
        assert_eq!(envs.envid2env(child, parent, false), Ok(parent));
        assert_eq!(
            envs.envid2env(parent, EnvId(0xdead_0000 | child.0), true),
            Err(KernelError::BadEnv)
        );
    }

    #[test]
    fn status_raw_values() {
        assert_eq!(u32::from(EnvStatus::Runnable), 1);
        assert_eq!(EnvStatus::try_from(2u32).ok(), Some(EnvStatus::NotRunnable));
        assert!(EnvStatus::try_from(7u32).is_err());
    }
}
