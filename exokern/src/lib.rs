//! # exokern: a simulated exokernel
//!
//! `exokern` is an in-memory machine that provides the handful of primitives
//! an exokernel exports to user-level libraries: allocate a page, map a page
//! from one environment into another, unmap it, create an empty child
//! environment, register a page fault upcall, and change an environment's
//! status. Everything above these primitives, including `fork`, is the job
//! of user-level code.
//!
//! The machine consists of
//! - a pool of reference-counted physical frames ([`mm`]),
//! - one two-level page table per environment ([`mm::page_table`]),
//! - an environment table ([`env`]),
//! - the system call boundary ([`syscall`]), and
//! - user memory access, which raises page faults and delivers them to the
//!   environment's upcall ([`trap`]).
//!
//! A [`Kernel`] owns all of it. User code runs "inside" an environment
//! through a [`UserEnv`] handle, which implements the [`syscall::Syscall`]
//! and [`syscall::UserMemory`] traits.
//!
//! ```
//! use exokern::{Kernel, addressing::Va, env::EnvId, mm::page_table::PteFlags, syscall::*};
//!
//! let kernel = Kernel::builder().frames(64).boot();
//! let id = kernel.create_env().unwrap();
//! let env = kernel.enter(id).unwrap();
//! let va = Va::new(0x0080_0000).unwrap();
//! env.page_alloc(EnvId::SELF, va, PteFlags::P | PteFlags::U | PteFlags::W).unwrap();
//! env.store(va, b"hello").unwrap();
//! ```
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod env;
mod kernel;
pub mod mm;
pub mod syscall;
pub mod trap;

pub use abyss::{addressing, memlayout, PFErrorCode};
pub use kernel::{Kernel, UserEnv};

use env::NENV;
use mm::page_table::PageTableMappingError;

/// Enum representing errors that can occur during a kernel operation.
///
/// Each variant corresponds to a specific type of error that might
/// occur during the handling of a system call or a user memory access. These
/// errors are returned to the user program to indicate the nature of the
/// failure.
#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum KernelError {
    /// The environment does not exist, or the caller may not touch it.
    /// (ESRCH)
    #[error("bad environment")]
    BadEnv,
    /// Out of memory. (ENOMEM)
    #[error("out of memory")]
    NoMemory,
    /// The environment table is full. (EAGAIN)
    #[error("out of environments")]
    NoFreeEnv,
    /// Permission denied. (EACCES)
    #[error("invalid access")]
    InvalidAccess,
    /// Bad address. (EFAULT)
    #[error("bad address")]
    BadAddress,
    /// Invalid arguement. (EINVAL)
    #[error("invalid argument")]
    InvalidArgument,
    /// The calling environment was destroyed while the kernel served the
    /// request, e.g. because of an unrecoverable page fault.
    #[error("environment terminated")]
    Terminated,
}

impl From<PageTableMappingError> for KernelError {
    fn from(e: PageTableMappingError) -> Self {
        match e {
            PageTableMappingError::Unaligned
            | PageTableMappingError::OutOfRange
            | PageTableMappingError::InvalidPermission => KernelError::InvalidArgument,
            PageTableMappingError::NotExist => KernelError::BadAddress,
        }
    }
}

/// Static configuration of a [`Kernel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelConfig {
    /// Number of physical frames in the frame pool.
    pub frames: usize,
    /// Number of slots in the environment table.
    pub max_envs: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig {
            frames: 4096,
            max_envs: NENV,
        }
    }
}

/// A builder for system configuration settings.
///
/// The [`KernelConfigBuilder`] provides an interface for configuring the
/// machine before it boots.
///
/// ```
/// let kernel = exokern::Kernel::builder().frames(16).max_envs(4).boot();
/// assert_eq!(kernel.free_frames(), 16);
/// ```
#[derive(Debug, Default)]
pub struct KernelConfigBuilder {
    config: KernelConfig,
}

impl KernelConfigBuilder {
    /// Sets the number of physical frames of the machine.
    pub fn frames(mut self, frames: usize) -> Self {
        self.config.frames = frames;
        self
    }

    /// Sets the size of the environment table.
    ///
    /// The table never grows beyond [`NENV`] slots, since environment ids
    /// encode the slot index in their low bits.
    pub fn max_envs(mut self, max_envs: usize) -> Self {
        self.config.max_envs = max_envs.clamp(1, NENV);
        self
    }

    /// Finish the configuration.
    pub fn build(self) -> KernelConfig {
        self.config
    }

    /// Boot a [`Kernel`] with this configuration.
    pub fn boot(self) -> Kernel {
        Kernel::new(self.config)
    }
}
