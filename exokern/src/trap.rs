//! Page fault delivery.
//!
//! A user access that the page table does not allow raises a page fault. The
//! kernel does not resolve faults itself: it pushes a [`UTrapframe`] to the
//! top of the environment's exception stack ([`UXSTACK`]) and runs the
//! environment's registered upcall. Once the upcall returns, the faulting
//! access is retried.
//!
//! The environment is destroyed instead when
//! - it has no upcall,
//! - its exception stack is not mapped writable,
//! - it faults again while the upcall runs,
//! - the upcall returns an error, or
//! - the retried access faults again.
use crate::{
    KernelError, UserEnv,
    addressing::{PAGE_SIZE, Va},
    memlayout::UXSTACK,
    mm::page_table::PteFlags,
};
use abyss::PFErrorCode;
use log::{debug, warn};

/// Trap frame passed to a page fault upcall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UTrapframe {
    /// The faulting address.
    pub fault_va: Va,
    /// Why the access faulted.
    pub err: PFErrorCode,
}

impl UTrapframe {
    /// Size of the frame as pushed on the exception stack.
    pub const SIZE: usize = 8;

    /// Encode the frame the way it sits on the exception stack: the fault
    /// address followed by the error code, both little endian.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0; Self::SIZE];
        bytes[..4].copy_from_slice(&(self.fault_va.into_usize() as u32).to_le_bytes());
        bytes[4..].copy_from_slice(&self.err.bits().to_le_bytes());
        bytes
    }

    /// Decode a frame read back from the exception stack.
    pub fn from_bytes(bytes: [u8; Self::SIZE]) -> Option<Self> {
        let [a, b, c, d, e, f, g, h] = bytes;
        Some(UTrapframe {
            fault_va: Va::new(u32::from_le_bytes([a, b, c, d]) as usize)?,
            err: PFErrorCode::from_bits(u32::from_le_bytes([e, f, g, h]))?,
        })
    }
}

impl UserEnv<'_> {
    /// Deliver a page fault at `fault_va` to the environment's upcall.
    ///
    /// Returns `Ok` if the upcall handled the fault and the access may be
    /// retried, [`KernelError::Terminated`] if the environment was destroyed.
    pub(crate) fn page_fault(&self, fault_va: Va, err: PFErrorCode) -> Result<(), KernelError> {
        let utf = UTrapframe { fault_va, err };
        let upcall = {
            let mut state = self.kernel.state.lock();
            let env = state
                .envs
                .get_mut(self.id)
                .ok_or(KernelError::Terminated)?;
            let xstack = env
                .page_table
                .get_user_page(UXSTACK)
                .ok()
                .filter(|(_, flags)| flags.contains(PteFlags::P | PteFlags::U | PteFlags::W))
                .map(|(page, _)| page.clone());
            match (env.pgfault_upcall, xstack) {
                _ if env.in_upcall => Err("fault inside the page fault upcall"),
                (None, _) => Err("no page fault upcall"),
                (_, None) => Err("exception stack is not mapped writable"),
                (Some(upcall), Some(xstack)) => {
                    env.in_upcall = true;
                    env.faults += 1;
                    xstack.write(PAGE_SIZE - UTrapframe::SIZE, &utf.to_bytes());
                    Ok(upcall)
                }
            }
        };
        let upcall = match upcall {
            Ok(upcall) => upcall,
            Err(reason) => {
                warn!("[{}] page fault at {} ({:?}): {}", self.id, fault_va, err, reason);
                return Err(self.terminate());
            }
        };

        debug!("[{}] page fault at {} ({:?})", self.id, fault_va, err);
        let result = upcall(self, &utf);

        match self.kernel.state.lock().envs.get_mut(self.id) {
            Some(env) => env.in_upcall = false,
            None => return Err(KernelError::Terminated),
        }
        result.map_err(|e| {
            warn!(
                "[{}] page fault upcall failed at {}: {}",
                self.id,
                fault_va,
                e
            );
            self.terminate()
        })
    }
}
