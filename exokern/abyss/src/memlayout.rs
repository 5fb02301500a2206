//! Layout of a user address space.
//!
//! ```text
//!    UTOP, UXSTACKTOP -->  +------------------------------+ 0xeec00000
//!                          |     User Exception Stack     | RW/RW  PAGE_SIZE
//!                          +------------------------------+ 0xeebff000
//!                          |       Empty Memory (*)       | --/--  PAGE_SIZE
//!       USTACKTOP  --->    +------------------------------+ 0xeebfe000
//!                          |      Normal User Stack       | RW/RW  PAGE_SIZE
//!                          +------------------------------+ 0xeebfd000
//!                          |                              |
//!                          ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
//!                          .                              .
//!                          |~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~|
//!                          |     Program Data & Heap      |
//!       UTEXT -------->    +------------------------------+ 0x00800000
//!       PFTEMP ------->    |       Empty Memory (*)       |        PTSIZE
//!                          |                              |
//!       UTEMP -------->    +------------------------------+ 0x00400000
//!                          |       Empty Memory (*)       |
//!                          |                              |
//!       0 ------------>    +------------------------------+
//! ```
//!
//! Everything below [`UTOP`] belongs to the environment. The kernel never
//! lets an environment map anything at or above it.

use crate::addressing::{PAGE_SIZE, PTSIZE, Va};

/// Top of the user-controlled part of the address space.
pub const UTOP: Va = Va(0xeec0_0000);

/// Top of the one-page user exception stack.
///
/// The page right below this address is where the kernel runs the page fault
/// upcall of an environment. It must be private to the environment.
pub const UXSTACKTOP: Va = UTOP;

/// Base of the one-page user exception stack.
pub const UXSTACK: Va = Va(UXSTACKTOP.0 - PAGE_SIZE);

/// Top of the normal user stack. One empty page separates it from the
/// exception stack.
pub const USTACKTOP: Va = Va(UTOP.0 - 2 * PAGE_SIZE);

/// Where user programs are loaded.
pub const UTEXT: Va = Va(2 * PTSIZE);

/// Scratch region a user program may use for temporary mappings.
pub const UTEMP: Va = Va(PTSIZE);

/// Scratch page the page fault handler maps its private copy at.
pub const PFTEMP: Va = Va(UTEMP.0 + PTSIZE - PAGE_SIZE);
