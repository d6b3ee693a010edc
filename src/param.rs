//! Compile-time sizing for the process/CPU pools.
//!
//! These mirror the teacher kernel's `param.rs` but are trimmed to what the
//! core (process table, scheduler, sleep/wakeup) actually needs; the
//! file-system and disk-layout constants (`BSIZE`, `LOGSIZE`, `NINODE`, ...)
//! belong to the out-of-scope collaborators and are not reproduced here.

use static_assertions::const_assert;

/// Maximum number of processes.
pub const NPROC: usize = 64;

/// Maximum number of CPUs.
pub const NCPU: usize = 8;

/// Open files per process.
pub const NOFILE: usize = 16;

/// Maximum length of a process debug name, including the nul terminator.
pub const MAXPROCNAME: usize = 16;

/// Size in bytes of the single page `userinit` maps at user address 0.
pub const PGSIZE: usize = 4096;

/// Upper bound on a single process's simulated user memory image. Stands in
/// for the host running out of physical pages to back a `uvmcopy`-style
/// duplication; there is no real allocator underneath to exhaust, so this
/// is the thing that actually runs out instead.
pub const MAX_USER_MEM: usize = 64 * 1024;

const_assert!(NPROC > 0);
const_assert!(NCPU > 0);
const_assert!(NOFILE > 0);
const_assert!(MAXPROCNAME > 1);
const_assert!(PGSIZE > 0);
const_assert!(MAX_USER_MEM >= PGSIZE);
