//! Process table, per-CPU scheduler, and sleep/wakeup core of a teaching
//! kernel.
//!
//! This crate is the part of the kernel that owns process lifecycle
//! (`fork`/`exit`/`wait`/`kill`), scheduling, and the sleep/wakeup
//! rendezvous primitive everything else (pipes, disk I/O, `wait` itself)
//! is built on. It does not contain a page-table allocator, a file system,
//! a trap/interrupt layer, or any architecture-specific boot code — those
//! are external collaborators this crate only holds opaque handles to (see
//! `memory.rs`, `fs.rs`).
//!
//! Because the kernel this core was extracted from only ever ran on bare
//! metal under QEMU, there is no host-side way to drive it without a
//! rewrite of `swtch`/`mycpu`/interrupts in terms of real threads. That
//! rewrite is `context.rs`/`cpu.rs`/`interrupts.rs`: a CPU is an OS thread
//! running `scheduler()` forever, a process is an OS thread parked between
//! `swtch` calls, and `swtch` itself is a park/unpark handoff instead of a
//! register save/restore. Every other module's logic — the process table,
//! the lock discipline, `fork`/`exit`/`wait`/`kill`, sleep/wakeup — is
//! exactly what a bare-metal build would have.

pub mod context;
pub mod cpu;
pub mod error;
pub mod fs;
pub mod interrupts;
pub mod memory;
pub mod param;
pub mod proc;
pub mod procs;
pub mod spinlock;

pub use error::KernelError;
pub use memory::UserAddr;
pub use proc::{Procstate, SlotId, WaitChannel};
pub use procs::ProcSnapshot;

use std::thread::JoinHandle;

/// Boots the process table. Must be called exactly once, before
/// [`userinit`] or [`start_schedulers`].
pub fn procinit() {
    procs::init_kernel();
}

/// Creates the first process and spawns its worker thread. Must be called
/// exactly once, after [`procinit`] and before [`start_schedulers`].
pub fn userinit() {
    procs::kernel().user_proc_init();
}

/// Starts `n` CPUs, each running `scheduler()` on its own OS thread.
/// Returns their join handles so a caller (a test, typically) can shut the
/// simulation down with [`request_shutdown`] and wait for them to exit.
pub fn start_schedulers(n: usize) -> Vec<JoinHandle<()>> {
    (0..n)
        .map(|cpu_id| {
            std::thread::Builder::new()
                .name(format!("cpu-{cpu_id}"))
                .spawn(move || {
                    cpu::bind_current_cpu(cpu_id);
                    procs::kernel().scheduler(cpu_id);
                })
                .expect("start_schedulers: failed to spawn a CPU thread")
        })
        .collect()
}

/// Asks every CPU's `scheduler()` to stop after its current pass. Test-only
/// (§ see `ProcessSystem::scheduler`'s doc comment).
pub fn request_shutdown() {
    procs::kernel().request_shutdown();
}

/// Forks the calling process, running `child_body` as the child's
/// continuation. See [`procs::ProcessSystem::fork`].
pub fn fork(child_body: impl FnOnce() + Send + 'static) -> Result<i32, KernelError> {
    procs::kernel().fork(child_body)
}

/// Terminates the calling process and never returns. See
/// [`procs::ProcessSystem::exit_current`].
pub fn exit(status: i32) -> ! {
    procs::kernel().exit_current(status)
}

/// Waits for a child to exit. See [`procs::ProcessSystem::wait`].
pub fn wait(addr: UserAddr) -> Result<i32, KernelError> {
    procs::kernel().wait(addr)
}

/// Marks `pid` killed and wakes it if sleeping. See
/// [`procs::ProcessSystem::kill`].
pub fn kill(pid: i32) -> Result<(), KernelError> {
    procs::kernel().kill(pid)
}

/// Whether `pid` has been killed. See [`procs::ProcessSystem::killed`].
pub fn killed(pid: i32) -> bool {
    procs::kernel().killed(pid)
}

/// Voluntarily gives up the CPU. See [`procs::ProcessSystem::proc_yield`].
pub fn proc_yield() {
    procs::kernel().proc_yield();
}

/// Replaces the calling process's image in place. See
/// [`procs::ProcessSystem::exec_glue`].
pub fn exec(path: &str, image: &[u8]) -> Result<(), KernelError> {
    procs::kernel().exec_glue(path, image)
}

/// Test/harness support: spawns a process running `body` on its own kernel
/// thread. See [`procs::ProcessSystem::spawn_test_process`].
pub fn spawn_test_process(name: &str, body: impl FnOnce() + Send + 'static) -> i32 {
    procs::kernel().spawn_test_process(name, body)
}

/// Test/harness support. See [`procs::ProcessSystem::snapshot`].
pub fn snapshot(pid: i32) -> Option<ProcSnapshot> {
    procs::kernel().snapshot(pid)
}

/// Test/harness support. See [`procs::ProcessSystem::snapshot_all`].
pub fn snapshot_all() -> Vec<ProcSnapshot> {
    procs::kernel().snapshot_all()
}

/// Prints a lock-free snapshot of the process table. See
/// [`procs::ProcessSystem::dump`].
pub fn procdump() {
    procs::kernel().dump();
}

/// The calling kernel thread's process slot. See [`proc::myproc`].
pub fn myproc() -> &'static proc::Proc {
    proc::myproc()
}

/// The calling kernel thread's CPU id. See [`cpu::cpuid`].
pub fn mycpu() -> usize {
    cpu::cpuid()
}
