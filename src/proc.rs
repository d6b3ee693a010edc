//! The process slot (§3 "Process descriptor") and the primitives built
//! directly on top of it: context switch entry/exit (`sched`) and
//! sleep/wakeup (C5).

use std::cell::UnsafeCell;
use std::sync::Arc;

use crate::context::Context;
use crate::fs::{FileHandle, Inode};
use crate::memory::HostUserMemory;
use crate::param::{MAXPROCNAME, NOFILE};
use crate::spinlock::{Spinlock, SpinlockGuard, SpinlockProtected};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Procstate {
    Unused,
    Used,
    Sleeping,
    Runnable,
    Running,
    Zombie,
}

impl Procstate {
    pub fn as_str(&self) -> &'static str {
        match self {
            Procstate::Unused => "unused",
            Procstate::Used => "used",
            Procstate::Sleeping => "sleep ",
            Procstate::Runnable => "runble",
            Procstate::Running => "run   ",
            Procstate::Zombie => "zombie",
        }
    }
}

/// Trimmed down from the real ~35-register trapframe (§1: the trap layer's
/// exact register save area is out of scope); only the fields the lifecycle
/// operations in §4.6 actually read or write are kept.
#[derive(Copy, Clone, Default)]
pub struct TrapFrame {
    /// Saved user program counter.
    pub epc: usize,
    /// Saved user stack pointer.
    pub sp: usize,
    /// The register carrying a syscall's return value (`fork` clears this
    /// to 0 in the child).
    pub a0: usize,
}

/// A slot's index into the process pool. A weak, non-owning reference —
/// never a pointer — per §9's design note on cyclic parent/child
/// references.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct SlotId(pub usize);

/// Fields guarded by `Proc::lock` (§3 invariant 5): `killed`, `xstate`,
/// `state`, `chan`, `trapframe`, `sz`, `pagetable`, `name`.
///
/// `context` is invariant 5's one exception here: it carries its own
/// internal synchronization (a park/unpark rendezvous, see `context.rs`)
/// that makes the outer slot lock unnecessary for it, so it lives on
/// [`Proc`] itself rather than in here — the same place the teacher keeps
/// it (`ProcData.context`, alongside the open-file table, not behind
/// `info`'s lock).
pub struct ProcInfo {
    pub state: Procstate,
    pub pid: i32,
    /// Non-zero while `SLEEPING`: the address of the `WaitChannel` being
    /// waited on.
    pub chan: usize,
    pub killed: bool,
    pub xstate: i32,
    pub sz: usize,
    pub memory: Option<HostUserMemory>,
    pub trapframe: Option<Box<TrapFrame>>,
    pub name: [u8; MAXPROCNAME],
}

impl ProcInfo {
    const fn zero() -> Self {
        Self {
            state: Procstate::Unused,
            pid: 0,
            chan: 0,
            killed: false,
            xstate: 0,
            sz: 0,
            memory: None,
            trapframe: None,
            name: [0; MAXPROCNAME],
        }
    }

    pub fn name_str(&self) -> &str {
        let len = self.name.iter().position(|&c| c == 0).unwrap_or(self.name.len());
        std::str::from_utf8(&self.name[..len]).unwrap_or("???")
    }

    /// Copies `name` into the fixed-size name buffer, truncating to its
    /// length. §9's first open question: the bound is the buffer's own
    /// length, not a literal `sizeof(16)`.
    pub fn set_name(&mut self, name: &str) {
        self.name = [0; MAXPROCNAME];
        let bytes = name.as_bytes();
        let n = bytes.len().min(self.name.len() - 1);
        self.name[..n].copy_from_slice(&bytes[..n]);
    }
}

/// Fields private to the process (§3: not listed among invariant 5's
/// lock-guarded fields): the open-file table and current directory. Only
/// ever touched by the process's own kernel thread, or by a parent/child
/// during setup before the slot is made runnable.
pub struct ProcData {
    pub open_files: [Option<Arc<FileHandle>>; NOFILE],
    pub cwd: Option<Arc<Inode>>,
}

impl ProcData {
    const fn zero() -> Self {
        Self {
            open_files: [const { None }; NOFILE],
            cwd: None,
        }
    }

    pub fn close_files(&mut self) {
        for f in self.open_files.iter_mut() {
            if let Some(f) = f.take() {
                crate::fs::fileclose(f);
            }
        }
        let _tx = crate::fs::begin_op();
        if let Some(ip) = self.cwd.take() {
            crate::fs::iput(ip);
        }
    }
}

/// A process slot. Identity is its index in the pool; the slot itself is
/// never relocated (§3).
pub struct Proc {
    info: Spinlock<ProcInfo>,

    /// Guarded by the process manager's `wait_lock`, not `info`'s lock
    /// (§3 invariant 4).
    pub(crate) parent: SpinlockProtected<Option<SlotId>>,

    /// The channel a process blocked in `wait()` sleeps on. Mirrors the
    /// teacher's `wait()`, which sleeps on the address of the waiting
    /// process itself (`sleep(p, &wait_lock)`); `exit()` wakes a specific
    /// parent by calling `wakeup` on exactly this field, never the whole
    /// pool's channel.
    pub(crate) child_wait: WaitChannel,

    /// Not lock-protected; see the note on [`ProcInfo`]. Wrapped in a mutex
    /// and replaced wholesale on every (re)allocation (see
    /// `ProcessSystem::alloc`): an exited process's worker thread ends up
    /// permanently parked on whatever `Context` it last held (nothing ever
    /// `swtch`es into a `Zombie`/`Unused` slot again to wake it), so the next
    /// process to reuse this slot must not share that same rendezvous, or a
    /// wakeup meant for it could be lost to the dead thread instead.
    context: std::sync::Mutex<std::sync::Arc<Context>>,

    data: UnsafeCell<ProcData>,
}

// SAFETY: `data` is only read/written by the process's own kernel thread
// once running, and by its parent/allocator strictly before the slot
// becomes `Runnable` — never concurrently.
unsafe impl Sync for Proc {}

impl Proc {
    pub(crate) fn zero() -> Self {
        Self {
            info: Spinlock::new("proc", ProcInfo::zero()),
            parent: SpinlockProtected::new(None),
            child_wait: WaitChannel::new(),
            context: std::sync::Mutex::new(std::sync::Arc::new(Context::new())),
            data: UnsafeCell::new(ProcData::zero()),
        }
    }

    pub(crate) fn context_handle(&self) -> std::sync::Arc<Context> {
        self.context.lock().unwrap().clone()
    }

    /// Gives this slot a fresh context, detached from whatever the previous
    /// occupant last parked on. Called once per allocation, before the
    /// slot's worker thread is spawned.
    pub(crate) fn reset_context(&self) {
        *self.context.lock().unwrap() = std::sync::Arc::new(Context::new());
    }

    /// Blocks the calling kernel thread until a CPU's `scheduler()` first
    /// `swtch`es into this slot. Called exactly once, by a freshly spawned
    /// process worker thread before it has ever been scheduled — the
    /// threaded stand-in for a brand new kernel thread's saved context
    /// already pointing at `forkret` the first time a real CPU resumes it.
    pub(crate) fn wait_for_first_schedule(&self) {
        self.context_handle().wait_for_resume();
    }

    /// Acquires this slot's lock.
    pub fn lock(&self) -> ProcGuard<'_> {
        ProcGuard {
            proc: self,
            info: self.info.lock(),
        }
    }

    pub fn try_lock(&self) -> Option<ProcGuard<'_>> {
        self.info.try_lock().map(|info| ProcGuard { proc: self, info })
    }

    /// Data private to the process; see [`ProcData`]. Caller must ensure
    /// exclusivity (only the owning kernel thread, or the allocator/parent
    /// before the slot is `Runnable`).
    ///
    /// # Safety
    /// Must not be called while any other thread may concurrently access
    /// the same slot's `data`.
    pub unsafe fn data(&self) -> &mut ProcData {
        unsafe { &mut *self.data.get() }
    }
}

/// A guard proving this slot's lock is held, through which all of
/// invariant 5's fields may be read or written.
pub struct ProcGuard<'a> {
    proc: &'a Proc,
    info: SpinlockGuard<'a, ProcInfo>,
}

impl<'a> ProcGuard<'a> {
    pub fn proc(&self) -> &'a Proc {
        self.proc
    }

    pub fn info(&self) -> &ProcInfo {
        &self.info
    }

    pub fn info_mut(&mut self) -> &mut ProcInfo {
        &mut self.info
    }

    /// # Safety
    /// See [`Proc::data`].
    pub unsafe fn data(&self) -> &mut ProcData {
        unsafe { self.proc.data() }
    }

    /// Switches to the scheduler. Requires: only this slot's lock is held
    /// (`noff == 1`), `state != Running`, and interrupts disabled (C4).
    /// Preserves `interrupt_enabled` across the switch, since that is a
    /// property of this kernel thread, not the CPU it happens to be on.
    ///
    /// Consumes the guard: unlike the bare-metal version, where the slot
    /// lock stays (logically) held until the scheduler's own acquire/release
    /// bracket closes around the whole `swtch`, here the lock must be
    /// released *before* the calling thread parks, or the scheduler could
    /// never `try_lock` this slot to resume it. Callers that still need the
    /// slot's state after waking back up (`WaitChannel::sleep`) re-acquire a
    /// fresh guard once `sched` returns.
    pub fn sched(self) {
        assert_eq!(crate::cpu::noff(), 1, "sched locks");
        assert_ne!(self.info.state, Procstate::Running, "sched running");
        assert!(!crate::interrupts::intr_get(), "sched interruptible");

        let interrupt_enabled = crate::cpu::interrupt_enabled();
        let cpu = crate::cpu::CPUS.get(crate::cpu::cpuid());
        let ctx = self.proc.context_handle();
        drop(self);
        crate::context::swtch(&ctx, &cpu.context);
        crate::cpu::set_interrupt_enabled(interrupt_enabled);
    }

    /// Marks the process `Runnable` if it is currently `Sleeping`. Part of
    /// `wakeup`/`kill`'s "promote to runnable" step.
    pub(crate) fn wake_if_sleeping(&mut self) {
        if self.info.state == Procstate::Sleeping {
            self.info.state = Procstate::Runnable;
        }
    }
}

thread_local! {
    /// The slot the calling kernel thread belongs to. Set exactly once,
    /// when a process's worker thread starts (see `procs::spawn_proc_thread`).
    static CURRENT_PROC: std::cell::Cell<*const Proc> = const { std::cell::Cell::new(std::ptr::null()) };
}

/// Binds the calling kernel thread to the process slot it runs forever
/// after. Not for use outside the thread a slot's worker is spawned on.
pub fn bind_current_proc(p: &'static Proc) {
    CURRENT_PROC.with(|c| c.set(p as *const Proc));
}

/// Returns the process slot the calling kernel thread belongs to.
///
/// # Panics
/// Panics if called from a kernel thread that is not a process (e.g. a
/// CPU's scheduler thread) — mirrors the teacher's `myexproc`, which
/// asserts the CPU's `proc` pointer is non-null.
pub fn myproc() -> &'static Proc {
    let ptr = CURRENT_PROC.with(|c| c.get());
    assert!(!ptr.is_null(), "myproc: no current process");
    unsafe { &*ptr }
}

/// Like [`myproc`], but `None` instead of a panic when the calling thread
/// is not bound to a process (a CPU's scheduler thread, or a test harness
/// thread exercising `WaitChannel` directly). Used only to skip a process's
/// own slot in a pool-wide scan; nothing here should need to distinguish
/// "not a process" from "this process" for any other reason.
pub(crate) fn current_proc_ptr() -> Option<*const Proc> {
    let ptr = CURRENT_PROC.with(|c| c.get());
    (!ptr.is_null()).then_some(ptr)
}

/// An opaque sleep/wakeup rendezvous point (§4.5, "Channel"). Deliberately
/// non-zero-sized so two distinct channels never alias to the same address.
pub struct WaitChannel {
    _padding: u8,
}

impl WaitChannel {
    pub const fn new() -> Self {
        Self { _padding: 0 }
    }

    fn addr(&self) -> usize {
        self as *const Self as usize
    }

    /// Exposes this channel's address to `ProcessSystem::wakeup_pool`,
    /// which has to compare it against every sleeping slot's `chan` field
    /// directly rather than going through `sleep`/`wakeup`.
    pub(crate) fn addr_for_wakeup(&self) -> usize {
        self.addr()
    }

    /// Atomically releases `lk` and puts the caller to sleep on this
    /// channel; reacquires `lk` before returning. No wakeup issued on this
    /// channel after the caller acquires its own slot lock below can ever
    /// be missed, because `wakeup` also has to acquire that same lock
    /// before it can flip the state to `Runnable`.
    pub fn sleep<'a, T>(
        &self,
        lock: &'a Spinlock<T>,
        lk: SpinlockGuard<'a, T>,
    ) -> SpinlockGuard<'a, T> {
        let p = myproc();

        //DOC: sleeplock1
        let mut guard = p.lock();
        drop(lk);

        guard.info_mut().chan = self.addr();
        guard.info_mut().state = Procstate::Sleeping;
        guard.sched();

        // Resumed. `sched` released our slot lock before parking, so we
        // re-acquire a fresh guard to clear `chan` — the net effect matches
        // the bare-metal `sleep`, which continues past `sched()` still
        // holding `p->lock` and clears `chan` before its own release.
        let mut guard = p.lock();
        guard.info_mut().chan = 0;
        drop(guard);

        lock.lock()
    }

    /// Wakes every process in the pool sleeping on this channel. Must be
    /// called without holding the caller's own slot lock.
    pub fn wakeup(&self) {
        crate::procs::kernel().wakeup_pool(self);
    }
}

impl Default for WaitChannel {
    fn default() -> Self {
        Self::new()
    }
}
