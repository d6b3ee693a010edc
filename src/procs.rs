//! The process manager (§3 "process table" plus §4's lifecycle operations).
//!
//! `ProcessSystem` owns the fixed-size process pool and everything that
//! scans or mutates more than one slot at a time: allocation, `fork`,
//! `wait`/reaping, `kill`, reparenting orphans to the init process, waking a
//! whole pool's worth of sleepers, and the per-CPU scheduler loop. Anything
//! that only touches a single already-identified slot lives on `Proc`/
//! `ProcGuard` in `proc.rs` instead.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::OnceLock;

use array_macro::array;
use scopeguard::{guard, ScopeGuard};

use crate::error::KernelError;
use crate::fs;
use crate::memory::{HostUserMemory, UserAddr};
use crate::param::{MAXPROCNAME, NPROC, PGSIZE};
use crate::proc::{bind_current_proc, myproc, Proc, ProcGuard, Procstate, SlotId, TrapFrame};
use crate::spinlock::Spinlock;

/// Stands in for `initcode.S`'s bytes. §1 scopes the trap layer and ELF
/// loading out, so these bytes are never fetched or executed by anything in
/// this crate; only their length and load address matter to `userinit`.
const INITCODE: [u8; 4] = *b"\0\0\0\0";

const ROOTDEV: u32 = 1;

/// Test/harness support: a point-in-time, lock-free snapshot of one slot's
/// invariant-5 fields. Structured counterpart to `dump` (C7), which only
/// logs; returned by value since the slot's own lock is not held once this
/// function returns, so a live reference back into the pool would be unsound
/// to hand out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcSnapshot {
    pub pid: i32,
    pub state: Procstate,
    pub name: String,
    pub sz: usize,
    pub trapframe_epc: Option<usize>,
    pub trapframe_sp: Option<usize>,
    pub killed: bool,
}

/// The process table plus the bookkeeping that spans it: the next-pid
/// counter and `wait_lock`, which must be acquired before any `Proc::lock`
/// (§3 invariant 4) whenever both are needed.
pub struct ProcessSystem {
    pool: [Proc; NPROC],
    nextpid: AtomicI32,
    pub(crate) wait_lock: Spinlock<()>,
    initial_proc: OnceLock<SlotId>,
    /// Not part of the spec's model: lets tests ask every scheduler loop to
    /// stop after its current pass, so a test's threads can be joined and
    /// the process cleanly exit. Production use never sets it.
    shutdown: AtomicBool,
}

static KERNEL: OnceLock<ProcessSystem> = OnceLock::new();

/// Boots the process manager. Idempotent beyond the first call, which is
/// the only one that does anything (mirrors `procinit` running once at
/// kernel boot before any CPU starts its scheduler).
pub fn init_kernel() -> &'static ProcessSystem {
    KERNEL.get_or_init(|| {
        log::info!("procinit: process table ready for {} slots", NPROC);
        ProcessSystem {
            pool: array![_ => Proc::zero(); NPROC],
            nextpid: AtomicI32::new(1),
            wait_lock: Spinlock::new("wait_lock", ()),
            initial_proc: OnceLock::new(),
            shutdown: AtomicBool::new(false),
        }
    })
}

/// The ambient process manager. Every collaborator reaches it through this
/// accessor rather than threading a reference everywhere, matching the
/// teacher's single `static mut PROCESSES` equivalent, but safe: boot order
/// is enforced by `init_kernel` having to run first.
///
/// # Panics
/// Panics if called before [`init_kernel`].
pub fn kernel() -> &'static ProcessSystem {
    KERNEL.get().expect("kernel: init_kernel was not called")
}

impl ProcessSystem {
    fn slot_id(&self, p: &Proc) -> SlotId {
        let base = self.pool.as_ptr();
        let idx = unsafe { (p as *const Proc).offset_from(base) };
        debug_assert!(idx >= 0 && (idx as usize) < self.pool.len());
        SlotId(idx as usize)
    }

    fn slot(&self, id: SlotId) -> &Proc {
        &self.pool[id.0]
    }

    fn allocpid(&self) -> i32 {
        self.nextpid.fetch_add(1, Ordering::SeqCst)
    }

    /// Finds an `Unused` slot, marks it `Used` under a fresh pid, gives it a
    /// trapframe and a detached context, and returns it locked. Mirrors
    /// `allocproc`.
    fn alloc(&'static self) -> Result<ProcGuard<'static>, KernelError> {
        for p in self.pool.iter() {
            let mut g = match p.try_lock() {
                Some(g) => g,
                None => continue,
            };
            if g.info().state != Procstate::Unused {
                continue;
            }
            let pid = self.allocpid();
            p.reset_context();
            g.info_mut().pid = pid;
            g.info_mut().state = Procstate::Used;
            g.info_mut().trapframe = Some(Box::new(TrapFrame::default()));
            return Ok(g);
        }
        Err(KernelError::NoFreeSlot)
    }

    /// Resets a slot to `Unused`, dropping its memory image and trapframe.
    /// Does *not* touch `ofile`/`cwd` — `exit_current` already closed those
    /// before the slot ever became a zombie (§4's freeproc note).
    fn free_proc(g: &mut ProcGuard<'_>) {
        g.info_mut().trapframe.take();
        if let Some(mem) = g.info_mut().memory.take() {
            mem.free();
        }
        let info = g.info_mut();
        info.pid = 0;
        info.chan = 0;
        info.killed = false;
        info.xstate = 0;
        info.sz = 0;
        info.name = [0; MAXPROCNAME];
        info.state = Procstate::Unused;
    }

    /// Creates the first process (pid 1, the ancestor every orphan is
    /// reparented to). Must be called exactly once, before any CPU's
    /// `scheduler()` starts.
    ///
    /// # Panics
    /// Panics if called a second time, or if the pool has no room for even
    /// one process.
    pub fn user_proc_init(&'static self) {
        let mut g = self
            .alloc()
            .expect("user_proc_init: process table has no room for the first process");

        let mut page = vec![0u8; PGSIZE];
        page[..INITCODE.len()].copy_from_slice(&INITCODE);
        g.info_mut().memory = Some(HostUserMemory::new(&page));
        g.info_mut().sz = PGSIZE;
        if let Some(tf) = g.info_mut().trapframe.as_mut() {
            tf.epc = 0;
            tf.sp = PGSIZE;
            tf.a0 = 0;
        }
        g.info_mut().set_name("initcode");
        // SAFETY: the slot is not yet `Runnable`, so nothing else can reach
        // `data` concurrently.
        unsafe {
            g.data().cwd = Some(fs::namei("/"));
        }
        g.info_mut().state = Procstate::Runnable;

        let proc_ref: &'static Proc = g.proc();
        drop(g);

        self.initial_proc
            .set(self.slot_id(proc_ref))
            .unwrap_or_else(|_| panic!("user_proc_init: called more than once"));

        spawn_worker(proc_ref, init_reaper_loop);
    }

    /// Forks the calling process. Returns the child's pid to the parent.
    /// §4.2: copies the address space, duplicates open files and `cwd`,
    /// clears the child's `a0` (its view of this same call returns 0), and
    /// records parentage under `wait_lock` before making the child
    /// `Runnable`.
    ///
    /// A bare-metal `fork` duplicates the calling kernel thread's own call
    /// stack; the new thread (the child) resumes at the instruction right
    /// after `fork()` returns, distinguishing itself only by seeing `a0 ==
    /// 0` there. A dedicated OS thread per process (§1) cannot be cloned
    /// mid-stack that way, so `child_body` stands in for "the code the
    /// child resumes at": the parent's own fork call still returns the
    /// child's pid, exactly as `spec.md` §6 requires, while the child's
    /// continuation is supplied explicitly instead of being the same code
    /// the parent was already running.
    pub fn fork(
        &'static self,
        child_body: impl FnOnce() + Send + 'static,
    ) -> Result<i32, KernelError> {
        let parent = myproc();

        let (parent_tf, parent_sz, parent_name, child_memory) = {
            let g = parent.lock();
            let tf = *g
                .info()
                .trapframe
                .as_ref()
                .expect("fork: calling process has no trapframe");
            let sz = g.info().sz;
            let name = g.info().name_str().to_string();
            let mem = g
                .info()
                .memory
                .as_ref()
                .expect("fork: calling process has no memory")
                .copy()?;
            (tf, sz, name, mem)
        };

        // Registered before `child` below so it drops *after* `child`'s
        // guard releases the slot lock (locals drop in reverse declaration
        // order): on any early return the slot is unlocked by the time this
        // closure tries to re-lock it and free the half-built child.
        // Mirrors the teacher's `fork`, which frees a half-built child on
        // any failed step.
        let child_slot: Cell<Option<SlotId>> = Cell::new(None);
        let cleanup = guard((), |_| {
            if let Some(id) = child_slot.get() {
                let mut g = self.slot(id).lock();
                Self::free_proc(&mut g);
            }
        });

        let mut child = self.alloc()?;
        child_slot.set(Some(self.slot_id(child.proc())));

        child.info_mut().memory = Some(child_memory);
        child.info_mut().sz = parent_sz;
        child.info_mut().set_name(&parent_name);
        if let Some(tf) = child.info_mut().trapframe.as_mut() {
            *tf = parent_tf;
            tf.a0 = 0;
        }

        // SAFETY: the child slot is `Used`, not yet `Runnable`, so only this
        // setup path can reach its `data`; the parent's `data` is read-only
        // here and the parent cannot be concurrently forking on another
        // thread against itself.
        unsafe {
            let parent_data = parent.data();
            let child_data = child.data();
            for (slot, f) in child_data
                .open_files
                .iter_mut()
                .zip(parent_data.open_files.iter())
            {
                *slot = f.as_ref().map(fs::filedup);
            }
            child_data.cwd = parent_data.cwd.as_ref().map(fs::idup);
        }

        let child_pid = child.info().pid;
        let child_proc = child.proc();

        {
            let mut wl = self.wait_lock.lock();
            *child_proc.parent.get_mut(&mut wl) = Some(self.slot_id(parent));
        }

        child.info_mut().state = Procstate::Runnable;
        let child_proc: &'static Proc = child.proc();
        drop(child);

        ScopeGuard::into_inner(cleanup);

        spawn_worker(child_proc, child_body);
        Ok(child_pid)
    }

    /// Test/harness support: see [`ProcSnapshot`]. `None` if no live slot
    /// (state != `Unused`) currently holds `pid`.
    pub fn snapshot(&'static self, pid: i32) -> Option<ProcSnapshot> {
        self.pool.iter().find_map(|p| {
            let g = p.try_lock()?;
            if g.info().pid != pid || g.info().state == Procstate::Unused {
                return None;
            }
            Some(ProcSnapshot {
                pid: g.info().pid,
                state: g.info().state,
                name: g.info().name_str().to_string(),
                sz: g.info().sz,
                trapframe_epc: g.info().trapframe.as_ref().map(|t| t.epc),
                trapframe_sp: g.info().trapframe.as_ref().map(|t| t.sp),
                killed: g.info().killed,
            })
        })
    }

    /// Test/harness support: a snapshot of every non-`Unused` slot, in pool
    /// order. Used to check properties like "exactly one slot exists" or
    /// "every other slot's state is unchanged".
    pub fn snapshot_all(&'static self) -> Vec<ProcSnapshot> {
        self.pool
            .iter()
            .filter_map(|p| {
                let g = p.try_lock()?;
                (g.info().state != Procstate::Unused).then(|| ProcSnapshot {
                    pid: g.info().pid,
                    state: g.info().state,
                    name: g.info().name_str().to_string(),
                    sz: g.info().sz,
                    trapframe_epc: g.info().trapframe.as_ref().map(|t| t.epc),
                    trapframe_sp: g.info().trapframe.as_ref().map(|t| t.sp),
                    killed: g.info().killed,
                })
            })
            .collect()
    }

    /// Replaces the calling process's memory image in place, keeping its pid
    /// and slot (C6's `exec`-glue). Full `exec` — ELF parsing, argument
    /// stacking, building a new page table — is `uvminit`/`kvmmap`'s job and
    /// out of scope per §1; what belongs to the process table is exactly
    /// what `sys_exec` touches there on success: the old image is freed, a
    /// new one installed, `sz`/trapframe/name reset, while `pid` and
    /// `parent` are untouched. Never fails here, since the host stand-in
    /// has no page allocator to exhaust; a real `exec` can fail partway and
    /// must leave the caller running its old image, which callers that care
    /// should note does not apply to this stand-in.
    pub fn exec_glue(&'static self, path: &str, image: &[u8]) -> Result<(), KernelError> {
        let p = myproc();
        let new_memory = HostUserMemory::new(image);
        let mut g = p.lock();
        if let Some(old) = g.info_mut().memory.take() {
            old.free();
        }
        g.info_mut().sz = image.len();
        g.info_mut().memory = Some(new_memory);
        if let Some(tf) = g.info_mut().trapframe.as_mut() {
            tf.epc = 0;
            tf.sp = image.len();
            tf.a0 = 0;
        }
        let display_name = path.rsplit('/').next().unwrap_or(path);
        g.info_mut().set_name(display_name);
        Ok(())
    }

    /// Test/harness support: spawns a brand-new process running `body` on
    /// its own kernel thread, parented to init exactly as a freshly
    /// `fork`ed-and-`exec`ed child would be. Stands in for a shell forking
    /// and `exec`ing a program (out of scope per §1), so tests can drive
    /// `fork`/`wait`/`kill`/sleep-wakeup from inside a real process's kernel
    /// thread — only a process, never the test harness's own thread, may
    /// call into those operations (they all start from `myproc()`).
    pub fn spawn_test_process(&'static self, name: &str, body: impl FnOnce() + Send + 'static) -> i32 {
        let mut g = self.alloc().expect("spawn_test_process: process table full");
        g.info_mut().memory = Some(HostUserMemory::new(&INITCODE));
        g.info_mut().sz = INITCODE.len();
        if let Some(tf) = g.info_mut().trapframe.as_mut() {
            tf.epc = 0;
            tf.sp = INITCODE.len();
            tf.a0 = 0;
        }
        g.info_mut().set_name(name);
        let pid = g.info().pid;
        // SAFETY: the slot is not yet `Runnable`.
        unsafe {
            g.data().cwd = Some(fs::namei("/"));
        }
        g.info_mut().state = Procstate::Runnable;
        let proc_ref = g.proc();
        drop(g);

        if let Some(&init_id) = self.initial_proc.get() {
            let mut wl = self.wait_lock.lock();
            *proc_ref.parent.get_mut(&mut wl) = Some(init_id);
        }

        spawn_worker(proc_ref, body);
        pid
    }

    /// Moves every child of `parent` onto the init process, waking it in
    /// case it is blocked in `wait()`. Caller must hold `wait_lock`.
    fn reparent(&'static self, parent: &Proc, wl: &mut crate::spinlock::SpinlockGuard<'_, ()>) {
        let parent_id = self.slot_id(parent);
        let init_id = *self
            .initial_proc
            .get()
            .expect("reparent: init process not yet created");
        if parent_id == init_id {
            return;
        }
        for p in self.pool.iter() {
            if *p.parent.get(wl) == Some(parent_id) {
                *p.parent.get_mut(wl) = Some(init_id);
                self.slot(init_id).child_wait.wakeup();
            }
        }
    }

    /// Terminates the calling process (§4.3). Closes its open files and
    /// `cwd`, reparents its children to init, wakes its parent, then
    /// publishes `status` and blocks forever as a zombie.
    ///
    /// # Panics
    /// Panics if called on the init process, or if `sched` ever returns
    /// (both invariant violations per §4.3/§7).
    pub fn exit_current(&'static self, status: i32) -> ! {
        let p = myproc();
        let my_id = self.slot_id(p);
        let init_id = *self
            .initial_proc
            .get()
            .expect("exit_current: init process not yet created");
        assert_ne!(my_id, init_id, "init exiting");

        // SAFETY: only this process's own thread touches its `data`.
        unsafe { p.data().close_files() };

        let mut wl = self.wait_lock.lock();
        self.reparent(p, &mut wl);

        let parent_id = *p.parent.get(&wl);
        if let Some(parent_id) = parent_id {
            self.slot(parent_id).child_wait.wakeup();
        }

        let mut g = p.lock();
        g.info_mut().xstate = status;
        g.info_mut().state = Procstate::Zombie;
        drop(wl);

        g.sched();
        unreachable!("exit_current: sched returned for a zombie");
    }

    /// Waits for any child to exit (§4.4). `addr`, if non-null, receives the
    /// exited child's status via `copyout` into the caller's own memory.
    /// Blocks on the calling process's own `child_wait` channel when
    /// children exist but none have exited yet; returns
    /// [`KernelError::NoChildren`] if the caller has none at all, and
    /// [`KernelError::Interrupted`] if `kill` marks the caller while it
    /// waits.
    pub fn wait(&'static self, addr: UserAddr) -> Result<i32, KernelError> {
        let parent = myproc();
        let my_id = self.slot_id(parent);
        let mut wl = self.wait_lock.lock();

        loop {
            let mut have_child = false;
            for p in self.pool.iter() {
                if *p.parent.get(&wl) != Some(my_id) {
                    continue;
                }
                have_child = true;

                let mut g = p.lock();
                if g.info().state != Procstate::Zombie {
                    continue;
                }

                let pid = g.info().pid;
                let xstate = g.info().xstate;
                // Dropped before touching the parent's own lock: never hold
                // two slots' locks at once (the one ordering rule every
                // other operation in this module also follows).
                drop(g);

                // Copy the status out *before* freeing the child: a failing
                // `copy_out` (bad user pointer) must leave the child still
                // ZOMBIE so the caller can retry (§4.6/§7) rather than
                // losing it to an already-completed free.
                if !addr.is_null() {
                    let mut pg = parent.lock();
                    if let Some(mem) = pg.info_mut().memory.as_mut() {
                        mem.copy_out(addr, &xstate.to_ne_bytes())?;
                    }
                }

                let mut g = p.lock();
                Self::free_proc(&mut g);
                drop(g);
                *p.parent.get_mut(&mut wl) = None;

                return Ok(pid);
            }

            if !have_child {
                return Err(KernelError::NoChildren);
            }
            if parent.lock().info().killed {
                return Err(KernelError::Interrupted);
            }

            wl = parent.child_wait.sleep(&self.wait_lock, wl);
        }
    }

    /// Marks `pid` killed and wakes it if sleeping (§4.6). A running or
    /// runnable process only notices on its next pass through a syscall
    /// boundary (there is none to check in this core — callers that care
    /// observe `killed` directly, e.g. `wait`'s poll loop).
    pub fn kill(&'static self, pid: i32) -> Result<(), KernelError> {
        for p in self.pool.iter() {
            let mut g = p.lock();
            if g.info().pid != pid || g.info().state == Procstate::Unused {
                continue;
            }
            g.info_mut().killed = true;
            g.wake_if_sleeping();
            return Ok(());
        }
        Err(KernelError::NoSuchProcess)
    }

    /// Whether `pid` has been killed. Exposed for collaborators (trap
    /// handlers, syscall dispatch) that would otherwise need their own way
    /// to check; this core never clears the flag once set (§1, no signals).
    pub fn killed(&'static self, pid: i32) -> bool {
        self.pool
            .iter()
            .find_map(|p| {
                let g = p.lock();
                (g.info().pid == pid).then(|| g.info().killed)
            })
            .unwrap_or(false)
    }

    /// Wakes every sleeper on `chan` across the whole pool (§4.5). Never
    /// called while holding the caller's own slot lock — no slot in the
    /// pool can be the caller's own while this scans, since nothing sleeps
    /// holding its own lock across `wakeup`.
    pub fn wakeup_pool(&'static self, chan: &crate::proc::WaitChannel) {
        let this = crate::proc::current_proc_ptr();
        for p in self.pool.iter() {
            if this.is_some_and(|this| std::ptr::eq(p, this)) {
                continue;
            }
            let mut g = p.lock();
            if g.info().state == Procstate::Sleeping && g.info().chan == chan.addr_for_wakeup() {
                g.info_mut().state = Procstate::Runnable;
            }
        }
    }

    /// Yields the CPu voluntarily: marks the caller `Runnable` and switches
    /// back to the scheduler (§4.7).
    pub fn proc_yield(&'static self) {
        let mut g = myproc().lock();
        g.info_mut().state = Procstate::Runnable;
        g.sched();
    }

    /// Lock-free process table dump (C7): never blocks, even if some slot's
    /// lock is held by a wedged process, by using `try_lock` and simply
    /// reporting what it can.
    pub fn dump(&'static self) {
        for p in self.pool.iter() {
            match p.try_lock() {
                Some(g) if g.info().state != Procstate::Unused => {
                    log::info!(
                        "{:>5} {} {}",
                        g.info().pid,
                        g.info().state.as_str(),
                        g.info().name_str()
                    );
                }
                _ => {}
            }
        }
    }

    /// One CPU's scheduler loop (§4's "per-CPU scheduler"). Repeatedly
    /// scans the pool for a `Runnable` slot, runs it to the next voluntary
    /// switch, and moves on — any idle CPU may pick any runnable process,
    /// so two CPUs calling this never pick the same slot (each acquires the
    /// slot's lock before touching it).
    ///
    /// Does not return `!`: production boot never sets `shutdown`, so in
    /// practice this never returns either, but tests need to join these
    /// threads at teardown, which a true `-> !` signature would forbid.
    pub fn scheduler(&'static self, cpu_id: usize) {
        loop {
            crate::interrupts::intr_on();
            for slot in self.pool.iter() {
                let mut g = match slot.try_lock() {
                    Some(g) => g,
                    None => continue,
                };
                if g.info().state != Procstate::Runnable {
                    continue;
                }
                g.info_mut().state = Procstate::Running;
                let cpu = crate::cpu::CPUS.get(cpu_id);
                cpu.set_proc(slot as *const Proc as *mut Proc);
                let ctx = slot.context_handle();
                drop(g);
                crate::context::swtch(&cpu.context, &ctx);
                cpu.set_proc(std::ptr::null_mut());
            }
            if self.shutdown.load(Ordering::Relaxed) {
                return;
            }
        }
    }

    /// Requests every CPU's `scheduler()` loop stop after its current pass.
    /// Test-only: there is no way to ask a real kernel's scheduler to
    /// return.
    pub fn request_shutdown(&'static self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

/// The first thing a freshly scheduled process's worker thread runs, once
/// (§4's `forkret`). The real kernel's version releases `p->lock` here
/// first (acquired by the scheduler before its `swtch`); in this threaded
/// build the scheduler already released it before parking (see
/// `ProcessSystem::scheduler`), so there is nothing left to release.
fn forkret() {
    static FIRST: std::sync::Once = std::sync::Once::new();
    FIRST.call_once(|| fs::fsinit(ROOTDEV));
}

/// Spawns the dedicated OS thread standing in for a process's permanent
/// kernel stack (§9: each slot's stack is allocated once; here, each
/// *incarnation* of a slot gets its own thread instead, since an exited
/// thread simply stays parked forever rather than being reused — see the
/// note on `Proc::reset_context`).
fn spawn_worker(proc_ref: &'static Proc, body: impl FnOnce() + Send + 'static) {
    let pid = proc_ref.lock().info().pid;
    std::thread::Builder::new()
        .name(format!("proc-{pid}"))
        .spawn(move || {
            bind_current_proc(proc_ref);
            proc_ref.wait_for_first_schedule();
            forkret();
            body();
            kernel().exit_current(0);
        })
        .expect("spawn_worker: failed to spawn process thread");
}

/// The init process's body: loops reaping whatever `wait()` hands it,
/// mirroring xv6's `init.c`, which forks a shell and then waits in a loop
/// to adopt and reap any orphan reparented to it. There is no shell to
/// fork here (`exec` is out of scope per §1); this core's init exists
/// solely to keep `wait()`'s reparenting target alive and draining.
fn init_reaper_loop() {
    loop {
        match kernel().wait(UserAddr(0)) {
            // Reaped a zombie; immediately check for another rather than
            // yielding, since `reparent` may have handed us several at once.
            Ok(_) => {}
            // Both error paths return without ever calling `sched` (there
            // was nothing to block on), so this kernel thread must yield
            // explicitly here or it would keep this CPU's scheduler parked
            // on it forever, starving every other runnable slot.
            Err(_) => kernel().proc_yield(),
        }
    }
}
