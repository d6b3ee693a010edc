//! Context switch (C3).
//!
//! `swtch(old, new)` saves the callee-saved registers of the calling kernel
//! thread into `old` and loads them from `new`; from the compiler's point of
//! view it is an ordinary call, so caller-saved registers are the caller's
//! problem and no floating-point state is preserved.
//!
//! On real hardware this is a handful of `sd`/`ld` instructions in `swtch.S`.
//! Without an architecture to hold registers for, the host build realizes
//! the same handoff with a park/unpark rendezvous: the thread that "calls"
//! `swtch` blocks on its own `Context`, and the thread owning the target
//! `Context` wakes up. Exactly one side is ever runnable at a time, which is
//! the only property callers may rely on.

use std::sync::{Condvar, Mutex};

/// Saved callee-saved registers, kept for fidelity with the spec's
/// description of what a real `swtch` persists. The host build does not
/// read or write these fields itself; a bare-metal backend would.
#[derive(Copy, Clone, Default)]
#[repr(C)]
pub struct SavedRegisters {
    pub ra: usize,
    pub sp: usize,
    pub s0: usize,
    pub s1: usize,
    pub s2: usize,
    pub s3: usize,
    pub s4: usize,
    pub s5: usize,
    pub s6: usize,
    pub s7: usize,
    pub s8: usize,
    pub s9: usize,
    pub s10: usize,
    pub s11: usize,
}

/// A kernel thread's resumption point: on real hardware, a stack pointer and
/// saved registers; here, a park/unpark cell plus the CPU index the
/// scheduler most recently resumed it on (read back by `mycpu()`).
pub struct Context {
    pub regs: SavedRegisters,
    runnable: Mutex<bool>,
    cv: Condvar,
    cpu_id: Mutex<usize>,
}

impl Context {
    pub const fn new() -> Self {
        Self {
            regs: SavedRegisters {
                ra: 0,
                sp: 0,
                s0: 0,
                s1: 0,
                s2: 0,
                s3: 0,
                s4: 0,
                s5: 0,
                s6: 0,
                s7: 0,
                s8: 0,
                s9: 0,
                s10: 0,
                s11: 0,
            },
            runnable: Mutex::new(false),
            cv: Condvar::new(),
            cpu_id: Mutex::new(0),
        }
    }

    /// Blocks the calling thread until another thread calls `unpark` on this
    /// same `Context`. This is the "save into `*old`, return later" half of
    /// `swtch`.
    fn park(&self) {
        let mut runnable = self.runnable.lock().unwrap();
        while !*runnable {
            runnable = self.cv.wait(runnable).unwrap();
        }
        *runnable = false;
    }

    /// Wakes the thread parked on this `Context`. This is the "load from
    /// `*new`" half of `swtch`.
    fn unpark(&self, on_cpu: usize) {
        *self.cpu_id.lock().unwrap() = on_cpu;
        let mut runnable = self.runnable.lock().unwrap();
        *runnable = true;
        self.cv.notify_one();
    }

    /// The CPU index the scheduler most recently resumed this context on.
    pub fn last_cpu(&self) -> usize {
        *self.cpu_id.lock().unwrap()
    }

    /// Blocks until some CPU's `scheduler()` first `swtch`es into this
    /// context, then binds the calling thread's CPU identity the same way
    /// `swtch` itself does on every later resume.
    pub(crate) fn wait_for_resume(&self) {
        self.park();
        crate::cpu::bind_current_cpu(self.last_cpu());
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// Switches from the calling kernel thread's context to `new`'s, resuming
/// whatever previously called `swtch(new, ...)` and parked.
///
/// Precondition (unchecked here, enforced by callers per the spec):
/// interrupts disabled and exactly one spinlock held across the call.
pub fn swtch(old: &Context, new: &Context) {
    new.unpark(crate::cpu::cpuid());
    old.park();
    // We have been resumed, possibly on a different CPU than before
    // (§5: "any idle CPU picks any runnable process").
    crate::cpu::bind_current_cpu(old.last_cpu());
}
