//! Shared boot/serialization harness for integration tests.
//!
//! The kernel is one process-wide singleton (`rv6_core::procinit`'s
//! `OnceLock`), matching the teacher's own single ambient process table —
//! there is no way to give each `#[test]` its own isolated instance. Every
//! test in a binary therefore boots it exactly once and runs its body while
//! holding `lock()`, which serializes tests against each other instead of
//! relying on `cargo test`'s default thread-per-test parallelism.

use std::sync::{Mutex, MutexGuard, Once, OnceLock};
use std::time::{Duration, Instant};

use rv6_core::ProcSnapshot;

static BOOT: Once = Once::new();
static SERIAL: Mutex<()> = Mutex::new(());
static INITIAL_SNAPSHOT: OnceLock<ProcSnapshot> = OnceLock::new();
static INITIAL_POOL_LEN: OnceLock<usize> = OnceLock::new();

fn boot() {
    BOOT.call_once(|| {
        rv6_core::procinit();
        rv6_core::userinit();

        // Captured before any scheduler runs, so this is the one moment the
        // first scenario's "exactly one RUNNABLE slot, pid 1" claim holds as
        // a stable fact rather than a flicker between RUNNABLE and RUNNING.
        let snap = rv6_core::snapshot(1).expect("init process must exist right after userinit");
        let pool = rv6_core::snapshot_all().len();
        INITIAL_SNAPSHOT.set(snap).ok();
        INITIAL_POOL_LEN.set(pool).ok();

        rv6_core::start_schedulers(2);
    });
}

/// Boots the kernel (once) and serializes the calling test against every
/// other test in this binary.
pub fn lock() -> MutexGuard<'static, ()> {
    boot();
    match SERIAL.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// The init process's snapshot as it was the instant after `userinit`
/// returned, before any scheduler had a chance to run it.
pub fn initial_snapshot() -> ProcSnapshot {
    boot();
    INITIAL_SNAPSHOT.get().cloned().expect("captured during boot")
}

/// How many slots were in use (just init) right after boot, before this
/// binary's tests started allocating their own processes.
pub fn initial_pool_len() -> usize {
    boot();
    *INITIAL_POOL_LEN.get().expect("captured during boot")
}

/// Polls `pred` until it returns `true` or `timeout` elapses, returning
/// whichever happened. Used instead of a fixed sleep since process worker
/// threads only make progress when their CPU's scheduler happens to pick
/// them up.
pub fn wait_until(mut pred: impl FnMut() -> bool, timeout: Duration) -> bool {
    let start = Instant::now();
    loop {
        if pred() {
            return true;
        }
        if start.elapsed() >= timeout {
            return pred();
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}

/// A process body that waits to be `kill`ed, then exits. Used for test
/// processes that exist only to occupy a slot for a while (filling the
/// process table, or being the target of a `kill`-wakes-sleeper check).
pub fn wait_until_killed_then_exit() {
    loop {
        if rv6_core::myproc().lock().info().killed {
            break;
        }
        rv6_core::proc_yield();
    }
    rv6_core::exit(0);
}

/// Default timeout for waiting on a spawned test process to report back.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);
