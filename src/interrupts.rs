//! Stand-in for the trap layer's interrupt-enable primitives
//! (`intr_on`/`intr_off`/`intr_get`), which §1 lists as an external
//! collaborator. On real hardware these read/write the `sstatus` CSR; on the
//! host there is no interrupt controller, so each kernel thread tracks its
//! own "would an interrupt fire right now" flag.

use std::cell::Cell;

thread_local! {
    static INTERRUPTS_ENABLED: Cell<bool> = const { Cell::new(true) };
}

pub fn intr_on() {
    INTERRUPTS_ENABLED.with(|f| f.set(true));
}

pub fn intr_off() {
    INTERRUPTS_ENABLED.with(|f| f.set(false));
}

pub fn intr_get() -> bool {
    INTERRUPTS_ENABLED.with(|f| f.get())
}
