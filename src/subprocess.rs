//! A `Child` handle that is always reaped on every exit path.
//!
//! Spec.md §9 ("Subprocess management"): every capture/helper subprocess is
//! owned by exactly one worker, and its handle must be released on worker
//! exit regardless of which branch the worker exits through. `ChildGuard`
//! replaces the source's explicit `pclose()` calls scattered across every
//! `goto error` site with a single `Drop` impl.

use std::process::Child;

pub struct ChildGuard {
    child: Child,
}

impl ChildGuard {
    #[must_use]
    pub fn new(child: Child) -> Self {
        Self { child }
    }

    pub fn inner_mut(&mut self) -> &mut Child {
        &mut self.child
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        let _ = self.child.wait();
    }
}
