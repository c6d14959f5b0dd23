//! Mutex access that survives poisoning.
//!
//! Subscriber handlers and scripted agents run user code while the client is
//! live; a panic there must not wedge every later request behind a poisoned
//! lock. State guarded this way is only ever mutated in single steps that
//! cannot leave it half-written.

use std::panic::Location;
use std::sync::{Mutex, MutexGuard};

pub trait MutexExt<T> {
    /// Lock, recovering the guard (and logging where) if a previous holder
    /// panicked. `context` names the caller in the log record.
    fn lock_or_recover(&self, context: &'static str) -> MutexGuard<'_, T>;
}

impl<T> MutexExt<T> for Mutex<T> {
    #[track_caller]
    fn lock_or_recover(&self, context: &'static str) -> MutexGuard<'_, T> {
        match self.lock() {
            Ok(guard) => guard,
            Err(err) => {
                let loc = Location::caller();
                tracing::error!(
                    target: "tether.wire",
                    context,
                    file = loc.file(),
                    line = loc.line(),
                    "mutex poisoned; continuing with recovered guard"
                );
                err.into_inner()
            }
        }
    }
}
