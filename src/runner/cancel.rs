//! Interrupt handling: SIGTERM/SIGINT cancel the in-flight fleet run.
//!
//! Uses the `signal-hook` crate for safe signal registration. Command loops
//! poll the [`CancelToken`] between `try_wait` calls rather than blocking on
//! signals, so an interrupt kills every in-flight device command promptly.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared cancellation flag. Cloning shares the underlying flag.
///
/// All accesses use `Ordering::Relaxed`; runners poll it every iteration and
/// no other memory is published through it.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// A token that only cancels when asked to programmatically.
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that is also tripped by SIGTERM/SIGINT.
    ///
    /// Registration is best-effort; failures are reported on stderr but not fatal.
    #[cfg(feature = "signals")]
    pub fn with_signal_hooks() -> Self {
        use signal_hook::consts::{SIGINT, SIGTERM};

        let token = Self::new();
        if let Err(e) = signal_hook::flag::register(SIGTERM, Arc::clone(&token.flag)) {
            eprintln!("[DVH-SIGNAL] failed to register SIGTERM: {e}");
        }
        if let Err(e) = signal_hook::flag::register(SIGINT, Arc::clone(&token.flag)) {
            eprintln!("[DVH-SIGNAL] failed to register SIGINT: {e}");
        }
        token
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_flag() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[cfg(feature = "signals")]
    #[test]
    fn signal_token_starts_uncancelled() {
        let token = CancelToken::with_signal_hooks();
        assert!(!token.is_cancelled());
    }
}
