//! Cooperative cancellation tokens
//!
//! A [`CancellationToken`] is a shareable one-shot flag. Holders observe it
//! by polling [`is_cancelled`](CancellationToken::is_cancelled) on the hot
//! path (a single relaxed atomic load) or by registering callbacks that run
//! synchronously on the thread that trips the token. Tokens can be linked so
//! that tripping any parent trips the child.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

type CancelCallback = Box<dyn Fn() + Send + Sync>;

struct TokenState {
    cancelled: AtomicBool,
    callbacks: Mutex<Vec<CancelCallback>>,
}

/// Shareable one-shot cancellation flag with callback support
///
/// Cloning is cheap (an `Arc` bump); all clones observe the same flag. The
/// state is released with the last holder.
#[derive(Clone)]
pub struct CancellationToken {
    state: Arc<TokenState>,
}

impl CancellationToken {
    /// Create a new, untripped token
    pub fn new() -> Self {
        Self {
            state: Arc::new(TokenState {
                cancelled: AtomicBool::new(false),
                callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Create a token that trips when any of the given parents trips
    pub fn linked(parents: &[CancellationToken]) -> Self {
        let child = Self::new();
        for parent in parents {
            let child_clone = child.clone();
            parent.register_callback(move || child_clone.cancel());
        }
        child
    }

    /// Trip the token
    ///
    /// Idempotent: callbacks run exactly once, on the first tripping thread.
    pub fn cancel(&self) {
        let was_cancelled = self.state.cancelled.swap(true, Ordering::AcqRel);
        if !was_cancelled {
            let callbacks = self.state.callbacks.lock();
            for callback in callbacks.iter() {
                callback();
            }
        }
    }

    /// Whether the token has been tripped
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    /// Register a callback invoked when the token trips
    ///
    /// If the token is already tripped the callback runs immediately on the
    /// registering thread.
    pub fn register_callback<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        if self.is_cancelled() {
            callback();
            return;
        }

        let callback = Arc::new(callback);
        {
            let mut callbacks = self.state.callbacks.lock();
            let registered = callback.clone();
            callbacks.push(Box::new(move || (*registered)()));
        }

        // The token may have tripped between the check and the push; the
        // tripping thread could have drained the list before our entry
        // landed, so fire our own callback again. Concurrent registrants
        // must each re-invoke their own closure, never another entry from
        // the shared list.
        if self.is_cancelled() {
            (*callback)();
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_token_starts_untripped() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_cancel_is_visible_to_clones() {
        let token = CancellationToken::new();
        let clone = token.clone();

        token.cancel();

        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_callbacks_fire_once() {
        let token = CancellationToken::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let fired_clone = fired.clone();
        token.register_callback(move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        token.cancel();
        token.cancel();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_late_registration_fires_immediately() {
        let token = CancellationToken::new();
        token.cancel();

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        token.register_callback(move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_linked_token_trips_with_parent() {
        let parent_a = CancellationToken::new();
        let parent_b = CancellationToken::new();
        let child = CancellationToken::linked(&[parent_a.clone(), parent_b.clone()]);

        assert!(!child.is_cancelled());

        parent_b.cancel();

        assert!(child.is_cancelled());
        assert!(!parent_a.is_cancelled());
    }

    #[test]
    fn test_concurrent_registration_racing_cancel() {
        // Registrations racing the trip must each fire their own callback
        // at least once; none may be lost to another registrant's entry.
        for _ in 0..32 {
            let token = CancellationToken::new();
            let fired: Arc<Vec<AtomicUsize>> =
                Arc::new((0..4).map(|_| AtomicUsize::new(0)).collect());

            let registrars: Vec<_> = (0..4)
                .map(|slot| {
                    let token = token.clone();
                    let fired = fired.clone();
                    std::thread::spawn(move || {
                        token.register_callback(move || {
                            fired[slot].fetch_add(1, Ordering::SeqCst);
                        });
                    })
                })
                .collect();

            let canceller = {
                let token = token.clone();
                std::thread::spawn(move || token.cancel())
            };

            for handle in registrars {
                handle.join().expect("registrar panicked");
            }
            canceller.join().expect("canceller panicked");

            // A callback caught mid-race may fire twice; it must never
            // fire zero times.
            for counter in fired.iter() {
                assert!(counter.load(Ordering::SeqCst) >= 1);
            }
        }
    }

    #[test]
    fn test_cancel_from_other_thread() {
        let token = CancellationToken::new();
        let clone = token.clone();

        let handle = std::thread::spawn(move || {
            clone.cancel();
        });
        handle.join().expect("cancelling thread panicked");

        assert!(token.is_cancelled());
    }
}
