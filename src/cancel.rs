//! Cancellation tokens and the single-slot cancel watcher.
//!
//! A [`CancelToken`] is a cloneable handle that can be fired once, either
//! manually or by an attached deadline. The [`CancelWatcher`] binds one
//! in-flight operation to one token: it installs a hook that runs exactly
//! once if the token fires while watched, and a second hook at unwatch time
//! iff the first already ran. The connection uses this to abort blocking
//! socket calls (shutdown + expired deadline) and to clean up afterwards.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Why a token fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelCause {
    /// [`CancelToken::cancel`] was called.
    Canceled,
    /// The token's deadline passed.
    DeadlineExceeded,
}

impl std::fmt::Display for CancelCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelCause::Canceled => f.write_str("canceled"),
            CancelCause::DeadlineExceeded => f.write_str("deadline exceeded"),
        }
    }
}

type Hook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct TokenState {
    fired: Option<CancelCause>,
    hook: Option<Hook>,
}

struct Shared {
    deadline: Option<Instant>,
    state: Mutex<TokenState>,
}

/// Cloneable cancellation handle observed by connection operations.
#[derive(Clone)]
pub struct CancelToken {
    shared: Arc<Shared>,
}

impl CancelToken {
    fn with_deadline_opt(deadline: Option<Instant>) -> Self {
        Self {
            shared: Arc::new(Shared {
                deadline,
                state: Mutex::new(TokenState::default()),
            }),
        }
    }

    /// A token that only fires on [`cancel`](Self::cancel).
    pub fn new() -> Self {
        Self::with_deadline_opt(None)
    }

    /// A token that never fires. Watching it is a no-op.
    pub fn never() -> Self {
        Self::with_deadline_opt(None)
    }

    /// A token that fires `timeout` from now.
    pub fn with_deadline(timeout: Duration) -> Self {
        Self::with_deadline_opt(Some(Instant::now() + timeout))
    }

    /// A token that fires at `at`.
    pub fn with_deadline_at(at: Instant) -> Self {
        Self::with_deadline_opt(Some(at))
    }

    /// Fire the token. The first call wins; later calls are no-ops.
    /// The watcher hook, if installed, runs on the calling thread.
    pub fn cancel(&self) {
        let hook = {
            let mut state = self.shared.state.lock().expect("cancel token poisoned");
            if state.fired.is_some() {
                return;
            }
            state.fired = Some(CancelCause::Canceled);
            state.hook.take()
        };
        if let Some(hook) = hook {
            hook();
        }
    }

    /// The deadline, if this token has one.
    pub fn deadline(&self) -> Option<Instant> {
        self.shared.deadline
    }

    /// The cause if the token has fired (explicitly or by deadline).
    pub fn cause(&self) -> Option<CancelCause> {
        let state = self.shared.state.lock().expect("cancel token poisoned");
        if let Some(cause) = state.fired {
            return Some(cause);
        }
        drop(state);
        match self.shared.deadline {
            Some(at) if Instant::now() >= at => Some(CancelCause::DeadlineExceeded),
            _ => None,
        }
    }

    /// Whether the token has fired.
    pub fn is_done(&self) -> bool {
        self.cause().is_some()
    }

    /// Install the watch hook. If the token already fired, the hook runs
    /// immediately and is not stored. Returns whether it ran.
    fn install(&self, hook: Hook) -> bool {
        let mut state = self.shared.state.lock().expect("cancel token poisoned");
        if state.fired.is_some() {
            drop(state);
            hook();
            true
        } else {
            state.hook = Some(hook);
            false
        }
    }

    /// Remove any installed hook; returns whether the token has fired.
    fn clear(&self) -> bool {
        let mut state = self.shared.state.lock().expect("cancel token poisoned");
        state.hook = None;
        state.fired.is_some()
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("deadline", &self.shared.deadline)
            .field("cause", &self.cause())
            .finish()
    }
}

struct Armed {
    token: CancelToken,
    fired_at_watch: bool,
    after: Option<Hook>,
}

/// Single-slot watcher binding one operation to one token at a time.
///
/// Reusable: watch → unwatch → watch. Overlapping watches are a programmer
/// error and panic.
#[derive(Default)]
pub struct CancelWatcher {
    armed: Option<Armed>,
}

impl CancelWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start watching `token`. `on_cancel` runs exactly once if the token
    /// fires (or already fired) before [`unwatch`](Self::unwatch);
    /// `on_unwatch_after_cancel` runs at unwatch time iff `on_cancel` ran.
    ///
    /// # Panics
    ///
    /// Panics if a watch is already active.
    pub fn watch<C, U>(&mut self, token: &CancelToken, on_cancel: C, on_unwatch_after_cancel: U)
    where
        C: FnOnce() + Send + 'static,
        U: FnOnce() + Send + 'static,
    {
        assert!(
            self.armed.is_none(),
            "CancelWatcher::watch called while already watching"
        );
        let fired_at_watch = token.install(Box::new(on_cancel));
        self.armed = Some(Armed {
            token: token.clone(),
            fired_at_watch,
            after: Some(Box::new(on_unwatch_after_cancel)),
        });
    }

    /// Stop watching. Returns whether `on_cancel` ran during the watch.
    /// Calling without an active watch is a no-op returning false.
    pub fn unwatch(&mut self) -> bool {
        let Some(mut armed) = self.armed.take() else {
            return false;
        };
        let fired = armed.token.clear() || armed.fired_at_watch;
        if fired && let Some(after) = armed.after.take() {
            after();
        }
        fired
    }

    /// Whether a watch is active.
    pub fn is_watching(&self) -> bool {
        self.armed.is_some()
    }
}
