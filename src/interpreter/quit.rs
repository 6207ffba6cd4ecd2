//! Quit request: the cancellation token checked between token dispatches.
//!
//! A stop request is only accepted while the interpreter is still listening
//! for one. Once the `ON_STOP:` section has been entered the token stops
//! listening, so later requests neither re-enter that section nor cut short
//! its timed waits.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct QuitState {
    requested: bool,
    listening: bool,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<QuitState>,
    wake: Condvar,
}

/// Shared "please stop" flag plus its "still listening" companion.
#[derive(Debug, Clone)]
pub struct QuitRequest {
    shared: Arc<Shared>,
}

impl Default for QuitRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl QuitRequest {
    /// Create a token that is listening and has no pending request.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QuitState {
                    requested: false,
                    listening: true,
                }),
                wake: Condvar::new(),
            }),
        }
    }

    /// Ask the interpreter to stop. Returns `false` if the request was
    /// ignored because the interpreter no longer listens.
    pub fn request(&self) -> bool {
        let mut state = self.shared.state.lock();
        if !state.listening {
            return false;
        }
        state.requested = true;
        self.shared.wake.notify_all();
        true
    }

    /// Whether an accepted request is pending.
    pub fn is_requested(&self) -> bool {
        let state = self.shared.state.lock();
        state.requested && state.listening
    }

    /// Whether stop requests are still accepted.
    pub fn is_listening(&self) -> bool {
        self.shared.state.lock().listening
    }

    /// Stop accepting requests and drop any pending one.
    pub fn stop_listening(&self) {
        let mut state = self.shared.state.lock();
        state.listening = false;
        state.requested = false;
    }

    /// Sleep for `duration` unless a stop request arrives first.
    ///
    /// Returns `true` if the wait was cut short by a request.
    pub fn wait_timeout(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut state = self.shared.state.lock();
        loop {
            if state.requested && state.listening {
                return true;
            }
            if self
                .shared
                .wake
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return state.requested && state.listening;
            }
        }
    }
}
