use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

struct Window {
    started: Instant,
    remaining: u32,
}

pub struct TokenBucket {
    capacity: u32,
    window: Duration,
    state: Mutex<Window>,
}

impl TokenBucket {
    /// `capacity` tokens every `window`. A zero capacity is raised to one.
    pub fn new(capacity: u32, window: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            window,
            state: Mutex::new(Window {
                started: Instant::now(),
                remaining: capacity,
            }),
        }
    }

    pub fn per_second(capacity: u32) -> Self {
        Self::new(capacity, Duration::from_secs(1))
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Take a token, or report when the current window ends.
    fn take(&self) -> Result<(), Instant> {
        let mut state = self.state.lock();
        let now = Instant::now();
        if now.duration_since(state.started) >= self.window {
            state.started = now;
            state.remaining = self.capacity;
        }
        if state.remaining > 0 {
            state.remaining -= 1;
            Ok(())
        } else {
            Err(state.started + self.window)
        }
    }

    pub fn try_acquire(&self) -> bool {
        self.take().is_ok()
    }

    /// Wait until a token is available. Cancel-safe.
    pub async fn acquire(&self) {
        while let Err(next_window) = self.take() {
            tokio::time::sleep_until(next_window).await;
        }
    }
}
