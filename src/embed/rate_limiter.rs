//! Sliding-window admission control for one credential.
//!
//! Two windows are tracked: request timestamps and `(timestamp, tokens)` pairs.
//! [`RateLimiter::acquire`] never rejects; it sleeps until admitting the request
//! would keep both windows within their limits, then records it.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

const MIN_WAIT: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
struct Windows {
    requests: VecDeque<Instant>,
    tokens: VecDeque<(Instant, u64)>,
}

impl Windows {
    fn prune(&mut self, now: Instant, window: Duration) {
        while self.requests.front().is_some_and(|t| now.duration_since(*t) >= window) {
            self.requests.pop_front();
        }
        while self.tokens.front().is_some_and(|(t, _)| now.duration_since(*t) >= window) {
            self.tokens.pop_front();
        }
    }

    fn token_sum(&self) -> u64 {
        self.tokens.iter().map(|(_, n)| n).sum()
    }
}

/// Requests and tokens currently counted in the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowUsage {
    pub requests: u32,
    pub tokens: u64,
}

pub struct RateLimiter {
    rpm: u32,
    tpm: u64,
    window: Duration,
    windows: Mutex<Windows>,
}

impl RateLimiter {
    /// A limit of 0 disables that constraint.
    pub fn new(rpm: u32, tpm: u64, window: Duration) -> Self {
        Self {
            rpm,
            tpm,
            window,
            windows: Mutex::new(Windows::default()),
        }
    }

    pub fn rpm(&self) -> u32 {
        self.rpm
    }

    pub fn tpm(&self) -> u64 {
        self.tpm
    }

    /// Wait until `tokens` can be admitted, then record the request.
    /// Returns the total time spent waiting.
    pub async fn acquire(&self, tokens: u64) -> Duration {
        let started = Instant::now();
        loop {
            let wait = {
                let mut windows = self.windows.lock().await;
                let now = Instant::now();
                windows.prune(now, self.window);
                match self.required_wait(&windows, now, tokens) {
                    None => {
                        windows.requests.push_back(now);
                        windows.tokens.push_back((now, tokens));
                        return now.duration_since(started);
                    }
                    Some(wait) => wait,
                }
            };
            tracing::info!(
                wait_ms = wait.as_millis() as u64,
                tokens,
                "rate limit reached; waiting for window"
            );
            tokio::time::sleep(wait).await;
        }
    }

    pub async fn usage(&self) -> WindowUsage {
        let mut windows = self.windows.lock().await;
        windows.prune(Instant::now(), self.window);
        WindowUsage {
            requests: windows.requests.len() as u32,
            tokens: windows.token_sum(),
        }
    }

    /// `None` when the request fits now; otherwise how long until it might.
    fn required_wait(&self, windows: &Windows, now: Instant, tokens: u64) -> Option<Duration> {
        let req_full = self.rpm > 0 && windows.requests.len() >= self.rpm as usize;
        let used = windows.token_sum();
        // An oversized request still runs once the window is empty.
        let tok_full = self.tpm > 0 && !windows.tokens.is_empty() && used + tokens > self.tpm;
        if !req_full && !tok_full {
            return None;
        }

        let mut wait_req = Duration::ZERO;
        if req_full {
            let must_expire = windows.requests.len() + 1 - self.rpm as usize;
            if let Some(t) = windows.requests.get(must_expire - 1) {
                wait_req = (*t + self.window).saturating_duration_since(now);
            }
        }

        let mut wait_tok = Duration::ZERO;
        if tok_full {
            let mut freed = 0u64;
            for (t, n) in &windows.tokens {
                freed += n;
                wait_tok = (*t + self.window).saturating_duration_since(now);
                if used - freed + tokens <= self.tpm {
                    break;
                }
            }
        }

        Some(wait_req.max(wait_tok).max(MIN_WAIT))
    }
}
