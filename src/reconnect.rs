/// file: src/reconnect.rs
/// description: exponential backoff with jitter, retry ceilings and close-code classification
use crate::config::ReconnectConfig;
use std::time::Duration;
use tracing::debug;

/// Source of jitter samples in `[-1.0, 1.0]`.
pub trait JitterSource: Send {
    fn sample(&mut self) -> f64;
}

/// Default jitter backed by `fastrand`.
pub struct RandomJitter(fastrand::Rng);

impl RandomJitter {
    pub fn new() -> Self {
        Self(fastrand::Rng::new())
    }

    pub fn with_seed(seed: u64) -> Self {
        Self(fastrand::Rng::with_seed(seed))
    }
}

impl Default for RandomJitter {
    fn default() -> Self {
        Self::new()
    }
}

impl JitterSource for RandomJitter {
    fn sample(&mut self) -> f64 {
        self.0.f64() * 2.0 - 1.0
    }
}

/// Always returns the same sample; `FixedJitter(0.0)` disables jitter.
pub struct FixedJitter(pub f64);

impl JitterSource for FixedJitter {
    fn sample(&mut self) -> f64 {
        self.0.clamp(-1.0, 1.0)
    }
}

/// How a dropped connection should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDisposition {
    /// Network blip, server restart, heartbeat timeout.
    Retryable,
    /// The server refused us for a reason that may persist; bounded retries.
    ServerRejected,
    /// Credentials rejected; never retried.
    Terminal,
}

impl CloseDisposition {
    /// Classifies a WebSocket close code.
    pub fn from_close_code(code: u16) -> Self {
        match code {
            1008 | 4401 | 4403 => CloseDisposition::Terminal,
            1000 | 1001 | 1005 | 1006 | 1011 | 1012 | 1013 | 1014 => CloseDisposition::Retryable,
            4000..=4999 => CloseDisposition::ServerRejected,
            _ => CloseDisposition::Retryable,
        }
    }

    /// Classifies an HTTP status returned instead of a protocol upgrade.
    pub fn from_http_status(status: u16) -> Self {
        match status {
            401 | 403 => CloseDisposition::Terminal,
            429 | 502 | 503 | 504 => CloseDisposition::Retryable,
            400..=599 => CloseDisposition::ServerRejected,
            _ => CloseDisposition::Retryable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    Retry { attempt: u32, delay: Duration },
    GiveUp { attempts: u32 },
}

/// Snapshot of the policy's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReconnectState {
    pub attempt: u32,
    pub next_delay: Duration,
    pub ceiling: Option<u32>,
    pub server_rejections: u32,
}

pub struct ReconnectPolicy {
    config: ReconnectConfig,
    jitter: Box<dyn JitterSource>,
    state: ReconnectState,
}

impl ReconnectPolicy {
    pub fn new(config: ReconnectConfig) -> Self {
        Self::with_jitter(config, Box::new(RandomJitter::new()))
    }

    pub fn with_jitter(config: ReconnectConfig, jitter: Box<dyn JitterSource>) -> Self {
        let state = ReconnectState {
            ceiling: config.max_attempts,
            ..ReconnectState::default()
        };
        Self {
            config,
            jitter,
            state,
        }
    }

    pub fn state(&self) -> ReconnectState {
        self.state
    }

    /// Called on a successful open.
    pub fn reset(&mut self) {
        self.state = ReconnectState {
            ceiling: self.config.max_attempts,
            ..ReconnectState::default()
        };
    }

    /// `min(base * 2^attempt, cap)` before jitter is applied.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.config
            .base_delay
            .checked_mul(factor)
            .unwrap_or(self.config.max_delay)
            .min(self.config.max_delay)
    }

    pub fn delay_for(&mut self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let fraction = self.config.jitter.clamp(0.0, 1.0);
        if fraction == 0.0 {
            return base;
        }
        let scale = (1.0 + fraction * self.jitter.sample()).max(0.0);
        let nanos = (base.as_nanos() as f64 * scale).round();
        Duration::from_nanos(nanos as u64)
    }

    /// Records a failed connection or a drop and decides what happens next.
    pub fn on_failure(&mut self, disposition: CloseDisposition) -> ReconnectDecision {
        let attempt = self.state.attempt;
        self.state.attempt = attempt.saturating_add(1);

        let give_up = match disposition {
            CloseDisposition::Terminal => true,
            CloseDisposition::ServerRejected => {
                self.state.server_rejections += 1;
                self.state.server_rejections > self.config.max_server_rejections
            }
            CloseDisposition::Retryable => self
                .config
                .max_attempts
                .is_some_and(|max| self.state.attempt > max),
        };

        if give_up {
            debug!(
                attempts = self.state.attempt,
                ?disposition,
                "Reconnection abandoned"
            );
            return ReconnectDecision::GiveUp {
                attempts: self.state.attempt,
            };
        }

        let delay = self.delay_for(attempt);
        self.state.next_delay = delay;
        ReconnectDecision::Retry {
            attempt: self.state.attempt,
            delay,
        }
    }
}
