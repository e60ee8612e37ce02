//! Exponential backoff used while waiting for pod log endpoints.

use rand::Rng;
use std::time::Duration;

/// Retry schedule: `steps` attempts in total, separated by delays that start
/// at `initial`, grow by `factor` up to `cap`, and are stretched by up to
/// `jitter` of their length.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub factor: f64,
    pub jitter: f64,
    pub steps: u32,
    pub cap: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            factor: 2.0,
            jitter: 0.25,
            steps: 10,
            cap: Duration::from_secs(120),
        }
    }
}

impl Backoff {
    /// Delays to sleep between attempts. Yields `steps - 1` values.
    pub fn delays(&self) -> Delays {
        Delays {
            backoff: *self,
            step: 0,
        }
    }

    fn base_delay(&self, step: u32) -> Duration {
        let scaled = self.initial.as_secs_f64() * self.factor.powi(step as i32);
        if scaled >= self.cap.as_secs_f64() {
            self.cap
        } else {
            Duration::from_secs_f64(scaled)
        }
    }
}

#[derive(Debug, Clone)]
pub struct Delays {
    backoff: Backoff,
    step: u32,
}

impl Iterator for Delays {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.step + 1 >= self.backoff.steps {
            return None;
        }

        let base = self.backoff.base_delay(self.step);
        self.step += 1;

        if self.backoff.jitter <= 0.0 {
            return Some(base);
        }
        let stretch = rand::thread_rng().gen_range(0.0..self.backoff.jitter);
        Some(base.mul_f64(1.0 + stretch))
    }
}
