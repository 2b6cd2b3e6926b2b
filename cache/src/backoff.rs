use std::time::Duration;

use rand::Rng;

/// Truncated exponential backoff with ±10% jitter for watch retries.
pub(crate) struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub(crate) fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            current: base,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.current = self.base;
    }

    pub(crate) fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        jitter(delay)
    }
}

fn jitter(delay: Duration) -> Duration {
    let spread = delay.as_millis() as i64 / 10;
    if spread == 0 {
        return delay;
    }
    let offset = rand::rng().random_range(-spread..=spread);
    if offset < 0 {
        delay - Duration::from_millis(offset.unsigned_abs())
    } else {
        delay + Duration::from_millis(offset as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_max() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(4));
        let first = backoff.next();
        assert!(first >= Duration::from_millis(900) && first <= Duration::from_millis(1100));
        backoff.next();
        backoff.next();
        let capped = backoff.next();
        assert!(capped <= Duration::from_millis(4400));
        backoff.reset();
        let reset = backoff.next();
        assert!(reset <= Duration::from_millis(1100));
    }
}
