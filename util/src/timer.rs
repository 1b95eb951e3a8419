use std::time::{Duration, Instant};

/// Keeps track of how long some operation took.
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Create a new `Timer` started now.
    pub fn now() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Restart the timer.
    pub fn reset(&mut self) {
        self.start = Instant::now();
    }

    /// Time elapsed since the timer was created or last reset.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    #[test]
    fn test_reset_restarts_clock() {
        let mut timer = Timer::now();
        std::thread::sleep(Duration::from_millis(5));
        assert!(timer.elapsed() >= Duration::from_millis(5));
        timer.reset();
        assert!(timer.elapsed() < Duration::from_secs(5));
    }
}
