use quanta::Clock;

const CALIBRATION_ROUNDS: u32 = 1000;

/// Host-side interval timer on the TSC-backed `quanta` clock.
///
/// The cost of an empty start/stop pair is measured once at construction so
/// it can be subtracted from short measured intervals.
pub struct HostTimer {
    clock: Clock,
    start: u64,
    stop: u64,
    overhead_usec: f64,
}

impl HostTimer {
    pub fn new() -> Self {
        let clock = Clock::new();
        let mut total = 0.0;
        for _ in 0..CALIBRATION_ROUNDS {
            let a = clock.raw();
            let b = clock.raw();
            total += clock.delta(a, b).as_secs_f64() * 1e6;
        }
        let start = clock.raw();
        Self {
            clock,
            start,
            stop: start,
            overhead_usec: total / CALIBRATION_ROUNDS as f64,
        }
    }

    pub fn start(&mut self) {
        self.start = self.clock.raw();
    }

    pub fn end(&mut self) {
        self.stop = self.clock.raw();
    }

    /// Microseconds between the last `start` and `end`.
    pub fn period(&self) -> f64 {
        self.clock.delta(self.start, self.stop).as_secs_f64() * 1e6
    }

    pub fn period_minus_overhead(&self) -> f64 {
        (self.period() - self.overhead_usec).max(0.0)
    }

    /// Stops the timer and returns the elapsed microseconds.
    pub fn stop_and_time(&mut self) -> f64 {
        self.end();
        self.period()
    }

    pub fn overhead_usec(&self) -> f64 {
        self.overhead_usec
    }
}

impl Default for HostTimer {
    fn default() -> Self {
        Self::new()
    }
}
