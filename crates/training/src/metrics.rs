use std::time::{Duration, Instant};

/// Rolling wall-clock counter for the attack and update regions of a step.
///
/// Both regions accumulate into one total that drives the throughput figure;
/// when `separate` is set the per-region totals are reported as well.
#[derive(Debug, Clone, Default)]
pub struct StepTimer {
    attack: Duration,
    update: Duration,
    separate: bool,
}

impl StepTimer {
    pub fn new(separate: bool) -> Self {
        Self {
            separate,
            ..Self::default()
        }
    }

    pub fn start(&self) -> Instant {
        Instant::now()
    }

    pub fn record_attack(&mut self, started: Instant) {
        self.attack += started.elapsed();
    }

    pub fn record_update(&mut self, started: Instant) {
        self.update += started.elapsed();
    }

    pub fn combined(&self) -> Duration {
        self.attack + self.update
    }

    /// Per-region totals, only when separate reporting is enabled.
    pub fn regions(&self) -> Option<(Duration, Duration)> {
        self.separate.then_some((self.attack, self.update))
    }

    /// `examples / combined seconds`, or `None` before any time was recorded.
    pub fn examples_per_second(&self, examples: usize) -> Option<f64> {
        let seconds = self.combined().as_secs_f64();
        (seconds > 0.0).then(|| examples as f64 / seconds)
    }

    pub fn reset(&mut self) {
        self.attack = Duration::ZERO;
        self.update = Duration::ZERO;
    }

    #[cfg(test)]
    fn add(&mut self, attack: Duration, update: Duration) {
        self.attack += attack;
        self.update += update;
    }
}
