use crate::TrainingError;

/// Maps the global step to the learning rate used for that step's update.
pub trait LRScheduler: Send {
    fn learning_rate(&self, global_step: usize) -> f64;
}

/// Step-function schedule built from `(threshold, rate)` pairs.
///
/// The first rate applies from step 0 regardless of its threshold; every
/// later rate applies from its threshold onwards.
#[derive(Debug, Clone)]
pub struct PiecewiseConstant {
    boundaries: Vec<usize>,
    values: Vec<f64>,
}

impl PiecewiseConstant {
    pub fn new(schedule: &[(usize, f64)]) -> Result<Self, TrainingError> {
        if schedule.is_empty() {
            return Err(TrainingError::initialization(
                "learning-rate schedule requires at least one entry",
            ));
        }
        for pair in schedule.windows(2) {
            if pair[1].0 <= pair[0].0 {
                return Err(TrainingError::initialization(format!(
                    "schedule thresholds must be strictly increasing ({} then {})",
                    pair[0].0, pair[1].0
                )));
            }
        }
        if let Some((threshold, rate)) = schedule
            .iter()
            .find(|(_, rate)| !rate.is_finite() || *rate < 0.0)
        {
            return Err(TrainingError::initialization(format!(
                "schedule rate {} at threshold {} must be finite and >= 0",
                rate, threshold
            )));
        }

        Ok(Self {
            boundaries: schedule.iter().skip(1).map(|(step, _)| *step).collect(),
            values: schedule.iter().map(|(_, rate)| *rate).collect(),
        })
    }
}

impl LRScheduler for PiecewiseConstant {
    fn learning_rate(&self, global_step: usize) -> f64 {
        let segment = self
            .boundaries
            .partition_point(|&boundary| boundary <= global_step);
        self.values[segment]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_function_over_segments() {
        let schedule = PiecewiseConstant::new(&[(0, 0.1), (100, 0.01), (200, 0.001)]).unwrap();

        assert_eq!(schedule.learning_rate(0), 0.1);
        assert_eq!(schedule.learning_rate(99), 0.1);
        assert_eq!(schedule.learning_rate(100), 0.01);
        assert_eq!(schedule.learning_rate(199), 0.01);
        assert_eq!(schedule.learning_rate(200), 0.001);
        assert_eq!(schedule.learning_rate(1_000_000), 0.001);
    }

    #[test]
    fn first_rate_applies_before_first_threshold() {
        let schedule = PiecewiseConstant::new(&[(50, 0.2), (100, 0.02)]).unwrap();

        assert_eq!(schedule.learning_rate(0), 0.2);
        assert_eq!(schedule.learning_rate(99), 0.2);
        assert_eq!(schedule.learning_rate(100), 0.02);
    }

    #[test]
    fn single_entry_is_constant() {
        let schedule = PiecewiseConstant::new(&[(0, 0.05)]).unwrap();
        assert_eq!(schedule.learning_rate(0), 0.05);
        assert_eq!(schedule.learning_rate(12345), 0.05);
    }

    #[test]
    fn rejects_invalid_schedules() {
        assert!(PiecewiseConstant::new(&[]).is_err());
        assert!(PiecewiseConstant::new(&[(0, 0.1), (10, 0.01), (10, 0.001)]).is_err());
        assert!(PiecewiseConstant::new(&[(0, f64::NAN)]).is_err());
        assert!(PiecewiseConstant::new(&[(0, -0.1)]).is_err());
    }
}
