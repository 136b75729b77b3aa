//! Epoch-granular learning-rate schedule.

use serde::{Deserialize, Serialize};

/// Step decay: the learning rate is multiplied by `gamma` every `step_size`
/// epochs. A `step_size` of 0 keeps the rate constant.
///
/// `last_epoch` counts completed `step()` calls and is the only mutable
/// state, so serializing the struct is enough to resume the schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepLr {
    pub base_lr: f64,
    pub step_size: usize,
    pub gamma: f64,
    pub last_epoch: usize,
}

impl StepLr {
    pub fn new(base_lr: f64, step_size: usize, gamma: f64) -> Self {
        Self {
            base_lr,
            step_size,
            gamma,
            last_epoch: 0,
        }
    }

    /// Learning rate for the next epoch.
    pub fn lr(&self) -> f64 {
        if self.step_size == 0 {
            return self.base_lr;
        }
        let decays = (self.last_epoch / self.step_size) as i32;
        self.base_lr * self.gamma.powi(decays)
    }

    /// Advance by one epoch.
    pub fn step(&mut self) {
        self.last_epoch += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decay_every_epoch() {
        let mut sched = StepLr::new(1e-6, 1, 0.85);
        assert!((sched.lr() - 1e-6).abs() < 1e-18);
        sched.step();
        assert!((sched.lr() - 0.85e-6).abs() < 1e-18);
        sched.step();
        assert!((sched.lr() - 0.85 * 0.85e-6).abs() < 1e-18);
    }

    #[test]
    fn test_decay_every_third_epoch() {
        let mut sched = StepLr::new(1.0, 3, 0.5);
        let lrs: Vec<f64> = (0..7)
            .map(|_| {
                let lr = sched.lr();
                sched.step();
                lr
            })
            .collect();
        assert_eq!(lrs, vec![1.0, 1.0, 1.0, 0.5, 0.5, 0.5, 0.25]);
    }

    #[test]
    fn test_zero_step_size_is_constant() {
        let mut sched = StepLr::new(0.1, 0, 0.5);
        for _ in 0..5 {
            sched.step();
        }
        assert_eq!(sched.lr(), 0.1);
    }

    #[test]
    fn test_state_survives_serde() {
        let mut sched = StepLr::new(1e-3, 1, 0.9);
        sched.step();
        sched.step();
        let json = serde_json::to_string(&sched).unwrap();
        let restored: StepLr = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, sched);
        assert_eq!(restored.lr(), sched.lr());
    }
}
