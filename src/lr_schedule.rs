use burn::{LearningRate, lr_scheduler::LrScheduler, prelude::*};

/// Exponential decay applied in discrete steps:
/// `lr = initial_lr * decay_rate ^ floor(step / decay_steps)`.
#[derive(Config, Debug)]
pub struct StaircaseDecayConfig {
    pub initial_lr: LearningRate,
    #[config(default = 30)]
    pub decay_steps: usize,
    #[config(default = 0.96)]
    pub decay_rate: f64,
}

impl StaircaseDecayConfig {
    pub fn init(&self) -> Result<StaircaseDecay, String> {
        if self.initial_lr <= 0.0 || !self.initial_lr.is_finite() {
            return Err(format!(
                "Initial learning rate must be a positive finite number, got {}",
                self.initial_lr
            ));
        }
        if self.decay_steps == 0 {
            return Err("Decay steps must be at least 1".to_string());
        }
        if self.decay_rate <= 0.0 || self.decay_rate > 1.0 {
            return Err(format!(
                "Decay rate must be in (0, 1], got {}",
                self.decay_rate
            ));
        }

        Ok(StaircaseDecay {
            initial_lr: self.initial_lr,
            decay_steps: self.decay_steps,
            decay_rate: self.decay_rate,
            step: 0,
        })
    }
}

#[derive(Clone, Debug)]
pub struct StaircaseDecay {
    initial_lr: LearningRate,
    decay_steps: usize,
    decay_rate: f64,
    step: usize,
}

impl StaircaseDecay {
    /// Learning rate in effect for the next optimizer update.
    pub fn current(&self) -> LearningRate {
        let exponent = (self.step / self.decay_steps) as i32;
        self.initial_lr * self.decay_rate.powi(exponent)
    }
}

impl LrScheduler for StaircaseDecay {
    type Record<B: Backend> = usize;

    fn step(&mut self) -> LearningRate {
        let lr = self.current();
        self.step += 1;
        lr
    }

    fn to_record<B: Backend>(&self) -> Self::Record<B> {
        self.step
    }

    fn load_record<B: Backend>(mut self, record: Self::Record<B>) -> Self {
        self.step = record;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_is_constant_within_a_stair() {
        let mut scheduler = StaircaseDecayConfig::new(0.01).init().unwrap();

        let rates: Vec<_> = (0..30).map(|_| scheduler.step()).collect();

        assert!(rates.iter().all(|lr| *lr == 0.01));
    }

    #[test]
    fn rate_drops_by_decay_rate_every_thirty_steps() {
        let mut scheduler = StaircaseDecayConfig::new(0.01).init().unwrap();

        let rates: Vec<_> = (0..91).map(|_| scheduler.step()).collect();

        assert!((rates[30] - 0.01 * 0.96).abs() < 1e-15);
        assert!((rates[59] - 0.01 * 0.96).abs() < 1e-15);
        assert!((rates[60] - 0.01 * 0.96 * 0.96).abs() < 1e-15);
        assert!((rates[90] - 0.01 * 0.96f64.powi(3)).abs() < 1e-15);
    }

    #[test]
    fn rejects_invalid_settings() {
        assert!(StaircaseDecayConfig::new(0.0).init().is_err());
        assert!(StaircaseDecayConfig::new(0.01).with_decay_steps(0).init().is_err());
        assert!(StaircaseDecayConfig::new(0.01).with_decay_rate(1.5).init().is_err());
    }
}
