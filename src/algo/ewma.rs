use serde::{Deserialize, Serialize};

/// Exponentially weighted mean and variance.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Ewma {
    alpha: f64,
    mean: f64,
    variance: f64,
    initialized: bool,
}

impl Ewma {
    /// Smoothing expressed as a center of mass: `alpha = 1 / (1 + com)`.
    pub fn with_com(com: f64) -> Self {
        Self {
            alpha: 1.0 / (1.0 + com.max(0.0)),
            mean: 0.0,
            variance: 0.0,
            initialized: false,
        }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        if !self.initialized {
            self.mean = sample;
            self.variance = 0.0;
            self.initialized = true;
        } else {
            let diff = sample - self.mean;
            self.mean += self.alpha * diff;
            self.variance = (1.0 - self.alpha) * (self.variance + self.alpha * diff * diff);
        }
        self.mean
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn std_dev(&self) -> f64 {
        self.variance.sqrt()
    }
}
