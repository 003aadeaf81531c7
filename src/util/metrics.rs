/// Exponentially smoothed value mirrored into a `metrics` gauge.
pub(crate) struct RunningAverage {
    value: f64,
    epsilon: f64,
    initialized: bool,
    inner: metrics::Gauge,
}

impl RunningAverage {
    pub fn new(epsilon: f64, inner: metrics::Gauge) -> Self {
        assert!((0.0..1.0).contains(&epsilon));
        Self {
            value: 0.0,
            epsilon,
            initialized: false,
            inner,
        }
    }

    pub fn set(&mut self, new_value: f64) {
        self.value = if self.initialized {
            (1.0 - self.epsilon) * self.value + self.epsilon * new_value
        } else {
            self.initialized = true;
            new_value
        };
        self.inner.set(self.value);
    }

    #[allow(dead_code)]
    pub fn get(&self) -> f64 {
        self.value
    }
}
