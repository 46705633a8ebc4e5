use std::collections::VecDeque;

/// Moving-average low-pass for barometric altitude
///
/// Newest sample sits at the front; once the window is full the oldest falls
/// off the back. The output is the plain mean of whatever the window holds.
pub struct RollingAverage {
    window: VecDeque<f64>,
    window_size: usize,
    sum: f64,
    pushes_since_resum: usize,
}

impl RollingAverage {
    /// Create a new average over at most `window_size` samples (at least 1)
    pub fn new(window_size: usize) -> Self {
        let window_size = window_size.max(1);
        RollingAverage {
            window: VecDeque::with_capacity(window_size),
            window_size,
            sum: 0.0,
            pushes_since_resum: 0,
        }
    }

    /// Insert a sample at the front and return the new mean
    pub fn push(&mut self, value: f64) -> f64 {
        self.window.push_front(value);
        self.sum += value;

        while self.window.len() > self.window_size {
            if let Some(old) = self.window.pop_back() {
                self.sum -= old;
            }
        }

        // Re-sum once per window cycle so rounding error cannot accumulate forever
        self.pushes_since_resum += 1;
        if self.pushes_since_resum >= self.window_size {
            self.sum = self.window.iter().sum();
            self.pushes_since_resum = 0;
        }

        self.sum / self.window.len() as f64
    }

    /// Current mean, `None` until the first sample
    pub fn mean(&self) -> Option<f64> {
        if self.window.is_empty() {
            None
        } else {
            Some(self.sum / self.window.len() as f64)
        }
    }

    pub fn newest(&self) -> Option<f64> {
        self.window.front().copied()
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.window_size
    }
}

/// Population standard deviation, `None` for an empty slice
pub fn population_std_dev(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    Some(var.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_value() {
        let mut avg = RollingAverage::new(100);
        assert_eq!(avg.mean(), None);
        let result = avg.push(5.0);
        assert_eq!(result, 5.0);
    }

    #[test]
    fn test_partial_window_uses_held_samples() {
        let mut avg = RollingAverage::new(100);
        avg.push(2.0);
        let result = avg.push(4.0);
        assert!((result - 3.0).abs() < 1e-12);
        assert_eq!(avg.len(), 2);
    }

    #[test]
    fn test_window_wrapping() {
        let mut avg = RollingAverage::new(2);
        avg.push(1.0);
        avg.push(2.0);
        let result = avg.push(3.0); // drops 1.0, keeps [3.0, 2.0]
        assert_eq!(avg.len(), 2);
        assert_eq!(avg.newest(), Some(3.0));
        assert!((result - 2.5).abs() < 1e-12);
    }

    #[test]
    fn test_long_run_matches_exact_mean() {
        let mut avg = RollingAverage::new(100);
        let mut last = 0.0;
        for i in 0..10_000 {
            last = avg.push(1000.0 + (i as f64 * 0.37).sin());
        }
        let exact: f64 = (9_900..10_000)
            .map(|i| 1000.0 + (i as f64 * 0.37).sin())
            .sum::<f64>()
            / 100.0;
        assert!((last - exact).abs() < 1e-9);
    }

    #[test]
    fn test_std_dev() {
        assert_eq!(population_std_dev(&[]), None);
        assert_eq!(population_std_dev(&[3.0, 3.0]), Some(0.0));
        let sd = population_std_dev(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]).unwrap();
        assert!((sd - 2.0).abs() < 1e-12);
    }
}
