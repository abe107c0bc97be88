use std::collections::{HashMap, VecDeque};

/// Wall-clock time of one launch, in milliseconds.
pub const FRAME_TIME_KEY: &str = "frame_time";
/// Frame time divided by the samples it took, in milliseconds.
pub const SAMPLE_TIME_KEY: &str = "sample_time";

pub const DEFAULT_WINDOW_SIZE: usize = 100;

#[derive(Clone, Debug, Default)]
struct Series {
    values: VecDeque<f64>,
    sum: f64,
    sum_of_squares: f64,
}

impl Series {
    fn push(&mut self, value: f64, window_size: usize) {
        self.values.push_back(value);
        self.sum += value;
        self.sum_of_squares += value * value;
        self.truncate(window_size);
    }

    fn truncate(&mut self, window_size: usize) {
        while self.values.len() > window_size {
            if let Some(old) = self.values.pop_front() {
                self.sum -= old;
                self.sum_of_squares -= old * old;
            }
        }
    }
}

/// Rolling statistics over the last `window_size` values of named series.
#[derive(Clone, Debug)]
pub struct PerformanceMetrics {
    window_size: usize,
    series: HashMap<String, Series>,
}

impl Default for PerformanceMetrics {
    fn default() -> Self {
        PerformanceMetrics::new(DEFAULT_WINDOW_SIZE)
    }
}

impl PerformanceMetrics {
    pub fn new(window_size: usize) -> PerformanceMetrics {
        PerformanceMetrics {
            window_size: window_size.max(1),
            series: HashMap::new(),
        }
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Shrinking the window drops the oldest values.
    pub fn resize_window(&mut self, window_size: usize) {
        self.window_size = window_size.max(1);
        for series in self.series.values_mut() {
            series.truncate(self.window_size);
        }
    }

    pub fn add_value(&mut self, key: &str, value: f64) {
        let window_size = self.window_size;
        self.series
            .entry(key.to_owned())
            .or_default()
            .push(value, window_size);
    }

    pub fn values(&self, key: &str) -> impl Iterator<Item = f64> + '_ {
        self.series
            .get(key)
            .into_iter()
            .flat_map(|s| s.values.iter().copied())
    }

    pub fn current(&self, key: &str) -> Option<f64> {
        self.series.get(key)?.values.back().copied()
    }

    pub fn average(&self, key: &str) -> Option<f64> {
        let series = self.series.get(key)?;
        let n = series.values.len();
        (n > 0).then(|| series.sum / n as f64)
    }

    pub fn variance(&self, key: &str) -> Option<f64> {
        let series = self.series.get(key)?;
        let n = series.values.len() as f64;
        let mean = self.average(key)?;
        Some((series.sum_of_squares / n - mean * mean).max(0.0))
    }

    pub fn standard_deviation(&self, key: &str) -> Option<f64> {
        self.variance(key).map(f64::sqrt)
    }

    pub fn min(&self, key: &str) -> Option<f64> {
        self.values(key).reduce(f64::min)
    }

    pub fn max(&self, key: &str) -> Option<f64> {
        self.values(key).reduce(f64::max)
    }

    pub fn clear(&mut self) {
        self.series.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statistics_over_window() {
        let mut metrics = PerformanceMetrics::new(3);
        for v in [10.0, 1.0, 2.0, 3.0] {
            metrics.add_value(FRAME_TIME_KEY, v);
        }
        // 10.0 fell out of the window
        assert_eq!(metrics.average(FRAME_TIME_KEY), Some(2.0));
        assert_eq!(metrics.min(FRAME_TIME_KEY), Some(1.0));
        assert_eq!(metrics.max(FRAME_TIME_KEY), Some(3.0));
        assert_eq!(metrics.current(FRAME_TIME_KEY), Some(3.0));
        let variance = metrics.variance(FRAME_TIME_KEY).unwrap();
        assert!((variance - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn unknown_key_has_no_statistics() {
        let metrics = PerformanceMetrics::default();
        assert_eq!(metrics.window_size(), 100);
        assert_eq!(metrics.average("nope"), None);
        assert_eq!(metrics.min("nope"), None);
    }

    #[test]
    fn shrinking_window_drops_oldest() {
        let mut metrics = PerformanceMetrics::new(10);
        for v in 0..10 {
            metrics.add_value(SAMPLE_TIME_KEY, v as f64);
        }
        metrics.resize_window(2);
        assert_eq!(metrics.values(SAMPLE_TIME_KEY).collect::<Vec<_>>(), vec![8.0, 9.0]);
        assert_eq!(metrics.average(SAMPLE_TIME_KEY), Some(8.5));
    }
}
