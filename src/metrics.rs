//! Wall-clock execution averages used for deployment progress estimation

use std::sync::Mutex;
use std::time::Instant;

#[derive(Debug, Default)]
struct MetricsInner {
    average_millis: u64,
    total_measurements: u64,
}

/// Running average of the wall-clock time of a measured step.
///
/// Every fragment and template carries one of these; the package-level
/// instance records whole-deployment durations and serves as the denominator
/// when estimating progress.
#[derive(Debug, Default)]
pub struct Metrics {
    inner: Mutex<MetricsInner>,
}

/// An in-flight measurement handle
pub struct Measure {
    start: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_measure(&self) -> Measure {
        Measure {
            start: Instant::now(),
        }
    }

    pub fn stop_measure(&self, measure: Measure) {
        let elapsed = measure.start.elapsed().as_millis() as u64;
        let mut inner = self.inner.lock().expect("metrics lock poisoned");
        let total = inner.total_measurements;
        if total == 0 {
            inner.average_millis = elapsed;
        } else {
            inner.average_millis = (inner.average_millis * total + elapsed) / (total + 1);
        }
        inner.total_measurements = total + 1;
    }

    pub fn average_millis(&self) -> u64 {
        self.inner.lock().expect("metrics lock poisoned").average_millis
    }

    pub fn total_measurements(&self) -> u64 {
        self.inner
            .lock()
            .expect("metrics lock poisoned")
            .total_measurements
    }

    /// This step's average as a percentage of the total average, clamped to
    /// 0..=100. Returns 0 until both sides have at least one measurement.
    pub fn percent_of_total(&self, total: &Metrics) -> u8 {
        let mine = self.average_millis();
        let all = total.average_millis();
        if all == 0 || self.total_measurements() == 0 {
            return 0;
        }
        ((mine * 100 / all).min(100)) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_running_average() {
        let m = Metrics::new();
        assert_eq!(m.average_millis(), 0);
        assert_eq!(m.total_measurements(), 0);

        let handle = m.start_measure();
        std::thread::sleep(Duration::from_millis(5));
        m.stop_measure(handle);

        assert_eq!(m.total_measurements(), 1);
        assert!(m.average_millis() >= 5);
    }

    #[test]
    fn test_percent_of_total_clamps() {
        let frag = Metrics::new();
        let total = Metrics::new();

        // No measurements yet
        assert_eq!(frag.percent_of_total(&total), 0);

        let h = frag.start_measure();
        std::thread::sleep(Duration::from_millis(10));
        frag.stop_measure(h);

        // Denominator unmeasured
        assert_eq!(frag.percent_of_total(&total), 0);

        let h = total.start_measure();
        std::thread::sleep(Duration::from_millis(2));
        total.stop_measure(h);

        // Fragment took longer than the "total"; must clamp at 100
        assert_eq!(frag.percent_of_total(&total), 100);
    }
}
