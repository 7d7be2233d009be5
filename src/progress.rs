use humansize::{format_size, DECIMAL};
use std::time::{Duration, Instant};

pub fn format_bytes(bytes: u64) -> String {
    format_size(bytes, DECIMAL)
}

pub fn format_duration(duration: Duration) -> String {
    if duration.as_millis() >= 1_000 {
        format!("{:.1}s", duration.as_secs_f64())
    } else {
        format!("{}ms", duration.as_millis())
    }
}

/// Logs how long an operation took when dropped, including on early return.
pub struct Timing {
    label: String,
    started: Instant,
}

impl Timing {
    pub fn start(label: impl Into<String>) -> Self {
        let label = label.into();
        log::debug!("{label}: started");
        Self {
            label,
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Drop for Timing {
    fn drop(&mut self) {
        log::info!(
            "{}: finished in {}",
            self.label,
            format_duration(self.started.elapsed())
        );
    }
}

pub fn throughput_mb_per_sec(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= f64::EPSILON {
        return 0.0;
    }
    (bytes as f64 / secs) / (1024.0 * 1024.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.5s");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert!(format_bytes(1500).ends_with("kB"));
    }

    #[test]
    fn test_throughput_handles_zero_elapsed() {
        assert_eq!(throughput_mb_per_sec(1024, Duration::ZERO), 0.0);
    }
}
