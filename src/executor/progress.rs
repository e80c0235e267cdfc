//! Progress estimation from the transcoder's `-progress` stream.
//!
//! The transcoder reports how much media time it has written. Dividing by
//! the probed duration gives a ratio, which is mapped through a log curve:
//! early movement is visible, and the last stretch slows down instead of
//! sitting at a falsely precise 97%. Only the `progress=end` marker yields
//! 100.

use std::time::Duration;

/// Reported while the duration is unknown or zero.
pub const INDETERMINATE_PROGRESS: u8 = 50;

/// Highest value the curve produces before the end marker.
const CURVE_CEILING: f64 = 99.0;

/// One parsed line of the progress stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressSignal {
    /// Media time written so far.
    MediaTime(Duration),
    /// The transcoder finished writing.
    End,
}

/// Parse one `key=value` line of the progress stream.
///
/// Lines that carry no position (bitrate, fps, `N/A` values) yield `None`.
pub fn parse_progress_line(line: &str) -> Option<ProgressSignal> {
    let (key, value) = line.trim().split_once('=')?;
    let value = value.trim();
    match key.trim() {
        // Both keys are in microseconds; `out_time_ms` is misnamed upstream.
        "out_time_us" | "out_time_ms" => {
            let us: i64 = value.parse().ok()?;
            Some(ProgressSignal::MediaTime(Duration::from_micros(
                us.max(0) as u64,
            )))
        }
        "progress" if value == "end" => Some(ProgressSignal::End),
        _ => None,
    }
}

/// Monotonic progress for a single job.
#[derive(Debug, Clone)]
pub struct ProgressEstimator {
    duration: Option<Duration>,
    current: u8,
}

impl ProgressEstimator {
    /// `duration` is the probed media length; `None` when metadata is missing.
    pub fn new(duration: Option<Duration>) -> Self {
        let duration = duration.filter(|d| !d.is_zero());
        let current = if duration.is_some() {
            0
        } else {
            INDETERMINATE_PROGRESS
        };
        Self { duration, current }
    }

    /// Feed a signal and return the progress to report.
    pub fn update(&mut self, signal: ProgressSignal) -> u8 {
        let estimate = match signal {
            ProgressSignal::End => 100,
            ProgressSignal::MediaTime(elapsed) => match self.duration {
                Some(total) => scale(elapsed.as_secs_f64() / total.as_secs_f64()),
                None => INDETERMINATE_PROGRESS,
            },
        };
        self.current = self.current.max(estimate).min(100);
        self.current
    }

    pub fn current(&self) -> u8 {
        self.current
    }
}

/// `99 * ln(1 + 9r) / ln(10)` for `r` clamped to `[0, 1]`.
fn scale(ratio: f64) -> u8 {
    let r = if ratio.is_finite() {
        ratio.clamp(0.0, 1.0)
    } else {
        0.0
    };
    let p = CURVE_CEILING * (1.0 + 9.0 * r).ln() / 10f64.ln();
    p.floor().clamp(0.0, CURVE_CEILING) as u8
}
