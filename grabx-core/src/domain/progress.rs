//! Progress domain types

use serde::{Deserialize, Serialize};

/// Coarse phase of a running grab
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProgressPhase {
    /// Started but no transfer figures yet
    #[default]
    Preparing,
    Downloading,
    /// Merging, converting or otherwise finishing up; `fraction` is not meaningful
    PostProcessing,
}

/// Latest progress reported by a fetcher for the attempt in flight
///
/// Every field is optional because fetchers report whatever they know.
/// A `fraction` of `None` means the progress is indeterminate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub fraction: Option<f64>,
    pub downloaded_bytes: Option<u64>,
    pub total_bytes: Option<u64>,
    pub speed: Option<String>,
    pub eta: Option<String>,
    pub phase: ProgressPhase,
}

impl Progress {
    /// Progress at the given fraction, clamped to `0.0..=1.0`
    pub fn fraction(fraction: f64) -> Self {
        Self {
            phase: ProgressPhase::Downloading,
            ..Self::default()
        }
        .with_fraction(fraction)
    }

    pub fn with_fraction(mut self, fraction: f64) -> Self {
        self.fraction = if fraction.is_nan() {
            None
        } else {
            Some(fraction.clamp(0.0, 1.0))
        };
        self
    }

    pub fn with_bytes(mut self, downloaded: u64, total: Option<u64>) -> Self {
        self.downloaded_bytes = Some(downloaded);
        self.total_bytes = total;
        if let Some(total) = total.filter(|t| *t > 0) {
            self = self.with_fraction(downloaded as f64 / total as f64);
        }
        self
    }

    pub fn with_phase(mut self, phase: ProgressPhase) -> Self {
        self.phase = phase;
        self
    }

    /// Percentage in `0..=100` when the fraction is known
    pub fn percent(&self) -> Option<f64> {
        self.fraction.map(|f| f * 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fraction_is_clamped() {
        assert_eq!(Progress::fraction(1.7).fraction, Some(1.0));
        assert_eq!(Progress::fraction(-0.2).fraction, Some(0.0));
        assert_eq!(Progress::fraction(f64::NAN).fraction, None);
    }

    #[test]
    fn test_bytes_derive_fraction() {
        let progress = Progress::default().with_bytes(25, Some(100));
        assert_eq!(progress.fraction, Some(0.25));
        assert_eq!(progress.percent(), Some(25.0));

        let unknown_total = Progress::default().with_bytes(25, None);
        assert_eq!(unknown_total.fraction, None);
    }
}
