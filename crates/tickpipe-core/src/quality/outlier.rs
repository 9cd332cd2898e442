use std::collections::VecDeque;

use crate::UtcDateTime;

/// Flagged return with its z-score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutlierHit {
    pub ts: UtcDateTime,
    pub simple_return: f64,
    pub z_score: f64,
}

/// Trailing-window z-score test over simple close-to-close returns.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutlierDetector {
    pub threshold: f64,
    pub lookback: usize,
    pub min_samples: usize,
}

impl OutlierDetector {
    /// `prior_closes` are resolved closes before the batch, oldest first.
    /// Flagged returns do not enter the trailing window.
    pub fn scan(&self, prior_closes: &[f64], batch: &[(UtcDateTime, f64)]) -> Vec<OutlierHit> {
        let mut hits = Vec::new();
        let mut trailing: VecDeque<f64> = VecDeque::with_capacity(self.lookback + 1);

        let mut previous: Option<f64> = None;
        for close in prior_closes.iter().copied() {
            if let Some(prev) = previous {
                if let Some(ret) = simple_return(prev, close) {
                    self.push(&mut trailing, ret);
                }
            }
            previous = Some(close);
        }

        for &(ts, close) in batch {
            let Some(prev) = previous.replace(close) else {
                continue;
            };
            let Some(ret) = simple_return(prev, close) else {
                continue;
            };

            match self.z_score(&trailing, ret) {
                Some(z) if z.abs() > self.threshold => hits.push(OutlierHit {
                    ts,
                    simple_return: ret,
                    z_score: z,
                }),
                _ => self.push(&mut trailing, ret),
            }
        }
        hits
    }

    fn push(&self, trailing: &mut VecDeque<f64>, ret: f64) {
        trailing.push_back(ret);
        while trailing.len() > self.lookback.max(1) {
            trailing.pop_front();
        }
    }

    fn z_score(&self, trailing: &VecDeque<f64>, ret: f64) -> Option<f64> {
        if trailing.len() < self.min_samples.max(2) {
            return None;
        }
        let n = trailing.len() as f64;
        let mean = trailing.iter().sum::<f64>() / n;
        let variance = trailing.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
        let std_dev = variance.sqrt();
        if !std_dev.is_finite() || std_dev < 1e-12 {
            return None;
        }
        Some((ret - mean) / std_dev)
    }
}

fn simple_return(previous: f64, current: f64) -> Option<f64> {
    if previous <= 0.0 || !previous.is_finite() || !current.is_finite() {
        return None;
    }
    Some(current / previous - 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> OutlierDetector {
        OutlierDetector {
            threshold: 4.0,
            lookback: 20,
            min_samples: 5,
        }
    }

    fn ts(day: i64) -> UtcDateTime {
        UtcDateTime::parse("2024-01-01T00:00:00Z")
            .expect("ts")
            .saturating_add(time::Duration::days(day))
    }

    #[test]
    fn flags_spike_against_calm_history() {
        let prior: Vec<f64> = (0..15).map(|i| 100.0 + if i % 2 == 0 { 0.5 } else { -0.5 }).collect();
        let batch = vec![(ts(0), 100.4), (ts(1), 130.0), (ts(2), 100.3)];

        let hits = detector().scan(&prior, &batch);

        assert!(hits.iter().any(|hit| hit.ts == ts(1)));
        assert!(hits.iter().all(|hit| hit.ts != ts(0)));
    }

    #[test]
    fn needs_minimum_history() {
        let batch = vec![(ts(0), 100.0), (ts(1), 100.5), (ts(2), 150.0)];
        assert!(detector().scan(&[], &batch).is_empty());
    }

    #[test]
    fn flat_series_never_flags() {
        let prior = vec![101.0; 30];
        let batch = vec![(ts(0), 101.0), (ts(1), 101.0)];
        assert!(detector().scan(&prior, &batch).is_empty());
    }
}
