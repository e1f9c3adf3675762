use serde::{Deserialize, Serialize};

use crate::config::DriftConfig;

use super::math::{cosine_distance, mean, mean_vector};

/// Drift of every message from the conversation anchor.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DriftAnalysis {
    /// One value per message; anchor messages are included.
    pub curve: Vec<f64>,
    pub anchor: Vec<f32>,
    pub max_drift: f64,
    pub mean_drift: f64,
    pub drift_velocity: f64,
    pub final_drift: f64,
    /// Indices where sustained drift begins.
    pub changepoints: Vec<usize>,
    /// Indices where drift falls back near the anchor after a departure.
    pub returns: Vec<usize>,
    pub score: f64,
}

impl DriftAnalysis {
    pub fn return_count(&self) -> usize {
        self.returns.len()
    }
}

#[derive(Debug, Clone)]
pub struct DriftAnalyzer {
    config: DriftConfig,
}

impl DriftAnalyzer {
    pub fn new(config: DriftConfig) -> Self {
        Self { config }
    }

    pub fn anchor_window(&self) -> usize {
        self.config.anchor_window.max(1)
    }

    /// Analyze normalized message embeddings in conversation order.
    pub fn analyze(&self, embeddings: &[Vec<f32>]) -> DriftAnalysis {
        let k = self.anchor_window();
        let n = embeddings.len();

        if n < k {
            return DriftAnalysis {
                curve: vec![0.0; n],
                anchor: mean_vector(embeddings),
                ..Default::default()
            };
        }

        let anchor = mean_vector(&embeddings[..k]);
        let curve: Vec<f64> = embeddings
            .iter()
            .map(|e| cosine_distance(e, &anchor).max(0.0))
            .collect();

        let tail = &curve[k..];
        let max_drift = tail.iter().copied().fold(0.0_f64, f64::max);
        let mean_drift = mean(tail);
        let final_drift = tail.last().copied().unwrap_or(0.0);
        let drift_velocity = if tail.len() > 1 {
            let diffs: Vec<f64> = tail.windows(2).map(|w| (w[1] - w[0]).abs()).collect();
            mean(&diffs)
        } else {
            0.0
        };

        let changepoints = self.changepoints(&curve, k);
        let returns = self.returns(&curve, k);
        let normalizer = if self.config.normalizer > 0.0 {
            self.config.normalizer
        } else {
            1.0
        };
        let score = (mean_drift / normalizer).clamp(0.0, 1.0);

        DriftAnalysis {
            curve,
            anchor,
            max_drift,
            mean_drift,
            drift_velocity,
            final_drift,
            changepoints,
            returns,
            score,
        }
    }

    /// Starts of runs that stay above the threshold for the whole
    /// persistence window. A single spike never qualifies.
    fn changepoints(&self, curve: &[f64], start: usize) -> Vec<usize> {
        let threshold = self.config.threshold;
        let window = self.config.persistence_window.max(1);
        let mut points = Vec::new();

        for i in start..curve.len() {
            let entering = i == start || curve[i - 1] <= threshold;
            if !entering || curve[i] <= threshold || i + window > curve.len() {
                continue;
            }
            if curve[i..i + window].iter().all(|&d| d > threshold) {
                points.push(i);
            }
        }

        points
    }

    fn returns(&self, curve: &[f64], start: usize) -> Vec<usize> {
        let mut departed = false;
        let mut points = Vec::new();

        for (i, &d) in curve.iter().enumerate().skip(start) {
            if d > self.config.threshold {
                departed = true;
            } else if departed && d < self.config.return_threshold {
                points.push(i);
                departed = false;
            }
        }

        points
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(dim: usize, axis: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[axis] = 1.0;
        v
    }

    fn analyzer() -> DriftAnalyzer {
        DriftAnalyzer::new(DriftConfig::default())
    }

    #[test]
    fn test_short_conversation_has_no_drift() {
        let analysis = analyzer().analyze(&[unit(4, 0), unit(4, 1)]);
        assert_eq!(analysis.curve, vec![0.0, 0.0]);
        assert_eq!(analysis.score, 0.0);
        assert!(analysis.changepoints.is_empty());
        assert_eq!(analysis.anchor.len(), 4);
    }

    #[test]
    fn test_abrupt_shift_yields_one_changepoint() {
        let mut embeddings: Vec<Vec<f32>> = (0..10).map(|_| unit(4, 0)).collect();
        embeddings.extend((0..10).map(|_| unit(4, 1)));

        let analysis = analyzer().analyze(&embeddings);
        assert_eq!(analysis.changepoints, vec![10]);
        assert!((analysis.max_drift - 1.0).abs() < 1e-6);
        assert!((analysis.final_drift - 1.0).abs() < 1e-6);
        assert_eq!(analysis.score, 1.0);
        assert!(analysis.returns.is_empty());
    }

    #[test]
    fn test_spike_is_not_a_changepoint() {
        let mut embeddings: Vec<Vec<f32>> = (0..12).map(|_| unit(4, 0)).collect();
        embeddings[6] = unit(4, 2);

        let analysis = analyzer().analyze(&embeddings);
        assert!(analysis.changepoints.is_empty());
        assert_eq!(analysis.returns, vec![7]);
        assert_eq!(analysis.return_count(), 1);
    }

    #[test]
    fn test_velocity_is_mean_absolute_difference() {
        let embeddings = vec![
            unit(2, 0),
            unit(2, 0),
            unit(2, 0),
            unit(2, 1),
            unit(2, 0),
        ];
        let analysis = analyzer().analyze(&embeddings);
        assert!((analysis.drift_velocity - 1.0).abs() < 1e-6);
        assert!((analysis.mean_drift - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_excursion_at_tail_shorter_than_window_is_ignored() {
        let mut embeddings: Vec<Vec<f32>> = (0..8).map(|_| unit(3, 0)).collect();
        embeddings.push(unit(3, 1));
        embeddings.push(unit(3, 1));

        let analysis = analyzer().analyze(&embeddings);
        assert!(analysis.changepoints.is_empty());
        assert!(analysis.score > 0.0 && analysis.score <= 1.0);
    }
}
