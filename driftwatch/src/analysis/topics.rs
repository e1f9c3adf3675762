//! Discrete topic assignment by clustering message embeddings.
//!
//! K-means with deterministic farthest-point seeding picks the number of
//! topics by mean silhouette. Results are fully deterministic for a fixed
//! input, so reruns with the same model reproduce the same boundaries.

use serde::{Deserialize, Serialize};

use crate::config::TopicConfig;

use super::math::{cosine_similarity, mean_vector};
use super::terms;

/// A maximal contiguous run of messages sharing one topic id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopicRun {
    pub topic: usize,
    pub start_index: usize,
    pub end_index: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopicAnalysis {
    /// Topic id per message. Ids are numbered by first appearance.
    pub assignments: Vec<usize>,
    pub num_topics: usize,
    pub labels: Vec<String>,
    pub entropy: f64,
    pub transition_rate: f64,
    pub dominant_topic_ratio: f64,
    pub silhouette: f64,
    pub runs: Vec<TopicRun>,
}

impl TopicAnalysis {
    /// Message indices where a new topic run starts, excluding index 0.
    pub fn boundaries(&self) -> Vec<usize> {
        self.runs.iter().skip(1).map(|run| run.start_index).collect()
    }

    pub fn entropy_score(&self) -> f64 {
        self.entropy.clamp(0.0, 1.0)
    }

    pub fn transition_score(&self) -> f64 {
        (self.transition_rate * 2.0).clamp(0.0, 1.0)
    }

    /// Label of the most frequent topic in `[start, end]`, earliest id on ties.
    pub fn dominant_label(&self, start: usize, end: usize) -> Option<&str> {
        let span = self.assignments.get(start..=end)?;
        let mut counts = vec![0usize; self.num_topics];
        for &topic in span {
            counts[topic] += 1;
        }
        let (best, _) = counts
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(&a.0)))?;
        self.labels.get(best).map(String::as_str)
    }
}

/// Normalized Shannon entropy and dominant ratio of a topic sequence.
pub fn distribution_stats(assignments: &[usize], num_topics: usize) -> (f64, f64) {
    if assignments.is_empty() || num_topics == 0 {
        return (0.0, 0.0);
    }

    let mut counts = vec![0usize; num_topics];
    for &topic in assignments {
        if topic < num_topics {
            counts[topic] += 1;
        }
    }

    let total = assignments.len() as f64;
    let dominant = counts.iter().copied().max().unwrap_or(0) as f64 / total;
    let present = counts.iter().filter(|&&c| c > 0).count();
    if present <= 1 {
        return (0.0, dominant);
    }

    let entropy: f64 = counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / total;
            -p * p.ln()
        })
        .sum();

    ((entropy / (num_topics as f64).ln()).clamp(0.0, 1.0), dominant)
}

/// Fraction of adjacent pairs whose topic differs.
pub fn transition_rate(assignments: &[usize]) -> f64 {
    if assignments.len() < 2 {
        return 0.0;
    }
    let changes = assignments.windows(2).filter(|w| w[0] != w[1]).count();
    changes as f64 / (assignments.len() - 1) as f64
}

#[derive(Debug, Clone)]
pub struct TopicAnalyzer {
    config: TopicConfig,
}

impl TopicAnalyzer {
    pub fn new(config: TopicConfig) -> Self {
        Self { config }
    }

    /// Returns `None` when the conversation is too short to cluster.
    pub fn analyze(&self, embeddings: &[Vec<f32>], texts: &[String]) -> Option<TopicAnalysis> {
        let n = embeddings.len();
        if n < self.config.min_messages.max(2) || texts.len() != n {
            return None;
        }

        let min_size = self.config.min_topic_size.max(1);
        let max_k = self.config.max_topics.min(n / min_size);
        let distances = distance_matrix(embeddings);

        let mut best: Option<(Vec<usize>, usize, f64)> = None;
        for k in 2..=max_k {
            let raw = kmeans(embeddings, k, self.config.max_iterations.max(1));
            let (assignments, num_topics) = merge_small_clusters(embeddings, raw, min_size);
            if num_topics < 2 {
                continue;
            }

            let score = silhouette(&distances, n, &assignments, num_topics);
            tracing::trace!(k, num_topics, silhouette = score, "Topic clustering candidate");
            if best.as_ref().map_or(true, |(_, _, s)| score > *s) {
                best = Some((assignments, num_topics, score));
            }
        }

        let (assignments, num_topics, silhouette) = match best {
            Some((assignments, k, score)) if score >= self.config.min_silhouette => {
                (assignments, k, score)
            }
            _ => (vec![0; n], 1, 0.0),
        };

        let labels = self.label_topics(texts, &assignments, num_topics);
        let (entropy, dominant_topic_ratio) = distribution_stats(&assignments, num_topics);

        Some(TopicAnalysis {
            runs: runs(&assignments),
            transition_rate: transition_rate(&assignments),
            assignments,
            num_topics,
            labels,
            entropy,
            dominant_topic_ratio,
            silhouette,
        })
    }

    fn label_topics(&self, texts: &[String], assignments: &[usize], k: usize) -> Vec<String> {
        let mut classes: Vec<Vec<&str>> = vec![Vec::new(); k];
        for (text, &topic) in texts.iter().zip(assignments) {
            classes[topic].push(text.as_str());
        }

        terms::class_labels(&classes, self.config.label_terms.max(1))
            .into_iter()
            .enumerate()
            .map(|(topic, terms)| terms::join_label(&terms).unwrap_or_else(|| format!("topic {topic}")))
            .collect()
    }
}

fn runs(assignments: &[usize]) -> Vec<TopicRun> {
    let mut runs: Vec<TopicRun> = Vec::new();
    for (i, &topic) in assignments.iter().enumerate() {
        match runs.last_mut() {
            Some(run) if run.topic == topic => run.end_index = i,
            _ => runs.push(TopicRun {
                topic,
                start_index: i,
                end_index: i,
            }),
        }
    }
    runs
}

fn distance_matrix(embeddings: &[Vec<f32>]) -> Vec<f64> {
    let n = embeddings.len();
    let mut matrix = vec![0.0; n * n];
    for i in 0..n {
        for j in (i + 1)..n {
            let d = (1.0 - cosine_similarity(&embeddings[i], &embeddings[j])).max(0.0);
            matrix[i * n + j] = d;
            matrix[j * n + i] = d;
        }
    }
    matrix
}

fn nearest(point: &[f32], centroids: &[Vec<f32>]) -> usize {
    let mut best_idx = 0;
    let mut best_similarity = f64::NEG_INFINITY;
    for (i, centroid) in centroids.iter().enumerate() {
        let similarity = cosine_similarity(point, centroid);
        if similarity > best_similarity {
            best_similarity = similarity;
            best_idx = i;
        }
    }
    best_idx
}

/// Farthest-point seeding from message 0.
fn seed_centroids(embeddings: &[Vec<f32>], k: usize) -> Vec<Vec<f32>> {
    let mut centroids = vec![embeddings[0].clone()];

    while centroids.len() < k {
        let mut best_idx = 0;
        let mut best_distance = f64::NEG_INFINITY;
        for (i, point) in embeddings.iter().enumerate() {
            let min_distance = centroids
                .iter()
                .map(|c| 1.0 - cosine_similarity(point, c))
                .fold(f64::INFINITY, f64::min);
            if min_distance > best_distance {
                best_distance = min_distance;
                best_idx = i;
            }
        }
        centroids.push(embeddings[best_idx].clone());
    }

    centroids
}

fn kmeans(embeddings: &[Vec<f32>], k: usize, max_iterations: usize) -> Vec<usize> {
    let mut centroids = seed_centroids(embeddings, k);
    let mut assignments: Vec<usize> = embeddings.iter().map(|e| nearest(e, &centroids)).collect();

    for _ in 0..max_iterations {
        for (cluster, centroid) in centroids.iter_mut().enumerate() {
            let members: Vec<&Vec<f32>> = embeddings
                .iter()
                .zip(&assignments)
                .filter(|(_, &a)| a == cluster)
                .map(|(e, _)| e)
                .collect();
            // Empty clusters keep their previous centroid.
            if !members.is_empty() {
                *centroid = mean_vector(&members);
            }
        }

        let next: Vec<usize> = embeddings.iter().map(|e| nearest(e, &centroids)).collect();
        if next == assignments {
            break;
        }
        assignments = next;
    }

    assignments
}

/// Fold clusters smaller than `min_size` into the nearest remaining cluster
/// and renumber ids by first appearance.
fn merge_small_clusters(
    embeddings: &[Vec<f32>],
    mut assignments: Vec<usize>,
    min_size: usize,
) -> (Vec<usize>, usize) {
    let k = assignments.iter().copied().max().map_or(0, |m| m + 1);
    let mut sizes = vec![0usize; k];
    for &a in &assignments {
        sizes[a] += 1;
    }

    let large: Vec<usize> = (0..k).filter(|&c| sizes[c] >= min_size).collect();
    if large.is_empty() {
        return (vec![0; assignments.len()], 1);
    }

    if large.len() < k {
        let centroids: Vec<Vec<f32>> = large
            .iter()
            .map(|&c| {
                let members: Vec<&Vec<f32>> = embeddings
                    .iter()
                    .zip(&assignments)
                    .filter(|(_, &a)| a == c)
                    .map(|(e, _)| e)
                    .collect();
                mean_vector(&members)
            })
            .collect();

        for (point, assignment) in embeddings.iter().zip(assignments.iter_mut()) {
            if sizes[*assignment] < min_size {
                *assignment = large[nearest(point, &centroids)];
            }
        }
    }

    let mut mapping: Vec<Option<usize>> = vec![None; k];
    let mut next_id = 0;
    for assignment in assignments.iter_mut() {
        let id = *mapping[*assignment].get_or_insert_with(|| {
            next_id += 1;
            next_id - 1
        });
        *assignment = id;
    }

    (assignments, next_id)
}

fn silhouette(distances: &[f64], n: usize, assignments: &[usize], k: usize) -> f64 {
    let mut sizes = vec![0usize; k];
    for &a in assignments {
        sizes[a] += 1;
    }

    let mut total = 0.0;
    for i in 0..n {
        let own = assignments[i];
        if sizes[own] <= 1 {
            continue;
        }

        let mut sums = vec![0.0; k];
        for j in 0..n {
            if i != j {
                sums[assignments[j]] += distances[i * n + j];
            }
        }

        let a = sums[own] / (sizes[own] - 1) as f64;
        let b = (0..k)
            .filter(|&c| c != own && sizes[c] > 0)
            .map(|c| sums[c] / sizes[c] as f64)
            .fold(f64::INFINITY, f64::min);
        if !b.is_finite() {
            continue;
        }

        let denom = a.max(b);
        if denom > 0.0 {
            total += (b - a) / denom;
        }
    }

    total / n as f64
}
