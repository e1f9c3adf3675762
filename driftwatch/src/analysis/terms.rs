//! Term extraction for topic labels.
//!
//! Labels use class-based TF-IDF: each topic's messages are treated as one
//! document, and a term scores by its frequency inside the topic weighted
//! by how rare it is across all topics.

use std::collections::{BTreeMap, HashMap};

use unicode_segmentation::UnicodeSegmentation;

const STOPWORDS: &[&str] = &[
    "about", "above", "after", "again", "against", "all", "also", "and", "any", "are", "because",
    "been", "before", "being", "below", "between", "both", "but", "can", "could", "did", "does",
    "doing", "down", "during", "each", "few", "for", "from", "further", "had", "has", "have",
    "having", "her", "here", "hers", "herself", "him", "himself", "his", "how", "into", "its",
    "itself", "just", "let", "like", "more", "most", "much", "myself", "need", "nor", "not", "now",
    "off", "once", "only", "other", "our", "ours", "ourselves", "out", "over", "own", "same",
    "she", "should", "some", "such", "than", "that", "the", "their", "theirs", "them",
    "themselves", "then", "there", "these", "they", "this", "those", "through", "too", "under",
    "until", "use", "using", "very", "want", "was", "way", "were", "what", "when", "where",
    "which", "while", "who", "whom", "why", "will", "with", "would", "yes", "you", "your",
    "yours", "yourself", "yourselves", "thanks", "thank", "please", "sure", "okay", "get",
    "got", "make", "one", "two", "well", "really", "think", "know", "see", "it's", "i'm",
    "don't", "can't", "that's",
];

fn is_stopword(word: &str) -> bool {
    STOPWORDS.contains(&word)
}

/// Lowercased content words of `text`: longer than two characters, not a
/// stopword, not purely numeric.
pub fn tokenize(text: &str) -> Vec<String> {
    text.unicode_words()
        .map(str::to_lowercase)
        .filter(|w| w.chars().count() > 2)
        .filter(|w| !w.chars().all(|c| c.is_numeric()))
        .filter(|w| !is_stopword(w))
        .collect()
}

fn term_counts<'a, I>(texts: I) -> BTreeMap<String, usize>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut counts = BTreeMap::new();
    for text in texts {
        for term in tokenize(text) {
            *counts.entry(term).or_insert(0) += 1;
        }
    }
    counts
}

fn pick_top(mut scored: Vec<(String, f64)>, top_n: usize) -> Vec<String> {
    scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    scored.into_iter().take(top_n).map(|(term, _)| term).collect()
}

/// Representative terms for each class of documents, in class order.
///
/// `classes[c]` holds the texts assigned to class `c`. A class with no
/// content words gets an empty list.
pub fn class_labels(classes: &[Vec<&str>], top_n: usize) -> Vec<Vec<String>> {
    let per_class: Vec<BTreeMap<String, usize>> = classes
        .iter()
        .map(|texts| term_counts(texts.iter().copied()))
        .collect();

    let mut corpus_freq: HashMap<&str, usize> = HashMap::new();
    let mut total_words = 0usize;
    for counts in &per_class {
        for (term, count) in counts {
            *corpus_freq.entry(term.as_str()).or_insert(0) += count;
            total_words += count;
        }
    }

    if total_words == 0 {
        return vec![Vec::new(); classes.len()];
    }
    let avg_words = total_words as f64 / classes.len().max(1) as f64;

    per_class
        .iter()
        .map(|counts| {
            let class_total: usize = counts.values().sum();
            if class_total == 0 {
                return Vec::new();
            }

            let scored = counts
                .iter()
                .map(|(term, &count)| {
                    let tf = count as f64 / class_total as f64;
                    let freq = corpus_freq.get(term.as_str()).copied().unwrap_or(count);
                    let idf = (1.0 + avg_words / freq as f64).ln();
                    (term.clone(), tf * idf)
                })
                .collect();

            pick_top(scored, top_n)
        })
        .collect()
}

/// Most frequent content words across `texts`.
pub fn top_terms(texts: &[&str], top_n: usize) -> Vec<String> {
    let scored = term_counts(texts.iter().copied())
        .into_iter()
        .map(|(term, count)| (term, count as f64))
        .collect();
    pick_top(scored, top_n)
}

pub fn join_label(terms: &[String]) -> Option<String> {
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_filters_noise() {
        let tokens = tokenize("The Borrow checker, in 2024, rejects THIS code!");
        assert_eq!(tokens, vec!["borrow", "checker", "rejects", "code"]);
    }

    #[test]
    fn test_class_labels_prefer_distinctive_terms() {
        let classes = vec![
            vec!["rust borrow checker error", "borrow checker lifetimes"],
            vec!["pasta sauce recipe", "tomato sauce for pasta"],
        ];
        let labels = class_labels(&classes, 2);
        assert_eq!(labels.len(), 2);
        assert!(labels[0].contains(&"borrow".to_string()));
        assert!(labels[1].contains(&"pasta".to_string()) || labels[1].contains(&"sauce".to_string()));
    }

    #[test]
    fn test_empty_classes_get_no_terms() {
        let labels = class_labels(&[vec!["the and for"], vec![]], 3);
        assert_eq!(labels, vec![Vec::<String>::new(), Vec::new()]);
    }

    #[test]
    fn test_top_terms_breaks_ties_alphabetically() {
        let terms = top_terms(&["zebra apple", "apple mango"], 2);
        assert_eq!(terms, vec!["apple", "mango"]);
        assert_eq!(join_label(&terms).as_deref(), Some("apple, mango"));
        assert_eq!(join_label(&[]), None);
    }
}
