use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub type Metadata = HashMap<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    User,
    Assistant,
    System,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::System => write!(f, "system"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" | "human" => Ok(Self::User),
            "assistant" | "ai" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            _ => Err(format!("Unknown message role: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    Continues,
    References,
    BranchesFrom,
    Resolves,
}

impl std::fmt::Display for LinkType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Continues => write!(f, "continues"),
            Self::References => write!(f, "references"),
            Self::BranchesFrom => write!(f, "branches_from"),
            Self::Resolves => write!(f, "resolves"),
        }
    }
}

impl std::str::FromStr for LinkType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "continues" => Ok(Self::Continues),
            "references" => Ok(Self::References),
            "branches_from" => Ok(Self::BranchesFrom),
            "resolves" => Ok(Self::Resolves),
            _ => Err(format!("Unknown link type: {s}")),
        }
    }
}

/// How a message relates to the conversation's anchor topic.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelevanceCategory {
    Continuing,
    Clarifying,
    Drilling,
    Branching,
    Tangent,
    Concluding,
    Returning,
}

impl RelevanceCategory {
    pub fn is_branch(&self) -> bool {
        matches!(self, Self::Branching | Self::Tangent)
    }
}

impl std::fmt::Display for RelevanceCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Continuing => write!(f, "CONTINUING"),
            Self::Clarifying => write!(f, "CLARIFYING"),
            Self::Drilling => write!(f, "DRILLING"),
            Self::Branching => write!(f, "BRANCHING"),
            Self::Tangent => write!(f, "TANGENT"),
            Self::Concluding => write!(f, "CONCLUDING"),
            Self::Returning => write!(f, "RETURNING"),
        }
    }
}

impl std::str::FromStr for RelevanceCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "CONTINUING" => Ok(Self::Continuing),
            "CLARIFYING" => Ok(Self::Clarifying),
            "DRILLING" | "DRILLING_DOWN" => Ok(Self::Drilling),
            "BRANCHING" => Ok(Self::Branching),
            "TANGENT" => Ok(Self::Tangent),
            "CONCLUDING" => Ok(Self::Concluding),
            "RETURNING" => Ok(Self::Returning),
            _ => Err(format!("Unknown relevance category: {s}")),
        }
    }
}

/// Human-facing interpretation of an overall divergence score.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScoreBand {
    Focused,
    MinorTangents,
    Moderate,
    Significant,
    HighlyDivergent,
}

impl ScoreBand {
    pub fn from_score(score: f64) -> Self {
        if score < 0.2 {
            Self::Focused
        } else if score < 0.4 {
            Self::MinorTangents
        } else if score < 0.6 {
            Self::Moderate
        } else if score < 0.8 {
            Self::Significant
        } else {
            Self::HighlyDivergent
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Self::Focused => "Focused conversation, stays on topic",
            Self::MinorTangents => "Minor tangents, mostly cohesive",
            Self::Moderate => "Moderate divergence, consider reviewing",
            Self::Significant => "Significant divergence, split recommended",
            Self::HighlyDivergent => "Highly divergent, should be split into multiple conversations",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_bands_cover_unit_interval() {
        assert_eq!(ScoreBand::from_score(0.0), ScoreBand::Focused);
        assert_eq!(ScoreBand::from_score(0.2), ScoreBand::MinorTangents);
        assert_eq!(ScoreBand::from_score(0.45), ScoreBand::Moderate);
        assert_eq!(ScoreBand::from_score(0.6), ScoreBand::Significant);
        assert_eq!(ScoreBand::from_score(1.0), ScoreBand::HighlyDivergent);
    }

    #[test]
    fn relevance_category_parses_loosely() {
        assert_eq!(
            " tangent ".parse::<RelevanceCategory>(),
            Ok(RelevanceCategory::Tangent)
        );
        assert_eq!(
            "DRILLING_DOWN".parse::<RelevanceCategory>(),
            Ok(RelevanceCategory::Drilling)
        );
        assert!("WANDERING".parse::<RelevanceCategory>().is_err());
    }

    #[test]
    fn link_type_round_trips_through_display() {
        for link in [
            LinkType::Continues,
            LinkType::References,
            LinkType::BranchesFrom,
            LinkType::Resolves,
        ] {
            assert_eq!(link.to_string().parse::<LinkType>(), Ok(link));
        }
    }
}
