// 🏷️ Sentiment Rules - keyword rules as data
// Headline → positive / negative / neutral. First matching rule wins.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Negative,
    Neutral,
}

impl Sentiment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sentiment::Positive => "positive",
            Sentiment::Negative => "negative",
            Sentiment::Neutral => "neutral",
        }
    }
}

/// Pluggable headline classifier. Implementations must be deterministic.
pub trait SentimentClassifier: Send + Sync {
    fn classify(&self, text: &str) -> Sentiment;
}

// ============================================================================
// KEYWORD LISTS (configuration)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SentimentKeywords {
    pub positive: Vec<String>,
    pub negative: Vec<String>,
}

impl Default for SentimentKeywords {
    fn default() -> Self {
        let words = |list: &[&str]| list.iter().map(|w| w.to_string()).collect();
        SentimentKeywords {
            positive: words(&["profit", "growth", "gain", "surge", "beat", "upgrade", "record high"]),
            negative: words(&["loss", "decline", "drop", "plunge", "miss", "downgrade", "lawsuit"]),
        }
    }
}

// ============================================================================
// RULE DEFINITION
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentimentRule {
    /// Rule ID for tracking
    pub id: String,

    /// Case-insensitive substring to look for
    pub pattern: String,

    pub label: Sentiment,

    /// Priority (higher = checked first)
    #[serde(default)]
    pub priority: i32,
}

impl SentimentRule {
    pub fn matches(&self, text_lower: &str) -> bool {
        !self.pattern.is_empty() && text_lower.contains(&self.pattern.to_lowercase())
    }
}

// ============================================================================
// KEYWORD CLASSIFIER
// ============================================================================

pub struct KeywordSentiment {
    rules: Vec<SentimentRule>,
}

impl KeywordSentiment {
    /// Positive keywords outrank negative ones; list order breaks ties
    pub fn from_keywords(keywords: &SentimentKeywords) -> Self {
        let positive = keywords.positive.iter().map(|k| SentimentRule {
            id: format!("positive:{}", k),
            pattern: k.clone(),
            label: Sentiment::Positive,
            priority: 1,
        });
        let negative = keywords.negative.iter().map(|k| SentimentRule {
            id: format!("negative:{}", k),
            pattern: k.clone(),
            label: Sentiment::Negative,
            priority: 0,
        });

        KeywordSentiment::from_rules(positive.chain(negative).collect())
    }

    pub fn from_rules(mut rules: Vec<SentimentRule>) -> Self {
        // Stable sort keeps declaration order within a priority
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        KeywordSentiment { rules }
    }

    pub fn add_rule(&mut self, rule: SentimentRule) {
        self.rules.push(rule);
        self.rules.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    /// The rule that decides this text, if any
    pub fn matching_rule(&self, text: &str) -> Option<&SentimentRule> {
        let lower = text.to_lowercase();
        self.rules.iter().find(|rule| rule.matches(&lower))
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

impl Default for KeywordSentiment {
    fn default() -> Self {
        Self::from_keywords(&SentimentKeywords::default())
    }
}

impl SentimentClassifier for KeywordSentiment {
    fn classify(&self, text: &str) -> Sentiment {
        self.matching_rule(text)
            .map(|rule| rule.label)
            .unwrap_or(Sentiment::Neutral)
    }
}

// ============================================================================
// TESTS
// ============================================================================
