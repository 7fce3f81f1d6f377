use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const INITIAL_AFFINITY: u8 = 30;
pub const MAX_AFFINITY: u8 = 100;
/// Largest swing a single message can cause, either way.
pub const MAX_DELTA: i32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipStage {
    Wary,
    Confused,
    Trusting,
    Intimate,
}

impl RelationshipStage {
    pub fn from_affinity(affinity: u8) -> Self {
        match affinity {
            0..=24 => RelationshipStage::Wary,
            25..=49 => RelationshipStage::Confused,
            50..=74 => RelationshipStage::Trusting,
            _ => RelationshipStage::Intimate,
        }
    }

    /// Wording handed to the model.
    pub fn label(&self) -> &'static str {
        match self {
            RelationshipStage::Wary => "警戒・不信",
            RelationshipStage::Confused => "興味・困惑",
            RelationshipStage::Trusting => "信頼・好意",
            RelationshipStage::Intimate => "親密",
        }
    }
}

impl fmt::Display for RelationshipStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelationshipStage::Wary => write!(f, "wary"),
            RelationshipStage::Confused => write!(f, "confused"),
            RelationshipStage::Trusting => write!(f, "trusting"),
            RelationshipStage::Intimate => write!(f, "intimate"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffinityChange {
    pub delta: i32,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
    pub affinity: u8,
    pub total_interactions: u32,
    pub positive_interactions: u32,
    pub negative_interactions: u32,
    pub last_interaction: Option<DateTime<Utc>>,
}

impl Default for Relationship {
    fn default() -> Self {
        Relationship {
            affinity: INITIAL_AFFINITY,
            total_interactions: 0,
            positive_interactions: 0,
            negative_interactions: 0,
            last_interaction: None,
        }
    }
}

impl Relationship {
    pub fn with_affinity(affinity: u8) -> Self {
        Relationship {
            affinity: affinity.min(MAX_AFFINITY),
            ..Default::default()
        }
    }

    pub fn stage(&self) -> RelationshipStage {
        RelationshipStage::from_affinity(self.affinity)
    }

    /// Applies a change and returns the new affinity, clamped to 0..=100.
    pub fn apply(&mut self, change: &AffinityChange) -> u8 {
        let delta = change.delta.clamp(-MAX_DELTA, MAX_DELTA);
        let updated = (self.affinity as i32 + delta).clamp(0, MAX_AFFINITY as i32);
        self.affinity = updated as u8;

        self.total_interactions += 1;
        if delta > 0 {
            self.positive_interactions += 1;
        } else if delta < 0 {
            self.negative_interactions += 1;
        }
        self.last_interaction = Some(Utc::now());

        self.affinity
    }
}

const POSITIVE_WORDS: &[&str] = &[
    "ありがとう", "嬉しい", "うれしい", "好き", "楽しい", "優しい", "かわいい", "可愛い",
    "すごい", "素敵", "大丈夫", "頑張", "一緒", "thank", "thanks", "love", "like", "happy",
    "great", "nice", "kind", "cute", "together",
];

const GREETING_WORDS: &[&str] = &[
    "こんにちは", "おはよう", "こんばんは", "おやすみ", "よろしく", "hello", "hi", "good morning",
];

const NEGATIVE_WORDS: &[&str] = &[
    "嫌い", "きらい", "つまらない", "うるさい", "最悪", "面倒", "めんどう", "いらない",
    "hate", "boring", "annoying", "worst", "useless",
];

const RUDE_WORDS: &[&str] = &[
    "バカ", "ばか", "馬鹿", "クソ", "くそ", "死ね", "ウザ", "うざ", "黙れ", "ポンコツ",
    "stupid", "idiot", "shut up", "junk",
];

/// Keyword scorer for user messages.
#[derive(Debug, Clone, Default)]
pub struct SentimentAnalyzer;

impl SentimentAnalyzer {
    pub fn new() -> Self {
        SentimentAnalyzer
    }

    pub fn analyze(&self, message: &str) -> AffinityChange {
        let lowered = message.to_lowercase();
        // Space-padded ASCII view so English words match whole words only.
        let words: String = lowered
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
            .collect();
        let words = format!(" {} ", words.split_whitespace().collect::<Vec<_>>().join(" "));

        let hits = |vocabulary: &[&str]| -> i32 {
            vocabulary
                .iter()
                .filter(|word| {
                    if word.is_ascii() {
                        words.contains(&format!(" {} ", word))
                    } else {
                        lowered.contains(*word)
                    }
                })
                .count() as i32
        };

        let positive = hits(POSITIVE_WORDS);
        let greeting = hits(GREETING_WORDS);
        let negative = hits(NEGATIVE_WORDS);
        let rude = hits(RUDE_WORDS);

        let raw = positive * 2 + greeting - negative * 2 - rude * 5;
        let delta = raw.clamp(-MAX_DELTA, MAX_DELTA);

        let reason = if rude > 0 {
            "乱暴な言葉を向けられた"
        } else if negative > positive {
            "否定的な言葉が多い"
        } else if positive > 0 {
            "好意や感謝の言葉"
        } else if greeting > 0 {
            "挨拶を交わした"
        } else {
            "特に変化なし"
        };

        AffinityChange {
            delta,
            reason: reason.to_string(),
        }
    }

    /// Scores `message` against `relationship` and returns what changed.
    pub fn update(&self, relationship: &mut Relationship, message: &str) -> AffinityChange {
        let change = self.analyze(message);
        relationship.apply(&change);
        change
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_thresholds() {
        assert_eq!(RelationshipStage::from_affinity(0), RelationshipStage::Wary);
        assert_eq!(RelationshipStage::from_affinity(24), RelationshipStage::Wary);
        assert_eq!(RelationshipStage::from_affinity(25), RelationshipStage::Confused);
        assert_eq!(RelationshipStage::from_affinity(49), RelationshipStage::Confused);
        assert_eq!(RelationshipStage::from_affinity(50), RelationshipStage::Trusting);
        assert_eq!(RelationshipStage::from_affinity(74), RelationshipStage::Trusting);
        assert_eq!(RelationshipStage::from_affinity(75), RelationshipStage::Intimate);
        assert_eq!(RelationshipStage::from_affinity(100), RelationshipStage::Intimate);
        assert!(RelationshipStage::Wary < RelationshipStage::Intimate);
    }

    #[test]
    fn test_initial_relationship() {
        let relationship = Relationship::default();
        assert_eq!(relationship.affinity, 30);
        assert_eq!(relationship.stage(), RelationshipStage::Confused);
    }

    #[test]
    fn test_positive_and_rude_messages() {
        let analyzer = SentimentAnalyzer::new();

        let kind = analyzer.analyze("いつもありがとう、本当に嬉しいよ");
        assert!(kind.delta > 0);
        assert_eq!(kind.reason, "好意や感謝の言葉");

        let rude = analyzer.analyze("黙れ、このポンコツ");
        assert!(rude.delta < 0);
        assert_eq!(rude.reason, "乱暴な言葉を向けられた");

        let neutral = analyzer.analyze("今日は雨だね");
        assert_eq!(neutral.delta, 0);
    }

    #[test]
    fn test_english_words_match_whole_words() {
        let analyzer = SentimentAnalyzer::new();
        assert_eq!(analyzer.analyze("this is it").delta, 0);
        assert!(analyzer.analyze("Hi! Thanks a lot").delta > 0);
        assert!(analyzer.analyze("shut up, idiot").delta < 0);
    }

    #[test]
    fn test_delta_is_bounded() {
        let analyzer = SentimentAnalyzer::new();
        let flood = analyzer.analyze("ありがとう 嬉しい 好き 楽しい 優しい かわいい すごい 素敵 thanks love");
        assert_eq!(flood.delta, MAX_DELTA);

        let abuse = analyzer.analyze("バカ クソ 死ね 黙れ stupid idiot");
        assert_eq!(abuse.delta, -MAX_DELTA);
    }

    #[test]
    fn test_affinity_clamped() {
        let analyzer = SentimentAnalyzer::new();

        let mut high = Relationship::with_affinity(98);
        analyzer.update(&mut high, "ありがとう、大好き、楽しい");
        assert_eq!(high.affinity, 100);
        assert_eq!(high.positive_interactions, 1);

        let mut low = Relationship::with_affinity(3);
        analyzer.update(&mut low, "バカ");
        assert_eq!(low.affinity, 0);
        assert_eq!(low.negative_interactions, 1);

        assert_eq!(Relationship::with_affinity(250).affinity, 100);
    }
}
