use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;

use crate::ai_provider::ChatMessage;

pub const DEFAULT_HISTORY_THRESHOLD: usize = 10;
const KEEP_RECENT: usize = 4;
const MAX_EXTRACTED: usize = 15;
const MAX_CACHED: usize = 20;

const STOP_WORDS: &[&str] = &[
    "これ", "それ", "あれ", "この", "その", "あの", "ここ", "そこ", "あそこ", "どこ",
    "いつ", "なに", "なぜ", "ちょっと", "とても", "すごく", "かなり", "もう", "まだ",
    "でも", "しかし", "だから", "そして", "また", "さらに", "あたし", "お前", "ユーザー",
    "システム", "アプリ", "the", "and", "you", "that", "this", "with", "for",
];

const CATEGORY_WORDS: &[(&str, &[&str])] = &[
    ("food", &["コーヒー", "お茶", "紅茶", "ケーキ", "パン", "料理", "食べ物", "飲み物"]),
    ("hobby", &["読書", "映画", "音楽", "ゲーム", "スポーツ", "散歩", "旅行"]),
    ("emotion", &["嬉しい", "悲しい", "楽しい", "怒り", "不安", "安心", "幸せ"]),
    ("place", &["家", "学校", "会社", "公園", "カフェ", "図書館", "駅", "街"]),
    ("time", &["朝", "昼", "夜", "今日", "明日", "昨日", "週末", "平日"]),
    ("color", &["赤", "青", "緑", "黄色", "白", "黒", "ピンク", "紫"]),
    ("weather", &["晴れ", "雨", "曇り", "雪", "暑い", "寒い", "暖かい", "涼しい"]),
];

/// Something worth remembering beyond the keyword cache, such as a letter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportantMemory {
    pub kind: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryManager {
    pub history_threshold: usize,
    keywords: Vec<String>,
    important: Vec<ImportantMemory>,
}

impl Default for MemoryManager {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_THRESHOLD)
    }
}

impl MemoryManager {
    pub fn new(history_threshold: usize) -> Self {
        MemoryManager {
            history_threshold,
            keywords: Vec::new(),
            important: Vec::new(),
        }
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    pub fn important_memories(&self) -> &[ImportantMemory] {
        &self.important
    }

    pub fn should_compress(&self, messages: &[ChatMessage]) -> bool {
        messages.iter().filter(|m| m.role == "user").count() >= self.history_threshold
    }

    /// Folds everything but the last few messages into the keyword cache and
    /// returns the messages that remain.
    pub fn compress(&mut self, messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
        if !self.should_compress(&messages) || messages.len() <= KEEP_RECENT {
            return messages;
        }

        let split = messages.len() - KEEP_RECENT;
        let text = messages[..split]
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        let extracted = extract_important_words(&text);

        for word in &extracted {
            if !self.keywords.contains(word) {
                self.keywords.push(word.clone());
            }
        }
        if self.keywords.len() > MAX_CACHED {
            let excess = self.keywords.len() - MAX_CACHED;
            self.keywords.drain(..excess);
        }

        info!("Compressed {} messages into keywords: {:?}", split, extracted);
        messages[split..].to_vec()
    }

    pub fn add_important_memory(&mut self, kind: &str, content: &str) {
        self.important.push(ImportantMemory {
            kind: kind.to_string(),
            content: content.to_string(),
        });
    }

    /// Text for the prompt's memory section; empty when nothing is remembered.
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if !self.keywords.is_empty() {
            parts.push(format!("過去の会話で言及された重要な要素: {}", self.keywords.join("、")));
        }
        for memory in &self.important {
            parts.push(format!("[{}] {}", memory.kind, memory.content));
        }
        parts.join("\n")
    }

    pub fn clear(&mut self) {
        self.keywords.clear();
        self.important.clear();
    }
}

fn is_katakana(c: char) -> bool {
    ('\u{30A1}'..='\u{30F6}').contains(&c) || c == 'ー'
}

fn is_kanji(c: char) -> bool {
    ('\u{4E00}'..='\u{9FAF}').contains(&c)
}

/// Runs of one character class: ASCII letters (3+), katakana (2+) or kanji (2+).
fn candidate_runs(text: &str) -> Vec<String> {
    let mut runs = Vec::new();
    let mut current = String::new();
    let mut class = 0u8;

    let mut flush = |current: &mut String, class: u8| {
        let len = current.chars().count();
        let min = if class == 1 { 3 } else { 2 };
        if class != 0 && len >= min {
            runs.push(current.clone());
        }
        current.clear();
    };

    for c in text.chars() {
        let next = if c.is_ascii_alphabetic() {
            1
        } else if is_katakana(c) {
            2
        } else if is_kanji(c) {
            3
        } else {
            0
        };
        if next != class {
            flush(&mut current, class);
            class = next;
        }
        if next != 0 {
            current.push(c);
        }
    }
    flush(&mut current, class);
    runs
}

/// Up to 15 words ranked by frequency, with a bonus for category vocabulary
/// and long words.
pub fn extract_important_words(text: &str) -> Vec<String> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    let mut order: Vec<String> = Vec::new();

    let mut record = |word: String| {
        if !counts.contains_key(&word) {
            order.push(word.clone());
        }
        *counts.entry(word).or_insert(0) += 1;
    };

    for run in candidate_runs(text) {
        record(run);
    }
    for (_, words) in CATEGORY_WORDS {
        for word in words.iter().filter(|w| text.contains(**w)) {
            record(word.to_string());
        }
    }

    let is_category = |word: &str| CATEGORY_WORDS.iter().any(|(_, words)| words.contains(&word));
    let score = |word: &str| {
        let mut score = counts.get(word).copied().unwrap_or(0);
        if is_category(word) {
            score += 2;
        }
        if word.chars().count() >= 4 {
            score += 1;
        }
        score
    };

    let mut words: Vec<String> = order
        .into_iter()
        .filter(|w| w.chars().count() >= 2 || is_category(w))
        .filter(|w| !STOP_WORDS.contains(&w.to_lowercase().as_str()))
        .collect();
    // Stable sort keeps first-seen order among equal scores.
    words.sort_by(|a, b| score(b).cmp(&score(a)));
    words.truncate(MAX_EXTRACTED);
    words
}
