use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::error::{LetterError, Result};

/// A letter requested by a user and written overnight by the batch scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Letter {
    pub id: String,
    pub user_id: String,
    pub theme: Theme,
    /// Earliest moment the scheduler may generate this letter.
    pub requested_time: DateTime<Utc>,
    pub status: LetterStatus,
    #[serde(default)]
    pub content: Option<String>,
    /// Reason recorded when generation failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_hour: Option<u32>,
    /// Affinity at request time, kept for prompt context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<u8>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// When the scheduler finished with it, successfully or not.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LetterStatus {
    Pending,
    Generated,
    Delivered,
    Failed,
}

impl LetterStatus {
    /// Pending -> Generated -> Delivered, or Pending -> Failed. Nothing else.
    pub fn can_transition(self, to: LetterStatus) -> bool {
        matches!(
            (self, to),
            (LetterStatus::Pending, LetterStatus::Generated)
                | (LetterStatus::Pending, LetterStatus::Failed)
                | (LetterStatus::Generated, LetterStatus::Delivered)
        )
    }
}

impl std::fmt::Display for LetterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LetterStatus::Pending => write!(f, "pending"),
            LetterStatus::Generated => write!(f, "generated"),
            LetterStatus::Delivered => write!(f, "delivered"),
            LetterStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Category tag selecting the prompt used for a letter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Theme {
    Daily,
    Romance,
    Encouragement,
    Gratitude,
    Friendship,
    Family,
    Work,
    Hobby,
    Travel,
    Custom(String),
}

impl Theme {
    pub fn parse(text: &str) -> Theme {
        let trimmed = text.trim();
        match trimmed.to_lowercase().as_str() {
            "daily" | "日常" => Theme::Daily,
            "romance" | "恋愛" => Theme::Romance,
            "encouragement" | "励まし" | "応援" => Theme::Encouragement,
            "gratitude" | "感謝" => Theme::Gratitude,
            "friendship" | "友情" => Theme::Friendship,
            "family" | "家族" => Theme::Family,
            "work" | "仕事" => Theme::Work,
            "hobby" | "趣味" => Theme::Hobby,
            "travel" | "旅行" => Theme::Travel,
            _ => Theme::Custom(trimmed.to_string()),
        }
    }

    /// Wording used inside prompts.
    pub fn prompt_label(&self) -> &str {
        match self {
            Theme::Daily => "日常",
            Theme::Romance => "恋愛",
            Theme::Encouragement => "励まし",
            Theme::Gratitude => "感謝",
            Theme::Friendship => "友情",
            Theme::Family => "家族",
            Theme::Work => "仕事",
            Theme::Hobby => "趣味",
            Theme::Travel => "旅行",
            Theme::Custom(text) => text,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Theme::Custom(text) if text.trim().is_empty())
    }
}

impl std::fmt::Display for Theme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Theme::Daily => write!(f, "daily"),
            Theme::Romance => write!(f, "romance"),
            Theme::Encouragement => write!(f, "encouragement"),
            Theme::Gratitude => write!(f, "gratitude"),
            Theme::Friendship => write!(f, "friendship"),
            Theme::Family => write!(f, "family"),
            Theme::Work => write!(f, "work"),
            Theme::Hobby => write!(f, "hobby"),
            Theme::Travel => write!(f, "travel"),
            Theme::Custom(text) => write!(f, "{}", text),
        }
    }
}

impl From<String> for Theme {
    fn from(value: String) -> Self {
        Theme::parse(&value)
    }
}

impl From<Theme> for String {
    fn from(value: Theme) -> Self {
        value.to_string()
    }
}

impl Letter {
    pub fn new(user_id: &str, theme: Theme, requested_time: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Letter {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            theme,
            requested_time,
            status: LetterStatus::Pending,
            content: None,
            error: None,
            generation_hour: None,
            affinity: None,
            created_at: now,
            updated_at: now,
            generated_at: None,
            delivered_at: None,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == LetterStatus::Pending && self.requested_time <= now
    }

    pub fn transition(&mut self, to: LetterStatus) -> Result<()> {
        if !self.status.can_transition(to) {
            return Err(LetterError::InvalidTransition { from: self.status, to });
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn mark_generated(&mut self, content: String) -> Result<()> {
        self.transition(LetterStatus::Generated)?;
        self.content = Some(content);
        self.generated_at = Some(self.updated_at);
        Ok(())
    }

    /// The fallback text becomes the content the user reads.
    pub fn mark_failed(&mut self, reason: String, fallback: Option<String>) -> Result<()> {
        self.transition(LetterStatus::Failed)?;
        self.error = Some(reason);
        self.content = fallback;
        self.generated_at = Some(self.updated_at);
        Ok(())
    }

    pub fn mark_delivered(&mut self) -> Result<()> {
        self.transition(LetterStatus::Delivered)?;
        self.delivered_at = Some(self.updated_at);
        Ok(())
    }
}

/// Next `hour:00` in `tz` strictly after `now`.
pub fn next_hour_after<Tz: TimeZone>(now: DateTime<Utc>, hour: u32, tz: &Tz) -> Option<DateTime<Utc>> {
    if hour > 23 {
        return None;
    }
    let today = now.with_timezone(tz).date_naive();
    // Two extra days covers a DST gap swallowing the hour.
    for offset in 0..3 {
        let naive = (today + Duration::days(offset)).and_hms_opt(hour, 0, 0)?;
        if let Some(candidate) = tz.from_local_datetime(&naive).earliest() {
            let candidate = candidate.with_timezone(&Utc);
            if candidate > now {
                return Some(candidate);
            }
        }
    }
    None
}
