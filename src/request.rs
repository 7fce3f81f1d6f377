use chrono::{DateTime, TimeZone, Utc};
use std::sync::{Arc, Mutex};
use tracing::info;

use crate::config::Config;
use crate::core::{next_hour_after, Letter, LetterError, LetterStore, Result, Theme};

/// Admission and lookup of letter requests.
pub struct RequestManager {
    store: Arc<LetterStore>,
    schedule_hours: Vec<u32>,
    max_daily_requests: u32,
    min_affinity: u8,
    admission: Mutex<()>,
}

impl RequestManager {
    pub fn new(store: Arc<LetterStore>, config: &Config) -> Self {
        RequestManager {
            store,
            schedule_hours: config.batch_schedule_hours.clone(),
            max_daily_requests: config.max_daily_requests,
            min_affinity: config.letter_min_affinity,
            admission: Mutex::new(()),
        }
    }

    /// Queues a letter for the next `hour:00` in `tz`.
    pub fn submit<Tz: TimeZone>(
        &self,
        user_id: &str,
        theme_text: &str,
        hour: u32,
        affinity: u8,
        now: DateTime<Utc>,
        tz: &Tz,
    ) -> Result<Letter> {
        let theme = Theme::parse(theme_text);
        if user_id.trim().is_empty() {
            return Err(LetterError::InvalidRequest("user id is empty".to_string()));
        }
        if theme.is_empty() {
            return Err(LetterError::InvalidRequest("theme is empty".to_string()));
        }
        if !self.schedule_hours.contains(&hour) {
            return Err(LetterError::InvalidRequest(format!(
                "hour {} is not one of the batch hours {:?}",
                hour, self.schedule_hours
            )));
        }
        if affinity < self.min_affinity {
            return Err(LetterError::AffinityTooLow {
                current: affinity,
                required: self.min_affinity,
            });
        }

        let _guard = match self.admission.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let today = now.with_timezone(tz).date_naive();
        let used = self.store.count_requests_on(user_id, today, tz)?;
        if used >= self.max_daily_requests {
            return Err(LetterError::RateLimited {
                user_id: user_id.to_string(),
                limit: self.max_daily_requests,
            });
        }

        let requested_time = next_hour_after(now, hour, tz)
            .ok_or_else(|| LetterError::InvalidRequest(format!("no upcoming {}:00", hour)))?;

        let mut letter = Letter::new(user_id, theme, requested_time, now);
        letter.generation_hour = Some(hour);
        letter.affinity = Some(affinity);
        self.store.append(letter.clone())?;

        info!(
            "Accepted letter request {} from {} for {} ({} of {} today)",
            letter.id,
            user_id,
            letter.requested_time,
            used + 1,
            self.max_daily_requests
        );
        Ok(letter)
    }

    /// The user's most recent request made today, if any.
    pub fn status<Tz: TimeZone>(&self, user_id: &str, now: DateTime<Utc>, tz: &Tz) -> Result<Option<Letter>> {
        let today = now.with_timezone(tz).date_naive();
        Ok(self
            .store
            .letters_for_user(user_id, None)?
            .into_iter()
            .find(|letter| letter.created_at.with_timezone(tz).date_naive() == today))
    }

    pub fn history(&self, user_id: &str, limit: usize) -> Result<Vec<Letter>> {
        self.store.letters_for_user(user_id, Some(limit))
    }

    /// Returns the letter; a generated one is marked delivered on first read.
    pub fn read(&self, letter_id: &str) -> Result<Letter> {
        self.store.deliver(letter_id)
    }
}
