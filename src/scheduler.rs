use chrono::{DateTime, TimeZone, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::core::{next_hour_after, Letter, LetterError, LetterStore, LetterUpdate, Result};
use crate::generator::{GenerationContext, LetterGenerator};
use crate::rate_limit::DailyQuota;

/// What one batch pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    pub examined: usize,
    pub generated: usize,
    pub failed: usize,
    pub deferred: usize,
    pub duration_ms: u64,
}

enum Outcome {
    Generated,
    Failed,
}

/// Earliest configured `hour:00` in `tz` strictly after `now`.
pub fn next_run_after<Tz: TimeZone>(now: DateTime<Utc>, hours: &[u32], tz: &Tz) -> Option<DateTime<Utc>> {
    hours.iter().filter_map(|hour| next_hour_after(now, *hour, tz)).min()
}

/// Generates due letters at the configured night hours.
pub struct BatchScheduler {
    store: Arc<LetterStore>,
    generator: LetterGenerator,
    schedule_hours: Vec<u32>,
    max_concurrent: usize,
    generation_timeout: Duration,
    budget: DailyQuota<()>,
    fallback: String,
    enabled: bool,
}

impl BatchScheduler {
    pub fn new(store: Arc<LetterStore>, generator: LetterGenerator, config: &Config) -> Self {
        BatchScheduler {
            store,
            generator,
            schedule_hours: config.batch_schedule_hours.clone(),
            max_concurrent: config.max_concurrent_generations.max(1),
            generation_timeout: Duration::from_secs(config.generation_timeout),
            budget: DailyQuota::new(config.max_daily_generations),
            fallback: config.letter_fallback.clone(),
            enabled: config.async_letter_enabled,
        }
    }

    pub fn next_run<Tz: TimeZone>(&self, now: DateTime<Utc>, tz: &Tz) -> Option<DateTime<Utc>> {
        next_run_after(now, &self.schedule_hours, tz)
    }

    /// One pass over every pending letter due at `now`. The daily budget is
    /// counted in `tz` and includes letters other processes already wrote.
    pub async fn run_batch<Tz: TimeZone>(&self, now: DateTime<Utc>, tz: &Tz) -> Result<BatchReport> {
        if !self.enabled {
            info!("Letter generation is disabled, skipping batch");
            return Ok(BatchReport::default());
        }

        let started = Instant::now();
        match self.store.backup() {
            Ok(Some(path)) => debug!("Pre-batch backup at {}", path.display()),
            Ok(None) => debug!("Nothing to back up yet"),
            Err(e) => error!("Pre-batch backup failed, continuing: {}", e),
        }

        let due = self.store.pending_due(now)?;
        let mut report = BatchReport {
            examined: due.len(),
            ..Default::default()
        };
        if due.is_empty() {
            info!("No letters due at {}", now);
            return Ok(report);
        }

        let today = now.with_timezone(tz).date_naive();
        let written = self.store.count_generations_on(today, tz)?;
        self.budget.seed(&(), today, written);

        let mut admitted = Vec::new();
        for letter in due {
            if self.budget.try_acquire(&(), today) {
                admitted.push(letter);
            } else {
                report.deferred += 1;
            }
        }
        if report.deferred > 0 {
            warn!(
                "Daily generation budget of {} reached, deferring {} letters",
                self.budget.limit(),
                report.deferred
            );
        }

        info!(
            "Generating {} letters ({} at a time, {} left in today's budget)",
            admitted.len(),
            self.max_concurrent,
            self.budget.remaining(&(), today)
        );
        let outcomes: Vec<Outcome> = stream::iter(admitted)
            .map(|letter| self.process(letter))
            .buffer_unordered(self.max_concurrent)
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                Outcome::Generated => report.generated += 1,
                Outcome::Failed => report.failed += 1,
            }
        }
        report.duration_ms = started.elapsed().as_millis() as u64;

        info!(
            "Batch finished: {} examined, {} generated, {} failed, {} deferred",
            report.examined, report.generated, report.failed, report.deferred
        );
        Ok(report)
    }

    async fn process(&self, letter: Letter) -> Outcome {
        let context = self.context_for(&letter);

        let result = match tokio::time::timeout(self.generation_timeout, self.generator.generate(&context)).await {
            Ok(Ok(content)) => Ok(content),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("generation timed out after {}s", self.generation_timeout.as_secs())),
        };

        let (update, outcome) = match result {
            Ok(content) => (LetterUpdate::Generated { content }, Outcome::Generated),
            Err(reason) => {
                warn!("Letter {} failed: {}", letter.id, reason);
                (
                    LetterUpdate::Failed {
                        reason,
                        fallback: Some(self.fallback.clone()),
                    },
                    Outcome::Failed,
                )
            }
        };

        match self.store.update(&letter.id, update) {
            Ok(updated) => {
                info!("Letter {} for {} is {}", updated.id, updated.user_id, updated.status);
                outcome
            }
            Err(e) => {
                error!("Could not record result for letter {}: {}", letter.id, e);
                Outcome::Failed
            }
        }
    }

    fn context_for(&self, letter: &Letter) -> GenerationContext {
        let previous_themes = match self.store.letters_for_user(&letter.user_id, Some(4)) {
            Ok(letters) => letters
                .into_iter()
                .filter(|other| other.id != letter.id)
                .map(|other| other.theme)
                .take(2)
                .collect(),
            Err(e) => {
                warn!("Could not read earlier letters of {}: {}", letter.user_id, e);
                Vec::new()
            }
        };

        GenerationContext {
            theme: letter.theme.clone(),
            affinity: letter.affinity,
            previous_themes,
        }
    }

    /// Catches up on overdue letters, then runs a batch at every scheduled
    /// hour in `tz` until `shutdown` resolves.
    pub async fn run<Tz, F>(&self, tz: &Tz, shutdown: F) -> Result<()>
    where
        Tz: TimeZone,
        F: Future<Output = ()>,
    {
        self.run_with_clock(tz, Utc::now, shutdown).await
    }

    async fn run_with_clock<Tz, C, F>(&self, tz: &Tz, clock: C, shutdown: F) -> Result<()>
    where
        Tz: TimeZone,
        C: Fn() -> DateTime<Utc>,
        F: Future<Output = ()>,
    {
        if !self.enabled {
            info!("Letter generation is disabled, scheduler not started");
            return Ok(());
        }
        tokio::pin!(shutdown);

        match self.run_batch(clock(), tz).await {
            Ok(report) if report.examined > 0 => info!("Catch-up batch: {:?}", report),
            Ok(_) => {}
            Err(e) => error!("Catch-up batch failed: {}", e),
        }

        loop {
            let now = clock();
            let next = self
                .next_run(now, tz)
                .ok_or_else(|| LetterError::Config(format!("no usable batch hours in {:?}", self.schedule_hours)))?;
            let wait = (next - now).to_std().unwrap_or_default();
            info!("Next batch at {}", next);

            tokio::select! {
                _ = &mut shutdown => {
                    info!("Scheduler shutting down");
                    return Ok(());
                }
                _ = tokio::time::sleep(wait) => {}
            }

            if let Err(e) = self.run_batch(clock(), tz).await {
                error!("Batch failed: {}", e);
            }
        }
    }
}
