use chrono::NaiveDate;
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Per-key counter that starts over on each calendar day.
#[derive(Debug)]
pub struct DailyQuota<K> {
    limit: u32,
    state: Mutex<QuotaState<K>>,
}

#[derive(Debug)]
struct QuotaState<K> {
    day: Option<NaiveDate>,
    used: HashMap<K, u32>,
}

impl<K: Hash + Eq + Clone> DailyQuota<K> {
    pub fn new(limit: u32) -> Self {
        DailyQuota {
            limit,
            state: Mutex::new(QuotaState {
                day: None,
                used: HashMap::new(),
            }),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Takes one unit for `key` on `today`; false once the limit is reached.
    pub fn try_acquire(&self, key: &K, today: NaiveDate) -> bool {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.roll_over(today);

        let used = state.used.entry(key.clone()).or_insert(0);
        if *used >= self.limit {
            return false;
        }
        *used += 1;
        true
    }

    /// Raises the count for `key` on `today` to at least `used`, for usage
    /// recorded outside this process.
    pub fn seed(&self, key: &K, today: NaiveDate, used: u32) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.roll_over(today);

        let current = state.used.entry(key.clone()).or_insert(0);
        *current = (*current).max(used);
    }

    pub fn remaining(&self, key: &K, today: NaiveDate) -> u32 {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.roll_over(today);
        self.limit.saturating_sub(state.used.get(key).copied().unwrap_or(0))
    }
}

impl<K> QuotaState<K> {
    fn roll_over(&mut self, today: NaiveDate) {
        if self.day != Some(today) {
            self.day = Some(today);
            self.used.clear();
        }
    }
}

pub const CHAT_LIMIT: usize = 10;
pub const CHAT_WINDOW: Duration = Duration::from_secs(60);
pub const SLOW_DOWN_REPLY: &str = "（…少し話すのが速すぎる。もう少し、ゆっくり話してくれないか？）";

/// Sliding-window pacing for one chat session.
#[derive(Debug, Clone)]
pub struct ChatLimiter {
    limit: usize,
    window: Duration,
    sent: VecDeque<Instant>,
}

impl Default for ChatLimiter {
    fn default() -> Self {
        Self::new(CHAT_LIMIT, CHAT_WINDOW)
    }
}

impl ChatLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        ChatLimiter {
            limit,
            window,
            sent: VecDeque::new(),
        }
    }

    pub fn check(&mut self) -> bool {
        self.check_at(Instant::now())
    }

    /// Records a message at `now` if the window has room.
    pub fn check_at(&mut self, now: Instant) -> bool {
        while let Some(oldest) = self.sent.front() {
            if now.duration_since(*oldest) >= self.window {
                self.sent.pop_front();
            } else {
                break;
            }
        }
        if self.sent.len() >= self.limit {
            return false;
        }
        self.sent.push_back(now);
        true
    }

    pub fn reset(&mut self) {
        self.sent.clear();
    }
}
