use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::error::{LetterError, Result};
use super::letter::{Letter, LetterStatus};

const STORE_VERSION: u32 = 1;
const MAX_BACKUPS: usize = 10;

/// On-disk document. One file holds every letter of every user.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreDocument {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    letters: BTreeMap<String, Letter>,
}

/// Field changes the scheduler and readers may apply to a stored letter.
#[derive(Debug, Clone)]
pub enum LetterUpdate {
    Generated { content: String },
    Failed { reason: String, fallback: Option<String> },
    Delivered,
}

impl LetterUpdate {
    fn target(&self) -> LetterStatus {
        match self {
            LetterUpdate::Generated { .. } => LetterStatus::Generated,
            LetterUpdate::Failed { .. } => LetterStatus::Failed,
            LetterUpdate::Delivered => LetterStatus::Delivered,
        }
    }

    fn apply(self, letter: &mut Letter) -> Result<()> {
        match self {
            LetterUpdate::Generated { content } => letter.mark_generated(content),
            LetterUpdate::Failed { reason, fallback } => letter.mark_failed(reason, fallback),
            LetterUpdate::Delivered => letter.mark_delivered(),
        }
    }
}

/// JSON file storage for letters.
///
/// Writers inside this process are serialised; separate processes sharing the
/// file are last-writer-wins.
pub struct LetterStore {
    path: PathBuf,
    backup_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl LetterStore {
    pub fn new(path: PathBuf, backup_dir: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        Ok(Self {
            path,
            backup_dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All letters keyed by id. Unreadable or corrupted files count as empty.
    pub fn load(&self) -> HashMap<String, Letter> {
        let _guard = self.lock();
        match self.read_document() {
            Ok(document) => document.letters.into_iter().collect(),
            Err(e) => {
                error!("Failed to read letter store {}: {}", self.path.display(), e);
                HashMap::new()
            }
        }
    }

    /// Replace the whole document.
    pub fn save(&self, letters: &HashMap<String, Letter>) -> Result<()> {
        let _guard = self.lock();
        let document = StoreDocument {
            version: STORE_VERSION,
            letters: letters.iter().map(|(id, l)| (id.clone(), l.clone())).collect(),
        };
        self.write_document(&document)
    }

    pub fn append(&self, letter: Letter) -> Result<()> {
        let _guard = self.lock();
        let mut document = self.read_document()?;

        if document.letters.contains_key(&letter.id) {
            return Err(LetterError::Duplicate(letter.id));
        }

        debug!("Appending letter {} for user {}", letter.id, letter.user_id);
        document.letters.insert(letter.id.clone(), letter);
        self.write_document(&document)
    }

    /// Apply `update` to one letter. Illegal transitions leave the file untouched.
    pub fn update(&self, id: &str, update: LetterUpdate) -> Result<Letter> {
        let _guard = self.lock();
        let mut document = self.read_document()?;

        let letter = document
            .letters
            .get_mut(id)
            .ok_or_else(|| LetterError::NotFound(id.to_string()))?;

        let target = update.target();
        update.apply(letter)?;
        let updated = letter.clone();

        self.write_document(&document)?;
        debug!("Letter {} is now {}", id, target);
        Ok(updated)
    }

    pub fn get(&self, id: &str) -> Result<Letter> {
        let _guard = self.lock();
        self.read_document()?
            .letters
            .remove(id)
            .ok_or_else(|| LetterError::NotFound(id.to_string()))
    }

    /// A user's letters, newest first.
    pub fn letters_for_user(&self, user_id: &str, limit: Option<usize>) -> Result<Vec<Letter>> {
        let _guard = self.lock();
        let mut letters: Vec<Letter> = self
            .read_document()?
            .letters
            .into_values()
            .filter(|letter| letter.user_id == user_id)
            .collect();
        letters.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        if let Some(limit) = limit {
            letters.truncate(limit);
        }
        Ok(letters)
    }

    /// Pending letters whose requested time has passed, oldest request first.
    pub fn pending_due(&self, now: DateTime<Utc>) -> Result<Vec<Letter>> {
        let _guard = self.lock();
        let mut due: Vec<Letter> = self
            .read_document()?
            .letters
            .into_values()
            .filter(|letter| letter.is_due(now))
            .collect();
        due.sort_by(|a, b| a.requested_time.cmp(&b.requested_time));
        Ok(due)
    }

    /// Requests a user created on `date` in `tz`.
    pub fn count_requests_on<Tz: TimeZone>(&self, user_id: &str, date: NaiveDate, tz: &Tz) -> Result<u32> {
        let _guard = self.lock();
        let count = self
            .read_document()?
            .letters
            .values()
            .filter(|letter| letter.user_id == user_id)
            .filter(|letter| letter.created_at.with_timezone(tz).date_naive() == date)
            .count();
        Ok(count as u32)
    }

    /// Letters the scheduler finished on `date` in `tz`, failures included.
    pub fn count_generations_on<Tz: TimeZone>(&self, date: NaiveDate, tz: &Tz) -> Result<u32> {
        let _guard = self.lock();
        let count = self
            .read_document()?
            .letters
            .values()
            .filter_map(|letter| letter.generated_at)
            .filter(|at| at.with_timezone(tz).date_naive() == date)
            .count();
        Ok(count as u32)
    }

    /// Returns a letter for reading. A generated letter becomes delivered in
    /// the same locked step, so concurrent readers all succeed.
    pub fn deliver(&self, id: &str) -> Result<Letter> {
        let _guard = self.lock();
        let mut document = self.read_document()?;

        let letter = document
            .letters
            .get_mut(id)
            .ok_or_else(|| LetterError::NotFound(id.to_string()))?;
        if letter.status != LetterStatus::Generated {
            return Ok(letter.clone());
        }

        letter.mark_delivered()?;
        let delivered = letter.clone();
        self.write_document(&document)?;
        debug!("Letter {} delivered", id);
        Ok(delivered)
    }

    /// Copy the current file into the backup directory. Keeps the newest backups only.
    pub fn backup(&self) -> Result<Option<PathBuf>> {
        let _guard = self.lock();
        if !self.path.exists() {
            return Ok(None);
        }

        std::fs::create_dir_all(&self.backup_dir)?;
        let name = format!("letters-{}.json", Utc::now().format("%Y%m%dT%H%M%S%.3f"));
        let target = self.backup_dir.join(name);
        std::fs::copy(&self.path, &target)?;
        info!("Backed up letter store to {}", target.display());

        self.prune_backups()?;
        Ok(Some(target))
    }

    fn prune_backups(&self) -> Result<()> {
        let mut backups: Vec<PathBuf> = std::fs::read_dir(&self.backup_dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .map_or(false, |n| n.starts_with("letters-") && n.ends_with(".json"))
            })
            .collect();

        if backups.len() <= MAX_BACKUPS {
            return Ok(());
        }

        // Timestamped names sort chronologically.
        backups.sort();
        let excess = backups.len() - MAX_BACKUPS;
        for old in backups.into_iter().take(excess) {
            if let Err(e) = std::fs::remove_file(&old) {
                warn!("Failed to remove old backup {}: {}", old.display(), e);
            }
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Callers hold the lock.
    fn read_document(&self) -> Result<StoreDocument> {
        let content = match std::fs::read(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(StoreDocument::default()),
            Err(e) => return Err(e.into()),
        };

        if content.iter().all(u8::is_ascii_whitespace) {
            return Ok(StoreDocument::default());
        }

        match serde_json::from_slice::<StoreDocument>(&content) {
            Ok(document) => Ok(document),
            Err(e) => {
                warn!("Letter store {} is corrupted ({}), starting empty", self.path.display(), e);
                self.quarantine();
                Ok(StoreDocument::default())
            }
        }
    }

    /// Moves the unreadable file out of the way so it is set aside only once.
    fn quarantine(&self) {
        let mut name = self.path.clone().into_os_string();
        name.push(format!(".corrupt-{}", Utc::now().format("%Y%m%dT%H%M%S%.3f")));
        let target = PathBuf::from(name);
        if let Err(e) = std::fs::rename(&self.path, &target) {
            warn!("Failed to set aside corrupted store: {}", e);
        } else {
            info!("Corrupted store moved to {}", target.display());
        }
    }

    fn write_document(&self, document: &StoreDocument) -> Result<()> {
        let content = serde_json::to_string_pretty(document)?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let result = std::fs::write(&tmp, content).and_then(|_| std::fs::rename(&tmp, &self.path));
        if let Err(e) = result {
            error!("Failed to write letter store {}: {}", self.path.display(), e);
            return Err(e.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::letter::Theme;
    use chrono::Duration;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> LetterStore {
        LetterStore::new(dir.path().join("letters.json"), dir.path().join("backup")).unwrap()
    }

    fn letter(user: &str, requested: DateTime<Utc>) -> Letter {
        Letter::new(user, Theme::Daily, requested, Utc::now())
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        assert!(store.load().is_empty());
        assert!(store.pending_due(Utc::now()).unwrap().is_empty());
    }

    #[test]
    fn test_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        let mut letters = HashMap::new();
        let mut generated = letter("a", Utc::now());
        generated.mark_generated("本文".to_string()).unwrap();
        for l in [letter("a", Utc::now()), letter("b", Utc::now()), generated] {
            letters.insert(l.id.clone(), l);
        }

        store.save(&letters).unwrap();
        assert_eq!(store.load(), letters);
    }

    #[test]
    fn test_corrupted_file_is_empty_and_set_aside() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        std::fs::write(store.path(), "{ not json").unwrap();

        assert!(store.load().is_empty());

        let set_aside = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().contains(".corrupt-"));
        assert!(set_aside);

        // Writes still work afterwards.
        store.append(letter("a", Utc::now())).unwrap();
        assert_eq!(store.load().len(), 1);
    }

    fn corrupt_copies(dir: &TempDir) -> usize {
        std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".corrupt-"))
            .count()
    }

    #[test]
    fn test_non_utf8_file_is_treated_as_corrupted() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        std::fs::write(store.path(), [0xff, 0xfe, 0x7b, 0x00, 0x80]).unwrap();

        assert!(store.pending_due(Utc::now()).unwrap().is_empty());
        store.append(letter("a", Utc::now())).unwrap();
        assert_eq!(store.load().len(), 1);
        assert_eq!(corrupt_copies(&dir), 1);
    }

    #[test]
    fn test_corrupted_file_is_set_aside_once() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        std::fs::write(store.path(), "{ not json").unwrap();

        for _ in 0..3 {
            assert!(store.pending_due(Utc::now()).unwrap().is_empty());
            assert!(store.letters_for_user("a", None).unwrap().is_empty());
        }
        assert!(!store.path().exists());
        assert_eq!(corrupt_copies(&dir), 1);
    }

    #[test]
    fn test_append_rejects_duplicate() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let l = letter("a", Utc::now());
        store.append(l.clone()).unwrap();
        assert!(matches!(store.append(l), Err(LetterError::Duplicate(_))));
    }

    #[test]
    fn test_update_enforces_transitions() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let l = letter("a", Utc::now());
        let id = l.id.clone();
        store.append(l).unwrap();

        let updated = store
            .update(&id, LetterUpdate::Generated { content: "手紙".to_string() })
            .unwrap();
        assert_eq!(updated.status, LetterStatus::Generated);

        let err = store
            .update(&id, LetterUpdate::Failed { reason: "late".to_string(), fallback: None })
            .unwrap_err();
        assert!(matches!(err, LetterError::InvalidTransition { .. }));

        // Nothing was persisted by the rejected update.
        let stored = store.get(&id).unwrap();
        assert_eq!(stored.status, LetterStatus::Generated);
        assert_eq!(stored.content.as_deref(), Some("手紙"));
        assert!(stored.error.is_none());
    }

    #[test]
    fn test_update_unknown_id() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let err = store.update("missing", LetterUpdate::Delivered).unwrap_err();
        assert!(matches!(err, LetterError::NotFound(_)));
    }

    #[test]
    fn test_pending_due_ordering_and_filtering() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let now = Utc::now();

        let later = letter("a", now - Duration::hours(1));
        let earlier = letter("b", now - Duration::hours(3));
        let future = letter("c", now + Duration::hours(2));
        let mut done = letter("d", now - Duration::hours(5));
        done.mark_generated("x".to_string()).unwrap();

        for l in [later.clone(), earlier.clone(), future, done] {
            store.append(l).unwrap();
        }

        let due = store.pending_due(now).unwrap();
        let ids: Vec<_> = due.iter().map(|l| l.id.clone()).collect();
        assert_eq!(ids, vec![earlier.id, later.id]);
    }

    #[test]
    fn test_letters_for_user_newest_first() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let now = Utc::now();

        let old = Letter::new("a", Theme::Daily, now, now - Duration::days(2));
        let new = Letter::new("a", Theme::Romance, now, now);
        store.append(old.clone()).unwrap();
        store.append(new.clone()).unwrap();
        store.append(letter("b", now)).unwrap();

        let letters = store.letters_for_user("a", None).unwrap();
        assert_eq!(letters.len(), 2);
        assert_eq!(letters[0].id, new.id);
        assert_eq!(letters[1].id, old.id);

        assert_eq!(store.letters_for_user("a", Some(1)).unwrap().len(), 1);
    }

    #[test]
    fn test_count_requests_on() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let now = Utc::now();

        store.append(Letter::new("a", Theme::Daily, now, now)).unwrap();
        store.append(Letter::new("a", Theme::Daily, now, now - Duration::days(1))).unwrap();
        store.append(Letter::new("b", Theme::Daily, now, now)).unwrap();

        assert_eq!(store.count_requests_on("a", now.date_naive(), &Utc).unwrap(), 1);
        assert_eq!(store.count_requests_on("c", now.date_naive(), &Utc).unwrap(), 0);
    }

    #[test]
    fn test_count_generations_on() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let now = Utc::now();

        let mut generated = letter("a", now);
        generated.mark_generated("本文".to_string()).unwrap();
        let mut failed = letter("b", now);
        failed.mark_failed("timeout".to_string(), None).unwrap();
        let mut delivered = letter("c", now);
        delivered.mark_generated("本文".to_string()).unwrap();
        delivered.mark_delivered().unwrap();
        let mut yesterday = letter("d", now);
        yesterday.mark_generated("本文".to_string()).unwrap();
        yesterday.generated_at = Some(now - Duration::days(1));

        for l in [generated, failed, delivered, yesterday, letter("e", now)] {
            store.append(l).unwrap();
        }

        let today = Utc::now().date_naive();
        assert_eq!(store.count_generations_on(today, &Utc).unwrap(), 3);
    }

    #[test]
    fn test_deliver_concurrent_readers() {
        let dir = TempDir::new().unwrap();
        let store = std::sync::Arc::new(store_in(&dir));
        let mut l = letter("a", Utc::now());
        l.mark_generated("本文".to_string()).unwrap();
        let id = l.id.clone();
        store.append(l).unwrap();

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                let id = id.clone();
                std::thread::spawn(move || store.deliver(&id))
            })
            .collect();
        for reader in readers {
            let read = reader.join().unwrap().unwrap();
            assert_eq!(read.status, LetterStatus::Delivered);
            assert_eq!(read.content.as_deref(), Some("本文"));
        }

        let pending = letter("b", Utc::now());
        let pending_id = pending.id.clone();
        store.append(pending).unwrap();
        assert_eq!(store.deliver(&pending_id).unwrap().status, LetterStatus::Pending);
        assert!(matches!(store.deliver("missing"), Err(LetterError::NotFound(_))));
    }

    #[test]
    fn test_backup_keeps_newest() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        assert!(store.backup().unwrap().is_none());

        store.append(letter("a", Utc::now())).unwrap();
        for _ in 0..(MAX_BACKUPS + 3) {
            std::thread::sleep(std::time::Duration::from_millis(2));
            store.backup().unwrap();
        }

        let count = std::fs::read_dir(dir.path().join("backup")).unwrap().count();
        assert_eq!(count, MAX_BACKUPS);
    }
}
