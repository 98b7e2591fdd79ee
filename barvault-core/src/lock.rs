//! Cross-process, reentrant, timeout-bounded locking.
//!
//! Two layers cooperate:
//!
//! 1. An OS advisory lock (`flock(LOCK_EX)`) on `{lock_dir}/{blake3(key)}.lock`.
//!    It excludes other processes, and also the async adapter in this
//!    process: `flock` conflicts across independently opened descriptors.
//! 2. A process-wide registry keyed by lock-file path. It makes acquisition
//!    reentrant for the owning thread and lets other threads park on a
//!    condvar instead of hammering the file.
//!
//! Stale holders: the kernel drops `flock` locks when a process dies, so a
//! crashed process never leaves a lock behind. Inside a process, a holder
//! whose heartbeat is older than its TTL (for example a leaked guard) is
//! presumed dead and the next waiter reclaims the entry. Long-running
//! holders call [`LockGuard::renew`] or run under [`LockGuard::keep_alive`];
//! a holder that was reclaimed anyway finds out from
//! [`LockGuard::ensure_held`] and must not write.

use crate::error::StoreError;
use chrono::NaiveDateTime;
use parking_lot::{Condvar, Mutex};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::OnceLock;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default time a holder may go without renewing before it is presumed dead.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(600);

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(20);
const POLL_JITTER_MS: u64 = 10;

/// Diagnostic record written into a held lock file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockToken {
    pub key: String,
    pub path: PathBuf,
    pub owner: String,
    pub acquired_at: NaiveDateTime,
    pub heartbeat_at: NaiveDateTime,
    pub ttl_ms: u64,
}

impl LockToken {
    pub(crate) fn new(key: &str, path: &Path, ttl: Duration) -> Self {
        let now = chrono::Utc::now().naive_utc();
        Self {
            key: key.to_string(),
            path: path.to_path_buf(),
            owner: owner_id(),
            acquired_at: now,
            heartbeat_at: now,
            ttl_ms: ttl.as_millis() as u64,
        }
    }

    /// Whether the holder missed its heartbeat as of `now`.
    pub fn is_expired(&self, now: NaiveDateTime) -> bool {
        now - self.heartbeat_at > chrono::Duration::milliseconds(self.ttl_ms as i64)
    }
}

fn owner_id() -> String {
    format!("pid{}:{:?}", std::process::id(), thread::current().id())
}

/// Lock-file path for a logical lock name.
pub fn lock_path_for(lock_dir: &Path, key: &str) -> PathBuf {
    lock_dir.join(format!("{}.lock", blake3::hash(key.as_bytes()).to_hex()))
}

/// An exclusive `flock` on an open lock file. Unlocked on drop.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Single non-blocking attempt. `Ok(None)` means somebody else holds it.
    pub fn try_acquire(path: &Path) -> io::Result<Option<FileLock>> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        Ok(Self::try_lock(file, path)?.ok())
    }

    /// Non-blocking `flock` on an already open lock file. On contention the
    /// file comes back in `Err` so the caller can retry without reopening.
    pub fn try_lock(file: File, path: &Path) -> io::Result<Result<FileLock, File>> {
        // SAFETY: `file` owns a valid descriptor for the duration of the call.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc == 0 {
            return Ok(Ok(FileLock {
                file,
                path: path.to_path_buf(),
            }));
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(code) if code == libc::EWOULDBLOCK || code == libc::EINTR => Ok(Err(file)),
            _ => Err(err),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the lock file's contents with `token`.
    pub fn write_token(&mut self, token: &LockToken) -> io::Result<()> {
        let json = serde_json::to_vec(token).map_err(io::Error::other)?;
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&json)?;
        self.file.flush()
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // SAFETY: the descriptor is still open; closing it would also unlock.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

struct Held {
    owner: ThreadId,
    depth: u32,
    generation: u64,
    heartbeat: Instant,
    ttl: Duration,
    token: LockToken,
    file: FileLock,
}

struct Registry {
    held: Mutex<HashMap<PathBuf, Held>>,
    released: Condvar,
}

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static GENERATION: AtomicU64 = AtomicU64::new(1);

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| Registry {
        held: Mutex::new(HashMap::new()),
        released: Condvar::new(),
    })
}

/// Hands out [`LockGuard`]s for named keys.
#[derive(Debug, Clone)]
pub struct LockManager {
    lock_dir: PathBuf,
    ttl: Duration,
    poll_interval: Duration,
}

impl LockManager {
    pub fn new(lock_dir: impl Into<PathBuf>) -> Self {
        Self {
            lock_dir: lock_dir.into(),
            ttl: DEFAULT_LOCK_TTL,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn lock_path(&self, key: &str) -> PathBuf {
        lock_path_for(&self.lock_dir, key)
    }

    /// Acquire `key`, waiting at most `timeout`.
    ///
    /// Reentrant: a thread that already holds `key` gets a nested guard
    /// immediately. The lock is released when the outermost guard drops.
    pub fn acquire(&self, key: &str, timeout: Duration) -> Result<LockGuard, StoreError> {
        fs::create_dir_all(&self.lock_dir).map_err(StoreError::io(&self.lock_dir))?;

        let path = self.lock_path(key);
        let me = thread::current().id();
        let started = Instant::now();
        let deadline = started + timeout;
        let reg = registry();
        let mut held = reg.held.lock();

        loop {
            if let Some(entry) = held.get_mut(&path) {
                if entry.owner == me {
                    entry.depth += 1;
                    return Ok(LockGuard::new(key, path, entry.generation, entry.ttl));
                }
                if entry.heartbeat.elapsed() > entry.ttl {
                    warn!(
                        key,
                        owner = %entry.token.owner,
                        "reclaiming lock whose holder missed its heartbeat"
                    );
                    held.remove(&path);
                    continue;
                }
            } else {
                match FileLock::try_acquire(&path) {
                    Ok(Some(mut file)) => {
                        let token = LockToken::new(key, &path, self.ttl);
                        if let Err(e) = file.write_token(&token) {
                            debug!(key, error = %e, "could not record lock token");
                        }
                        let generation = GENERATION.fetch_add(1, Ordering::Relaxed);
                        held.insert(
                            path.clone(),
                            Held {
                                owner: me,
                                depth: 1,
                                generation,
                                heartbeat: Instant::now(),
                                ttl: self.ttl,
                                token,
                                file,
                            },
                        );
                        debug!(key, waited_ms = started.elapsed().as_millis() as u64, "lock acquired");
                        return Ok(LockGuard::new(key, path, generation, self.ttl));
                    }
                    Ok(None) => {}
                    Err(e) => return Err(StoreError::io(&path)(e)),
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(StoreError::LockAcquisition {
                    key: key.to_string(),
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            // Another thread of ours is woken by `notify_all`; another process
            // or the async adapter is only noticed by polling.
            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=POLL_JITTER_MS));
            let wait = (deadline - now).min(self.poll_interval + jitter);
            reg.released.wait_for(&mut held, wait);
        }
    }

    /// Whether some thread in this process currently holds `key`.
    pub fn is_held(&self, key: &str) -> bool {
        registry().held.lock().contains_key(&self.lock_path(key))
    }

    /// Token of the in-process holder of `key`, if any.
    pub fn holder(&self, key: &str) -> Option<LockToken> {
        registry()
            .held
            .lock()
            .get(&self.lock_path(key))
            .map(|h| h.token.clone())
    }
}

/// Scoped ownership of a lock. Dropping the guard releases one level of
/// nesting; the OS lock is released with the outermost guard.
#[must_use = "the lock is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct LockGuard {
    key: String,
    path: PathBuf,
    generation: u64,
    ttl: Duration,
}

impl LockGuard {
    fn new(key: &str, path: PathBuf, generation: u64, ttl: Duration) -> Self {
        Self {
            key: key.to_string(),
            path,
            generation,
            ttl,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn lost(&self) -> StoreError {
        warn!(key = %self.key, "lock was reclaimed from a live holder");
        StoreError::LockAcquisition {
            key: self.key.clone(),
            waited_ms: 0,
        }
    }

    /// Fails with `LockAcquisition` if a waiter reclaimed this lock.
    pub fn ensure_held(&self) -> Result<(), StoreError> {
        match registry().held.lock().get(&self.path) {
            Some(entry) if entry.generation == self.generation => Ok(()),
            _ => Err(self.lost()),
        }
    }

    /// Refresh the heartbeat so waiters do not treat this holder as stale.
    /// Fails like [`ensure_held`](Self::ensure_held) when the lock is gone.
    pub fn renew(&self) -> Result<(), StoreError> {
        let mut held = registry().held.lock();
        let entry = match held.get_mut(&self.path) {
            Some(entry) if entry.generation == self.generation => entry,
            _ => return Err(self.lost()),
        };
        entry.heartbeat = Instant::now();
        entry.token.heartbeat_at = chrono::Utc::now().naive_utc();
        let token = entry.token.clone();
        if let Err(e) = entry.file.write_token(&token) {
            debug!(key = %self.key, error = %e, "could not refresh lock token");
        }
        Ok(())
    }

    /// Run `work` on this thread while a helper thread renews the lock a few
    /// times per TTL, so slow work is not mistaken for a dead holder.
    pub fn keep_alive<T>(&self, work: impl FnOnce() -> T) -> T {
        let interval = (self.ttl / 4).max(Duration::from_millis(1));
        let (stop, stopped) = mpsc::channel::<()>();
        thread::scope(|scope| {
            scope.spawn(move || {
                while let Err(RecvTimeoutError::Timeout) = stopped.recv_timeout(interval) {
                    if self.renew().is_err() {
                        break;
                    }
                }
            });
            let out = work();
            drop(stop);
            out
        })
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let reg = registry();
        let mut held = reg.held.lock();
        let release = match held.get_mut(&self.path) {
            Some(entry) if entry.generation == self.generation => {
                entry.depth = entry.depth.saturating_sub(1);
                entry.depth == 0
            }
            // Reclaimed by a waiter after our heartbeat lapsed.
            _ => false,
        };
        if release {
            held.remove(&self.path);
            reg.released.notify_all();
            debug!(key = %self.key, "lock released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn reentrant_on_same_thread() {
        let dir = tempfile::tempdir().unwrap();
        let locks = LockManager::new(dir.path());
        let outer = locks.acquire("a", Duration::from_millis(100)).unwrap();
        let inner = locks.acquire("a", Duration::from_millis(100)).unwrap();
        drop(inner);
        assert!(locks.is_held("a"));
        drop(outer);
        assert!(!locks.is_held("a"));
    }

    #[test]
    fn other_thread_times_out_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let locks = LockManager::new(dir.path());
        let _guard = locks.acquire("a", Duration::from_millis(100)).unwrap();

        let other = locks.clone();
        let err = thread::spawn(move || other.acquire("a", Duration::from_millis(50)).err())
            .join()
            .unwrap()
            .expect("second thread must time out");
        assert!(err.is_recoverable());
    }

    #[test]
    fn distinct_keys_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let locks = LockManager::new(dir.path());
        let _a = locks.acquire("a", Duration::from_millis(100)).unwrap();
        let other = locks.clone();
        let ok = thread::spawn(move || other.acquire("b", Duration::from_millis(100)).is_ok())
            .join()
            .unwrap();
        assert!(ok);
    }

    #[test]
    fn waiter_gets_lock_after_release() {
        let dir = tempfile::tempdir().unwrap();
        let locks = LockManager::new(dir.path());
        let guard = locks.acquire("a", Duration::from_millis(100)).unwrap();

        let other = locks.clone();
        let waiter = thread::spawn(move || other.acquire("a", Duration::from_secs(5)).map(|_| ()));
        thread::sleep(Duration::from_millis(50));
        drop(guard);
        assert!(waiter.join().unwrap().is_ok());
    }

    #[test]
    fn stale_holder_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let locks = LockManager::new(dir.path()).with_ttl(Duration::from_millis(30));
        let leaked = locks.acquire("a", Duration::from_millis(100)).unwrap();
        std::mem::forget(leaked);

        let other = locks.clone();
        let ok = thread::spawn(move || other.acquire("a", Duration::from_secs(2)).is_ok())
            .join()
            .unwrap();
        assert!(ok);
    }

    #[test]
    fn renewed_holder_is_not_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let locks = LockManager::new(dir.path()).with_ttl(Duration::from_millis(200));
        let guard = locks.acquire("a", Duration::from_millis(100)).unwrap();
        thread::sleep(Duration::from_millis(120));
        guard.renew().unwrap();

        let other = locks.clone();
        let res = thread::spawn(move || other.acquire("a", Duration::from_millis(100)).is_err())
            .join()
            .unwrap();
        assert!(res, "renewed lock must still exclude other threads");
    }

    #[test]
    fn reclaimed_holder_learns_it_lost_the_lock() {
        let dir = tempfile::tempdir().unwrap();
        let locks = LockManager::new(dir.path()).with_ttl(Duration::from_millis(30));
        let guard = locks.acquire("a", Duration::from_millis(100)).unwrap();
        assert!(guard.ensure_held().is_ok());
        thread::sleep(Duration::from_millis(60));

        let other = locks.clone();
        let (taken_tx, taken_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let thief = thread::spawn(move || {
            let stolen = other.acquire("a", Duration::from_secs(2)).unwrap();
            taken_tx.send(()).unwrap();
            done_rx.recv().unwrap();
            drop(stolen);
        });
        taken_rx.recv().unwrap();

        let err = guard.ensure_held().unwrap_err();
        assert!(matches!(err, StoreError::LockAcquisition { .. }));
        assert!(guard.renew().is_err());
        drop(guard);
        assert!(locks.is_held("a"), "stale guard must not release the new holder");
        done_tx.send(()).unwrap();
        thief.join().unwrap();
    }

    #[test]
    fn keep_alive_holds_off_reclaim_during_slow_work() {
        let dir = tempfile::tempdir().unwrap();
        let locks = LockManager::new(dir.path()).with_ttl(Duration::from_millis(80));
        let guard = locks.acquire("a", Duration::from_millis(100)).unwrap();

        let other = locks.clone();
        let intruder_failed = guard.keep_alive(|| {
            let intruder =
                thread::spawn(move || other.acquire("a", Duration::from_millis(200)).is_err());
            thread::sleep(Duration::from_millis(300));
            intruder.join().unwrap()
        });
        assert!(intruder_failed, "a live holder must not be reclaimed");
        assert!(guard.ensure_held().is_ok());
    }

    #[test]
    fn file_lock_excludes_second_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.lock");
        let first = FileLock::try_acquire(&path).unwrap();
        assert!(first.is_some());
        assert!(FileLock::try_acquire(&path).unwrap().is_none());
        drop(first);
        assert!(FileLock::try_acquire(&path).unwrap().is_some());
    }

    #[test]
    fn try_lock_hands_the_file_back_while_contended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.lock");
        let held = FileLock::try_acquire(&path).unwrap().unwrap();

        let open = || {
            OpenOptions::new()
                .read(true)
                .write(true)
                .open(&path)
                .unwrap()
        };
        let returned = FileLock::try_lock(open(), &path).unwrap().unwrap_err();
        drop(held);
        let lock = FileLock::try_lock(returned, &path).unwrap().unwrap();
        assert_eq!(lock.path(), path.as_path());
    }

    #[test]
    fn token_is_written_to_lock_file() {
        let dir = tempfile::tempdir().unwrap();
        let locks = LockManager::new(dir.path());
        let _guard = locks.acquire("ds/daily/SPY", Duration::from_millis(100)).unwrap();
        let raw = fs::read_to_string(locks.lock_path("ds/daily/SPY")).unwrap();
        let token: LockToken = serde_json::from_str(&raw).unwrap();
        assert_eq!(token.key, "ds/daily/SPY");
        assert_eq!(locks.holder("ds/daily/SPY").unwrap().owner, token.owner);
    }

    #[test]
    fn counter_under_contention_is_exact() {
        let dir = tempfile::tempdir().unwrap();
        let locks = LockManager::new(dir.path());
        let counter = Arc::new(AtomicUsize::new(0));
        let in_section = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locks = locks.clone();
                let counter = counter.clone();
                let in_section = in_section.clone();
                thread::spawn(move || {
                    for _ in 0..20 {
                        let _g = locks.acquire("hot", Duration::from_secs(10)).unwrap();
                        assert_eq!(in_section.fetch_add(1, Ordering::SeqCst), 0);
                        counter.fetch_add(1, Ordering::SeqCst);
                        in_section.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 160);
    }
}
