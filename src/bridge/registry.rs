use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Backoff between retries when the PTY stream reports would-block
const WRITE_RETRY_BACKOFF: Duration = Duration::from_millis(10);
/// Retries before a would-block write is treated as a stream failure
const WRITE_RETRY_LIMIT: u32 = 50;

/// One logical PTY: the exec id, the write half of its byte stream, the
/// reader task draining the other half, and input accounting.
pub struct PtySession {
    session_id: String,
    exec_id: String,
    input: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    reader: StdMutex<Option<JoinHandle<()>>>,
    last_activity: StdMutex<Instant>,
    input_bytes: AtomicU64,
}

impl PtySession {
    pub fn new(
        session_id: impl Into<String>,
        exec_id: impl Into<String>,
        input: Box<dyn AsyncWrite + Send + Unpin>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            exec_id: exec_id.into(),
            input: Mutex::new(input),
            reader: StdMutex::new(None),
            last_activity: StdMutex::new(Instant::now()),
            input_bytes: AtomicU64::new(0),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn exec_id(&self) -> &str {
        &self.exec_id
    }

    pub fn set_reader(&self, handle: JoinHandle<()>) {
        *self.reader.lock().unwrap() = Some(handle);
    }

    /// Abort the reader task and hand back its handle so the caller can
    /// await full termination. A reader terminating on its own must not
    /// call this on itself; abort lands on its next await point and
    /// would cancel its own cleanup.
    pub fn abort_reader(&self) -> Option<JoinHandle<()>> {
        let handle = self.reader.lock().unwrap().take();
        if let Some(handle) = &handle {
            handle.abort();
        }
        handle
    }

    /// Shut down the write half. Idempotent.
    pub async fn close_input(&self) {
        let mut input = self.input.lock().await;
        let _ = input.shutdown().await;
    }

    /// Record inbound activity for the idle sweeper.
    pub fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().unwrap().elapsed()
    }

    /// Account `n` more input bytes against `cap`. Returns `false`
    /// without charging when the write would push the total past the
    /// cap.
    pub fn try_charge_input(&self, n: u64, cap: u64) -> bool {
        // Only the dispatch loop charges, so load/store does not race
        let current = self.input_bytes.load(Ordering::Relaxed);
        if current + n > cap {
            return false;
        }
        self.input_bytes.store(current + n, Ordering::Relaxed);
        true
    }

    pub fn input_total(&self) -> u64 {
        self.input_bytes.load(Ordering::Relaxed)
    }

    /// Write all bytes to the PTY stream, retrying transient would-block
    /// with a short backoff.
    pub async fn write(&self, data: &[u8]) -> io::Result<()> {
        let mut input = self.input.lock().await;
        let mut written = 0;
        let mut retries = 0u32;

        while written < data.len() {
            match input.write(&data[written..]).await {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "PTY stream closed",
                    ))
                }
                Ok(n) => {
                    written += n;
                    retries = 0;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock && retries < WRITE_RETRY_LIMIT => {
                    retries += 1;
                    tokio::time::sleep(WRITE_RETRY_BACKOFF).await;
                }
                Err(e) => return Err(e),
            }
        }

        input.flush().await
    }
}

/// Session map for a single client connection. Shared by the dispatch
/// loop, the readers (self-removal on EOF), and the idle sweeper.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<PtySession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Insert a session. Returns `false` if the id is already present.
    pub async fn insert(&self, session: Arc<PtySession>) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.entry(session.session_id().to_string()) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(session);
                true
            }
        }
    }

    pub async fn contains(&self, session_id: &str) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<PtySession>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn remove(&self, session_id: &str) -> Option<Arc<PtySession>> {
        self.sessions.write().await.remove(session_id)
    }

    /// Remove and return every session.
    pub async fn drain(&self) -> Vec<Arc<PtySession>> {
        let mut sessions = self.sessions.write().await;
        sessions.drain().map(|(_, s)| s).collect()
    }

    /// Sessions idle longer than `max_idle`.
    pub async fn idle_sessions(&self, max_idle: Duration) -> Vec<Arc<PtySession>> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.idle_for() > max_idle)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
