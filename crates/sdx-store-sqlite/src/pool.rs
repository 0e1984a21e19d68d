use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rusqlite::Connection;
use sdx_store_core::StoreError;

const DEFAULT_MIN_IDLE: usize = 1;
const DEFAULT_MAX_IDLE: usize = 16;

const CONNECTION_PRAGMAS: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
";

/// Pooling is hazardous when a supervisor forks a worker after the pool was
/// created in the parent: two OS processes end up sharing one physical
/// connection and corrupt its session state. The pool records the process id
/// it was last built in and rebuilds itself whenever the current id differs,
/// so no connection ever crosses a fork boundary. The check runs on every
/// [`ProcessSafePool::acquire`], since forking can happen at any time.
pub struct ProcessSafePool {
    path: PathBuf,
    min_idle: usize,
    max_idle: usize,
    state: Mutex<PoolState>,
}

struct PoolState {
    pid_last_seen: u32,
    generation: u64,
    open: bool,
    idle: Vec<Connection>,
}

impl ProcessSafePool {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_limits(path, DEFAULT_MIN_IDLE, DEFAULT_MAX_IDLE)
    }

    #[must_use]
    pub fn with_limits(path: impl Into<PathBuf>, min_idle: usize, max_idle: usize) -> Self {
        let min_idle = min_idle.max(1);
        Self {
            path: path.into(),
            min_idle,
            max_idle: max_idle.max(min_idle),
            state: Mutex::new(PoolState {
                pid_last_seen: std::process::id(),
                generation: 0,
                open: false,
                idle: Vec::new(),
            }),
        }
    }

    /// Draw a connection from the active pool, (re)creating the pool first
    /// when it has never been opened or the recorded pid no longer matches
    /// the calling process.
    ///
    /// # Errors
    /// [`StoreError::Connectivity`] when the database cannot be opened. Not
    /// retried internally; callers treat it as fatal for the request.
    pub fn acquire(&self) -> Result<Connection, StoreError> {
        let mut state = self.lock();
        let pid = std::process::id();
        if !state.open || state.pid_last_seen != pid {
            state.open = false;
            state.idle.clear();
            let mut fresh = Vec::with_capacity(self.min_idle);
            for _ in 0..self.min_idle {
                fresh.push(self.open_connection()?);
            }
            state.idle = fresh;
            state.pid_last_seen = pid;
            state.generation += 1;
            state.open = true;
            tracing::debug!(pid, generation = state.generation, "connection pool created");
        }
        match state.idle.pop() {
            Some(conn) => Ok(conn),
            None => self.open_connection(),
        }
    }

    /// Return a connection to whichever pool is currently active. The
    /// connection is dropped instead when the pool has rotated since the
    /// connection was drawn, or when the idle set is already full.
    pub fn release(&self, conn: Connection) {
        let mut state = self.lock();
        if state.open
            && state.pid_last_seen == std::process::id()
            && state.idle.len() < self.max_idle
        {
            state.idle.push(conn);
        }
    }

    /// Close every pooled connection. Used at shutdown and test teardown;
    /// safe to call repeatedly.
    pub fn close_all(&self) {
        let mut state = self.lock();
        state.idle.clear();
        state.open = false;
    }

    fn open_connection(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open(&self.path).map_err(|err| {
            StoreError::Connectivity(format!(
                "cannot open database at {}: {err}",
                self.path.display()
            ))
        })?;
        conn.execute_batch(CONNECTION_PRAGMAS)
            .map_err(|err| StoreError::Connectivity(format!("cannot configure connection: {err}")))?;
        Ok(conn)
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
