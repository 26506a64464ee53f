//! Named mutual-exclusion tokens bound to a session
//!
//! The registry is the single source of truth for "is a filtering session
//! active". Every component asks it rather than caching its own flag.
//!
//! The table sits behind a `std::sync::Mutex` on purpose: a panic while the
//! table is held poisons it, and a poisoned table is the one failure that makes
//! a session start report `success = false`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use thiserror::Error;
use tracing::{debug, warn};

use super::session::SessionId;

/// Default lock name for progressive filtering
pub const FILTERING_LOCK: &str = "progressive_filtering";

/// Lock subsystem errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// Another session holds the lock
    #[error("lock '{name}' is held by {holder}")]
    Contended { name: String, holder: SessionId },

    /// The lock table was poisoned by a panic
    #[error("lock table poisoned while accessing '{0}'")]
    Poisoned(String),

    /// No room for another named lock
    #[error("lock table exhausted (capacity {capacity})")]
    Exhausted { capacity: usize },
}

/// Proof of ownership handed to the session that acquired a lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    name: String,
    holder: SessionId,
    generation: u64,
}

impl LockToken {
    pub fn new(name: &str, holder: SessionId, generation: u64) -> Self {
        Self {
            name: name.to_string(),
            holder,
            generation,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn holder(&self) -> SessionId {
        self.holder
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[derive(Debug, Clone, Copy)]
struct LockEntry {
    holder: SessionId,
    generation: u64,
}

/// Registry of named locks
#[derive(Debug)]
pub struct LockRegistry {
    table: Mutex<HashMap<String, LockEntry>>,
    generation: AtomicU64,
    capacity: usize,
}

impl LockRegistry {
    /// Registry with room for a handful of named locks
    pub fn new() -> Self {
        Self::with_capacity(16)
    }

    /// Registry holding at most `capacity` simultaneously held locks
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            capacity,
        }
    }

    fn table(&self, name: &str) -> Result<MutexGuard<'_, HashMap<String, LockEntry>>, LockError> {
        self.table
            .lock()
            .map_err(|_| LockError::Poisoned(name.to_string()))
    }

    /// Acquire `name` for `holder`
    ///
    /// Re-acquiring a lock already held by the same session returns the
    /// existing token.
    pub fn acquire(&self, name: &str, holder: SessionId) -> Result<LockToken, LockError> {
        let mut table = self.table(name)?;

        if let Some(entry) = table.get(name) {
            if entry.holder == holder {
                return Ok(LockToken::new(name, holder, entry.generation));
            }
            return Err(LockError::Contended {
                name: name.to_string(),
                holder: entry.holder,
            });
        }

        if table.len() >= self.capacity {
            return Err(LockError::Exhausted {
                capacity: self.capacity,
            });
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        table.insert(name.to_string(), LockEntry { holder, generation });
        debug!(lock = %name, %holder, generation, "Lock acquired");
        Ok(LockToken::new(name, holder, generation))
    }

    /// Release the lock described by `token`
    ///
    /// Idempotent: returns `Ok(false)` when the token no longer owns the lock.
    pub fn release(&self, token: &LockToken) -> Result<bool, LockError> {
        let mut table = self.table(&token.name)?;
        match table.get(&token.name) {
            Some(entry) if entry.holder == token.holder && entry.generation == token.generation => {
                table.remove(&token.name);
                debug!(lock = %token.name, holder = %token.holder, "Lock released");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Current holder of `name`
    pub fn holder(&self, name: &str) -> Result<Option<SessionId>, LockError> {
        Ok(self.table(name)?.get(name).map(|entry| entry.holder))
    }

    /// Whether `name` is held; a poisoned table reports the last known state
    pub fn is_held(&self, name: &str) -> bool {
        match self.table.lock() {
            Ok(table) => table.contains_key(name),
            Err(poisoned) => poisoned.into_inner().contains_key(name),
        }
    }

    /// Drop `name` regardless of holder and clear any poison
    ///
    /// Used by emergency teardown; never fails.
    pub fn force_release(&self, name: &str) -> Option<SessionId> {
        let removed = match self.table.lock() {
            Ok(mut table) => table.remove(name),
            Err(poisoned) => {
                warn!(lock = %name, "Recovering poisoned lock table");
                let removed = poisoned.into_inner().remove(name);
                self.table.clear_poison();
                removed
            }
        };
        removed.map(|entry| entry.holder)
    }

    /// Number of currently held locks
    pub fn held_count(&self) -> usize {
        match self.table.lock() {
            Ok(table) => table.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

impl Default for LockRegistry {
    fn default() -> Self {
        Self::new()
    }
}
