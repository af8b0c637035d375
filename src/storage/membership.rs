use anyhow::Result;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OnceCell;

use super::schema::Database;

/// Well-known `kv_store` key holding the favourited ids as a JSON array.
pub const MEMBERSHIP_KEY: &str = "favourites.ids";

impl Database {
    // ========================================================================
    // Key-Value Operations
    // ========================================================================

    /// Get a value and its revision by key.
    pub async fn get_kv(&self, key: &str) -> Result<Option<(String, i64)>> {
        let row: Option<(String, i64)> =
            sqlx::query_as("SELECT value, revision FROM kv_store WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row)
    }

    /// Write a value unless a newer revision is already stored.
    ///
    /// The comparison happens inside a single UPSERT, so two writers racing
    /// with revisions 4 and 5 always leave revision 5 in place regardless of
    /// which statement reaches SQLite first.
    ///
    /// # Returns
    ///
    /// `true` if the row was written, `false` if a newer revision won.
    pub async fn set_kv_if_newer(&self, key: &str, value: &str, revision: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO kv_store (key, value, revision, updated_at)
            VALUES (?, ?, ?, datetime('now'))
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                revision = excluded.revision,
                updated_at = excluded.updated_at
            WHERE excluded.revision > kv_store.revision
        "#,
        )
        .bind(key)
        .bind(value)
        .bind(revision)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

/// Outcome of [`MembershipStore::toggle`], captured atomically with the flip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toggle {
    pub id: String,
    /// Membership before the flip.
    pub was_member: bool,
    /// Revision assigned to the flip; later flips always carry larger revisions.
    pub revision: i64,
}

impl Toggle {
    pub fn is_member(&self) -> bool {
        !self.was_member
    }
}

#[derive(Debug, Default)]
struct MembershipSet {
    ids: BTreeSet<String>,
    revision: i64,
}

/// Persisted set of favourited recipe ids.
///
/// The set is loaded once, lazily, and then mutated in memory under a short
/// critical section that never spans I/O. Each mutation bumps a revision and
/// persists a snapshot with [`Database::set_kv_if_newer`], so out-of-order
/// persists cannot resurrect an older set.
#[derive(Clone)]
pub struct MembershipStore {
    db: Database,
    loaded: Arc<OnceCell<()>>,
    state: Arc<Mutex<MembershipSet>>,
}

impl MembershipStore {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            loaded: Arc::new(OnceCell::new()),
            state: Arc::new(Mutex::new(MembershipSet::default())),
        }
    }

    /// All favourited ids.
    pub async fn load(&self) -> Result<BTreeSet<String>> {
        self.ensure_loaded().await?;
        Ok(self.lock().ids.clone())
    }

    /// Replace the whole set (used by clear-all).
    pub async fn save(&self, ids: BTreeSet<String>) -> Result<()> {
        self.ensure_loaded().await?;
        let (snapshot, revision) = {
            let mut state = self.lock();
            state.ids = ids;
            state.revision += 1;
            (serialize(&state.ids)?, state.revision)
        };
        self.persist(&snapshot, revision).await;
        Ok(())
    }

    pub async fn has(&self, id: &str) -> Result<bool> {
        self.ensure_loaded().await?;
        Ok(self.contains(id))
    }

    /// Flip membership of `id` and hand back the state before the flip.
    ///
    /// `was_member` is read inside the same critical section that performs the
    /// flip, so two rapid toggles of one id always disagree about direction.
    pub async fn toggle(&self, id: &str) -> Result<Toggle> {
        self.ensure_loaded().await?;
        let (toggle, snapshot) = {
            let mut state = self.lock();
            let was_member = !state.ids.insert(id.to_string());
            if was_member {
                state.ids.remove(id);
            }
            state.revision += 1;
            let toggle = Toggle {
                id: id.to_string(),
                was_member,
                revision: state.revision,
            };
            (toggle, serialize(&state.ids)?)
        };

        tracing::debug!(
            id = %id,
            was_member = toggle.was_member,
            revision = toggle.revision,
            "Favourite toggled"
        );
        self.persist(&snapshot, toggle.revision).await;
        Ok(toggle)
    }

    /// In-memory membership check; `false` until the set has been loaded.
    pub fn contains(&self, id: &str) -> bool {
        self.lock().ids.contains(id)
    }

    async fn ensure_loaded(&self) -> Result<()> {
        self.loaded
            .get_or_try_init(|| async {
                let stored = self.db.get_kv(MEMBERSHIP_KEY).await?;
                let (ids, revision) = match stored {
                    Some((value, revision)) => {
                        match serde_json::from_str::<BTreeSet<String>>(&value) {
                            Ok(ids) => (ids, revision),
                            Err(e) => {
                                tracing::warn!(
                                    error = %e,
                                    "Stored favourites are corrupt, starting empty"
                                );
                                (BTreeSet::new(), revision)
                            }
                        }
                    }
                    None => (BTreeSet::new(), 0),
                };
                tracing::debug!(count = ids.len(), revision, "Loaded favourites");
                let mut state = self.lock();
                state.ids = ids;
                state.revision = revision;
                Ok::<(), anyhow::Error>(())
            })
            .await?;
        Ok(())
    }

    /// Persist a snapshot. Failures are logged, not surfaced: the in-memory
    /// flip stands and the next successful write carries the full set.
    async fn persist(&self, snapshot: &str, revision: i64) {
        match self.db.set_kv_if_newer(MEMBERSHIP_KEY, snapshot, revision).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(revision, "Newer favourites snapshot already persisted");
            }
            Err(e) => {
                tracing::warn!(revision, error = %e, "Failed to persist favourites");
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MembershipSet> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn serialize(ids: &BTreeSet<String>) -> Result<String> {
    Ok(serde_json::to_string(ids)?)
}
