use futures::stream::{self, StreamExt};
use secrecy::SecretString;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

use super::events::{EventBus, SyncEvent};
use crate::net::FetchError;
use crate::recipe::{Recipe, RecipeClient};
use crate::storage::{Database, MembershipStore};

const DEFAULT_CONCURRENCY: usize = 4;

#[derive(Debug, Error)]
pub enum SyncError {
    /// The Recipe Service could not deliver the record
    #[error("Failed to fetch recipe {id}: {source}")]
    Fetch {
        id: String,
        #[source]
        source: FetchError,
    },
    /// The durable store rejected a read or write
    #[error("Offline storage error: {0}")]
    Storage(String),
}

impl SyncError {
    fn storage(err: anyhow::Error) -> Self {
        SyncError::Storage(format!("{err:#}"))
    }
}

/// Result of a successful [`SyncCoordinator::on_member_added`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddOutcome {
    pub id: String,
    /// `false` when the caller supplied the record inline.
    pub fetched: bool,
    /// Whether the recipe's image is in the Binary Cache afterwards.
    pub image_cached: bool,
}

/// Counts from one [`SyncCoordinator::reconcile`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub missing: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub orphans_removed: usize,
}

struct Inner {
    db: Database,
    client: RecipeClient,
    membership: MembershipStore,
    events: EventBus,
    credential: RwLock<Option<Arc<SecretString>>>,
    concurrency: usize,
}

/// Drives the Object Cache and Binary Cache toward the Membership Store.
///
/// Never mutates membership. Every successful add or remove is announced on
/// the [`EventBus`].
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<Inner>,
}

impl SyncCoordinator {
    pub fn new(
        db: Database,
        client: RecipeClient,
        membership: MembershipStore,
        events: EventBus,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                db,
                client,
                membership,
                events,
                credential: RwLock::new(None),
                concurrency: DEFAULT_CONCURRENCY,
            }),
        }
    }

    /// Set the reconcile fan-out. Must be called before the coordinator is cloned.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.concurrency = concurrency.max(1);
        }
        self
    }

    /// Replace the bearer credential used for subsequent fetches.
    pub fn set_credential(&self, credential: Option<SecretString>) {
        let mut slot = self
            .inner
            .credential
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *slot = credential.map(Arc::new);
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn database(&self) -> &Database {
        &self.inner.db
    }

    fn credential(&self) -> Option<Arc<SecretString>> {
        self.inner
            .credential
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Cache a recipe (and its image, if it has one) for offline use.
    ///
    /// `inline` skips the network fetch when the caller already holds the
    /// record. Image failures are logged and swallowed; a recipe failure is
    /// returned so the caller can log it, and is retried by [`reconcile`](Self::reconcile).
    pub async fn on_member_added(
        &self,
        id: &str,
        inline: Option<Recipe>,
    ) -> Result<AddOutcome, SyncError> {
        let outcome = self.store_member(id, inline).await?;
        self.inner.events.emit(SyncEvent::EntityCached { id: id.to_string() });
        Ok(outcome)
    }

    async fn store_member(
        &self,
        id: &str,
        inline: Option<Recipe>,
    ) -> Result<AddOutcome, SyncError> {
        let credential = self.credential();

        let (recipe, fetched) = match inline {
            Some(recipe) if recipe.id == id => (recipe, false),
            other => {
                if other.is_some() {
                    tracing::warn!(id = %id, "Inline recipe has a different id, fetching instead");
                }
                let recipe = self
                    .inner
                    .client
                    .fetch_recipe(id, credential.as_deref())
                    .await
                    .map_err(|source| SyncError::Fetch {
                        id: id.to_string(),
                        source,
                    })?;
                (recipe, true)
            }
        };

        self.inner
            .db
            .put_recipe(&recipe)
            .await
            .map_err(SyncError::storage)?;

        let image_cached = if recipe.has_image {
            self.cache_image(id, credential.as_deref()).await
        } else {
            false
        };

        tracing::debug!(id = %id, fetched, image_cached, "Recipe cached for offline use");

        Ok(AddOutcome {
            id: id.to_string(),
            fetched,
            image_cached,
        })
    }

    /// Fetch and store the image unless it is already cached. Never fails.
    async fn cache_image(&self, id: &str, credential: Option<&SecretString>) -> bool {
        let url = self.inner.client.endpoints().image_url(id);

        match self.inner.db.has_binary(url.as_str()).await {
            Ok(true) => return true,
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(id = %id, error = %e, "Failed to check image cache");
            }
        }

        let image = match self.inner.client.fetch_image(id, credential).await {
            Ok(image) => image,
            Err(e) => {
                tracing::warn!(id = %id, error = %e, "Failed to fetch recipe image");
                return false;
            }
        };

        match self
            .inner
            .db
            .put_binary(url.as_str(), &image.bytes, image.content_type.as_deref())
            .await
        {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(id = %id, error = %e, "Failed to store recipe image");
                false
            }
        }
    }

    /// Evict a recipe and its image. Both deletes are best-effort.
    pub async fn on_member_removed(&self, id: &str) {
        self.evict(id).await;
        self.inner
            .events
            .emit(SyncEvent::EntityUncached { id: id.to_string() });
    }

    async fn evict(&self, id: &str) {
        if let Err(e) = self.inner.db.delete_recipe(id).await {
            tracing::warn!(id = %id, error = %e, "Failed to evict cached recipe");
        }

        let url = self.inner.client.endpoints().image_url(id);
        if let Err(e) = self.inner.db.delete_binary(url.as_str()).await {
            tracing::warn!(id = %id, error = %e, "Failed to evict cached image");
        }

        tracing::debug!(id = %id, "Recipe evicted from offline cache");
    }

    /// Bring the Object Cache back in line with membership.
    ///
    /// Missing recipes are fetched concurrently (bounded fan-out); one failure
    /// never stops the others. Cached recipes that are no longer members are
    /// evicted, including members toggled off while their fetch was in
    /// flight. Safe to re-run at any time.
    pub async fn reconcile(&self) -> Result<ReconcileReport, SyncError> {
        let members = self
            .inner
            .membership
            .load()
            .await
            .map_err(SyncError::storage)?;
        let cached: BTreeSet<String> = self
            .inner
            .db
            .cached_recipe_ids()
            .await
            .map_err(SyncError::storage)?
            .into_iter()
            .collect();

        let missing: Vec<String> = members.difference(&cached).cloned().collect();
        let orphans: Vec<String> = cached.difference(&members).cloned().collect();
        let mut report = ReconcileReport {
            missing: missing.len(),
            ..ReconcileReport::default()
        };

        let results: Vec<(String, Result<AddOutcome, SyncError>)> = stream::iter(missing)
            .map(|id| async move {
                let result = self.store_member(&id, None).await;
                (id, result)
            })
            .buffer_unordered(self.inner.concurrency)
            .collect()
            .await;

        for (id, result) in results {
            match result {
                // Toggled off while the fetch was in flight
                Ok(_) if !self.inner.membership.contains(&id) => {
                    self.evict(&id).await;
                    report.orphans_removed += 1;
                }
                Ok(_) => {
                    self.inner.events.emit(SyncEvent::EntityCached { id });
                    report.succeeded += 1;
                }
                Err(e) => {
                    tracing::warn!(id = %id, error = %e, "Reconcile could not cache recipe");
                    report.failed += 1;
                }
            }
        }

        for id in orphans {
            // A toggle may have re-added it since membership was loaded
            if self.inner.membership.contains(&id) {
                continue;
            }
            self.on_member_removed(&id).await;
            report.orphans_removed += 1;
        }

        tracing::info!(
            missing = report.missing,
            succeeded = report.succeeded,
            failed = report.failed,
            orphans_removed = report.orphans_removed,
            "Reconcile complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoints::Endpoints;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn setup(server: &MockServer) -> (SyncCoordinator, Database, MembershipStore) {
        let db = Database::open(":memory:").await.unwrap();
        let endpoints = Endpoints::new(&server.uri()).unwrap();
        let client = RecipeClient::new(reqwest::Client::new(), endpoints).with_retries(0);
        let membership = MembershipStore::new(db.clone());
        let coordinator =
            SyncCoordinator::new(db.clone(), client, membership.clone(), EventBus::default());
        (coordinator, db, membership)
    }

    fn recipe_json(id: &str, has_image: bool) -> serde_json::Value {
        json!({"id": id, "name": format!("Recipe {id}"), "has_image": has_image})
    }

    #[tokio::test]
    async fn test_inline_recipe_skips_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/recipes/r1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(recipe_json("r1", false)))
            .expect(0)
            .mount(&server)
            .await;

        let (coordinator, db, _) = setup(&server).await;
        let inline: Recipe = serde_json::from_value(recipe_json("r1", false)).unwrap();
        let outcome = coordinator.on_member_added("r1", Some(inline)).await.unwrap();

        assert!(!outcome.fetched);
        assert!(!outcome.image_cached);
        assert!(db.has_recipe("r1").await.unwrap());
    }

    #[tokio::test]
    async fn test_credential_is_sent_as_bearer() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/recipes/r1"))
            .and(header("authorization", "Bearer s3cret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(recipe_json("r1", false)))
            .expect(1)
            .mount(&server)
            .await;

        let (coordinator, _, _) = setup(&server).await;
        coordinator.set_credential(Some(SecretString::from("s3cret")));
        coordinator.on_member_added("r1", None).await.unwrap();
    }

    #[tokio::test]
    async fn test_image_failure_is_swallowed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/recipes/r1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(recipe_json("r1", true)))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/recipes/r1/image"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let (coordinator, db, _) = setup(&server).await;
        let outcome = coordinator.on_member_added("r1", None).await.unwrap();

        assert!(!outcome.image_cached);
        assert!(db.has_recipe("r1").await.unwrap());
        assert_eq!(db.storage_stats().await.unwrap().cached_binaries, 0);
    }

    #[tokio::test]
    async fn test_fetch_failure_propagates_and_leaves_membership() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/recipes/r1"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let (coordinator, db, membership) = setup(&server).await;
        membership.toggle("r1").await.unwrap();

        let err = coordinator.on_member_added("r1", None).await.unwrap_err();
        assert!(matches!(err, SyncError::Fetch { ref source, .. } if source.is_not_found()));
        assert!(membership.has("r1").await.unwrap());
        assert!(!db.has_recipe("r1").await.unwrap());
    }

    #[tokio::test]
    async fn test_add_and_remove_emit_events() {
        let server = MockServer::start().await;
        let (coordinator, _, _) = setup(&server).await;
        let mut events = coordinator.events().subscribe();

        let inline: Recipe = serde_json::from_value(recipe_json("r1", false)).unwrap();
        coordinator.on_member_added("r1", Some(inline)).await.unwrap();
        coordinator.on_member_removed("r1").await;

        assert_eq!(
            events.recv().await.unwrap(),
            SyncEvent::EntityCached { id: "r1".to_string() }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            SyncEvent::EntityUncached { id: "r1".to_string() }
        );
    }

    #[tokio::test]
    async fn test_remove_absent_is_harmless() {
        let server = MockServer::start().await;
        let (coordinator, db, _) = setup(&server).await;

        coordinator.on_member_removed("never-cached").await;
        assert!(db.cached_recipe_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_evicts_orphans() {
        let server = MockServer::start().await;
        let (coordinator, db, _) = setup(&server).await;
        let orphan: Recipe = serde_json::from_value(recipe_json("stale", false)).unwrap();
        db.put_recipe(&orphan).await.unwrap();

        let report = coordinator.reconcile().await.unwrap();

        assert_eq!(
            report,
            ReconcileReport {
                missing: 0,
                succeeded: 0,
                failed: 0,
                orphans_removed: 1,
            }
        );
        assert!(!db.has_recipe("stale").await.unwrap());
    }

    #[tokio::test]
    async fn test_reconcile_drops_member_toggled_off_mid_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/recipes/r1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(recipe_json("r1", false))
                    .set_delay(std::time::Duration::from_millis(300)),
            )
            .mount(&server)
            .await;
        let (coordinator, db, membership) = setup(&server).await;
        membership.toggle("r1").await.unwrap();
        let mut events = coordinator.events().subscribe();

        let (report, toggled) = tokio::join!(coordinator.reconcile(), async {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            membership.toggle("r1").await.unwrap()
        });

        assert!(toggled.was_member);
        assert_eq!(
            report.unwrap(),
            ReconcileReport {
                missing: 1,
                succeeded: 0,
                failed: 0,
                orphans_removed: 1,
            }
        );
        assert!(!db.has_recipe("r1").await.unwrap());
        assert!(events.try_recv().is_err());
    }
}
