use anyhow::Result;
use std::collections::BTreeSet;
use tokio::task::JoinHandle;

use super::coordinator::{SyncCoordinator, SyncError};
use crate::recipe::Recipe;
use crate::storage::MembershipStore;
use crate::util::spawn_logged;

/// Upper bound on add/remove passes one detached task makes while membership
/// keeps changing under it. Anything left over is fixed by the next reconcile.
const MAX_CONVERGE_PASSES: usize = 4;

/// Result of a user-facing toggle.
#[derive(Debug)]
pub struct ToggleOutcome {
    pub id: String,
    /// Membership before the flip.
    pub was_member: bool,
    /// Detached cache side effect. Production code drops this; tests await it.
    pub task: JoinHandle<()>,
}

impl ToggleOutcome {
    pub fn is_member(&self) -> bool {
        !self.was_member
    }
}

/// User-facing favourite actions.
///
/// Membership changes commit locally and return immediately. The caches
/// follow on a detached task, so a slow or failing fetch never blocks or
/// reverts the action.
#[derive(Clone)]
pub struct Favourites {
    membership: MembershipStore,
    coordinator: SyncCoordinator,
}

impl Favourites {
    pub fn new(membership: MembershipStore, coordinator: SyncCoordinator) -> Self {
        Self {
            membership,
            coordinator,
        }
    }

    pub fn membership(&self) -> &MembershipStore {
        &self.membership
    }

    pub fn coordinator(&self) -> &SyncCoordinator {
        &self.coordinator
    }

    /// Flip favourite status of `id`.
    ///
    /// The sync task is spawned only after the flip has committed, and is
    /// driven by the direction the flip itself reported.
    pub async fn toggle(&self, id: &str, inline: Option<Recipe>) -> Result<ToggleOutcome> {
        let toggle = self.membership.toggle(id).await?;

        let coordinator = self.coordinator.clone();
        let membership = self.membership.clone();
        let task_id = toggle.id.clone();
        let task = spawn_logged(
            "favourite-sync",
            converge(coordinator, membership, task_id, toggle.is_member(), inline),
        );

        Ok(ToggleOutcome {
            id: toggle.id,
            was_member: toggle.was_member,
            task,
        })
    }

    pub async fn is_favourite(&self, id: &str) -> Result<bool> {
        self.membership.has(id).await
    }

    /// Forget every favourite and evict everything cached for them.
    ///
    /// Returns the number of cached recipes evicted.
    pub async fn clear_all(&self) -> Result<usize> {
        self.membership.save(BTreeSet::new()).await?;

        let cached = self.coordinator.database().cached_recipe_ids().await?;
        for id in &cached {
            self.coordinator.on_member_removed(id).await;
        }

        tracing::info!(evicted = cached.len(), "Cleared all favourites");
        Ok(cached.len())
    }

    /// Refresh the cached copy of an edited recipe that is still a favourite.
    ///
    /// Treated as delete then recreate. Returns `false` if the recipe is not a
    /// favourite, in which case nothing is touched.
    pub async fn recipe_updated(&self, recipe: Recipe) -> Result<bool, SyncError> {
        let is_member = self
            .membership
            .has(&recipe.id)
            .await
            .map_err(|e| SyncError::Storage(format!("{e:#}")))?;
        if !is_member {
            return Ok(false);
        }

        let id = recipe.id.clone();
        self.coordinator.on_member_removed(&id).await;
        self.coordinator.on_member_added(&id, Some(recipe)).await?;
        Ok(true)
    }
}

/// Apply `want_member` to the caches, then keep following membership until it
/// stops changing. Two rapid toggles therefore leave no net cache mutation,
/// whichever task finishes last.
async fn converge(
    coordinator: SyncCoordinator,
    membership: MembershipStore,
    id: String,
    mut want_member: bool,
    mut inline: Option<Recipe>,
) {
    for _ in 0..MAX_CONVERGE_PASSES {
        if want_member {
            if let Err(e) = coordinator.on_member_added(&id, inline.take()).await {
                tracing::warn!(
                    id = %id,
                    error = %e,
                    "Failed to cache favourite, will retry on reconcile"
                );
            }
        } else {
            coordinator.on_member_removed(&id).await;
        }

        let now_member = membership.contains(&id);
        if now_member == want_member {
            return;
        }
        tracing::debug!(id = %id, now_member, "Membership changed during sync, following");
        want_member = now_member;
    }

    tracing::warn!(id = %id, "Favourite sync did not settle, leaving it to reconcile");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoints::Endpoints;
    use crate::recipe::RecipeClient;
    use crate::storage::Database;
    use crate::sync::EventBus;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn setup(server: &MockServer) -> (Favourites, Database) {
        let db = Database::open(":memory:").await.unwrap();
        let client = RecipeClient::new(
            reqwest::Client::new(),
            Endpoints::new(&server.uri()).unwrap(),
        )
        .with_retries(0);
        let membership = MembershipStore::new(db.clone());
        let coordinator =
            SyncCoordinator::new(db.clone(), client, membership.clone(), EventBus::default());
        (Favourites::new(membership, coordinator), db)
    }

    fn recipe(id: &str, name: &str) -> Recipe {
        serde_json::from_value(json!({"id": id, "name": name})).unwrap()
    }

    #[tokio::test]
    async fn test_toggle_with_inline_caches_without_network() {
        let server = MockServer::start().await;
        let (favourites, db) = setup(&server).await;

        let outcome = favourites
            .toggle("r1", Some(recipe("r1", "Gimlet")))
            .await
            .unwrap();
        assert!(outcome.is_member());
        outcome.task.await.unwrap();

        assert_eq!(db.get_recipe("r1").await.unwrap().unwrap().name, "Gimlet");
    }

    #[tokio::test]
    async fn test_toggle_succeeds_when_fetch_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/recipes/r1"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let (favourites, db) = setup(&server).await;

        let outcome = favourites.toggle("r1", None).await.unwrap();
        outcome.task.await.unwrap();

        assert!(favourites.is_favourite("r1").await.unwrap());
        assert!(!db.has_recipe("r1").await.unwrap());
    }

    #[tokio::test]
    async fn test_clear_all_evicts_everything() {
        let server = MockServer::start().await;
        let (favourites, db) = setup(&server).await;
        for id in ["r1", "r2"] {
            let outcome = favourites.toggle(id, Some(recipe(id, id))).await.unwrap();
            outcome.task.await.unwrap();
        }

        assert_eq!(favourites.clear_all().await.unwrap(), 2);
        assert!(favourites.membership().load().await.unwrap().is_empty());
        assert!(db.cached_recipe_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recipe_updated_only_touches_members() {
        let server = MockServer::start().await;
        let (favourites, db) = setup(&server).await;

        assert!(!favourites
            .recipe_updated(recipe("r9", "Not a favourite"))
            .await
            .unwrap());
        assert!(!db.has_recipe("r9").await.unwrap());

        let outcome = favourites
            .toggle("r1", Some(recipe("r1", "Old name")))
            .await
            .unwrap();
        outcome.task.await.unwrap();

        assert!(favourites
            .recipe_updated(recipe("r1", "New name"))
            .await
            .unwrap());
        assert_eq!(db.get_recipe("r1").await.unwrap().unwrap().name, "New name");
    }
}
