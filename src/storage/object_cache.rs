use anyhow::Result;

use super::schema::Database;
use crate::recipe::{Recipe, RecipeListItem};

impl Database {
    // ========================================================================
    // Object Cache Operations
    // ========================================================================

    /// Store a full recipe record, replacing any existing entry for its id.
    ///
    /// The record is serialized verbatim (unknown fields included), so a later
    /// [`get_recipe`](Self::get_recipe) returns exactly what the server sent.
    pub async fn put_recipe(&self, recipe: &Recipe) -> Result<()> {
        let payload = serde_json::to_string(recipe)?;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO recipe_cache (id, name, has_image, payload, cached_at)
            VALUES (?, ?, ?, ?, datetime('now'))
        "#,
        )
        .bind(&recipe.id)
        .bind(&recipe.name)
        .bind(recipe.has_image)
        .bind(&payload)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Fetch a cached recipe by id.
    ///
    /// An entry whose payload no longer parses is reported as absent; the next
    /// reconcile pass will refetch it.
    pub async fn get_recipe(&self, id: &str) -> Result<Option<Recipe>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT payload FROM recipe_cache WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.and_then(|(payload,)| parse_payload(id, &payload)))
    }

    /// Remove a cached recipe. Returns `true` if an entry was deleted.
    pub async fn delete_recipe(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM recipe_cache WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn has_recipe(&self, id: &str) -> Result<bool> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM recipe_cache WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;

        Ok(row.0 > 0)
    }

    /// Every cached recipe, ordered by name (case-insensitive).
    pub async fn all_recipes(&self) -> Result<Vec<Recipe>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT id, payload FROM recipe_cache ORDER BY name COLLATE NOCASE, id")
                .fetch_all(&self.pool)
                .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(id, payload)| parse_payload(&id, &payload))
            .collect())
    }

    /// Gallery view of the cache, for rendering favourites while offline.
    pub async fn cached_recipe_list(&self) -> Result<Vec<RecipeListItem>> {
        Ok(self
            .all_recipes()
            .await?
            .iter()
            .map(Recipe::to_list_item)
            .collect())
    }

    /// Ids of all cached recipes, including entries whose payload is corrupt.
    pub async fn cached_recipe_ids(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT id FROM recipe_cache ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}

fn parse_payload(id: &str, payload: &str) -> Option<Recipe> {
    match serde_json::from_str(payload) {
        Ok(recipe) => Some(recipe),
        Err(e) => {
            tracing::warn!(id = %id, error = %e, "Cached recipe payload is corrupt");
            None
        }
    }
}
