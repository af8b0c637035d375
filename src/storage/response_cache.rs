use anyhow::Result;

use super::schema::Database;
use super::types::{CachedBinary, CachedPage, ResponseRow, StorageStats};

/// Name of the Binary Cache. It is not versioned with the page caches and
/// survives every activation.
pub const BINARY_CACHE_NAME: &str = "recipe-images-v1";

const SHELL_CACHE_PREFIX: &str = "larder-shell-";

/// Name of the page cache for a given cache generation.
pub fn shell_cache_name(version: &str) -> String {
    format!("{SHELL_CACHE_PREFIX}{version}")
}

impl Database {
    // ========================================================================
    // Binary Cache Operations
    // ========================================================================

    /// Store a binary response under its exact request URL.
    pub async fn put_binary(
        &self,
        url: &str,
        bytes: &[u8],
        content_type: Option<&str>,
    ) -> Result<()> {
        self.put_response(BINARY_CACHE_NAME, url, 200, content_type, bytes)
            .await
    }

    pub async fn get_binary(&self, url: &str) -> Result<Option<CachedBinary>> {
        Ok(self
            .fetch_row(BINARY_CACHE_NAME, url)
            .await?
            .map(ResponseRow::into_binary))
    }

    /// Remove a binary. Returns `true` if an entry was deleted.
    pub async fn delete_binary(&self, url: &str) -> Result<bool> {
        self.delete_response(BINARY_CACHE_NAME, url).await
    }

    pub async fn has_binary(&self, url: &str) -> Result<bool> {
        let row: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM response_cache WHERE cache_name = ? AND url = ?")
                .bind(BINARY_CACHE_NAME)
                .bind(url)
                .fetch_one(&self.pool)
                .await?;

        Ok(row.0 > 0)
    }

    /// URLs of every stored binary.
    pub async fn binary_urls(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT url FROM response_cache WHERE cache_name = ? ORDER BY url")
                .bind(BINARY_CACHE_NAME)
                .fetch_all(&self.pool)
                .await?;

        Ok(rows.into_iter().map(|(url,)| url).collect())
    }

    // ========================================================================
    // Named Response Cache Operations
    // ========================================================================

    /// Insert or replace a response in the named cache.
    pub async fn put_response(
        &self,
        cache_name: &str,
        url: &str,
        status: u16,
        content_type: Option<&str>,
        body: &[u8],
    ) -> Result<()> {
        let size_bytes = body.len() as i64;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO response_cache
                (cache_name, url, status, content_type, body, size_bytes, stored_at)
            VALUES (?, ?, ?, ?, ?, ?, datetime('now'))
        "#,
        )
        .bind(cache_name)
        .bind(url)
        .bind(i64::from(status))
        .bind(content_type)
        .bind(body)
        .bind(size_bytes)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Exact-URL lookup in one named cache.
    pub async fn match_response(&self, cache_name: &str, url: &str) -> Result<Option<CachedPage>> {
        Ok(self
            .fetch_row(cache_name, url)
            .await?
            .map(ResponseRow::into_page))
    }

    pub async fn delete_response(&self, cache_name: &str, url: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM response_cache WHERE cache_name = ? AND url = ?")
            .bind(cache_name)
            .bind(url)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Names of all caches that currently hold at least one entry.
    pub async fn cache_names(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT DISTINCT cache_name FROM response_cache ORDER BY cache_name")
                .fetch_all(&self.pool)
                .await?;

        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    /// Drop an entire named cache. Returns the number of entries removed.
    pub async fn delete_cache(&self, cache_name: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM response_cache WHERE cache_name = ?")
            .bind(cache_name)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    /// Compute aggregate counts and sizes across the offline stores.
    pub async fn storage_stats(&self) -> Result<StorageStats> {
        let (cached_recipes,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM recipe_cache")
            .fetch_one(&self.pool)
            .await?;

        let (cached_binaries, binary_bytes): (i64, Option<i64>) = sqlx::query_as(
            "SELECT COUNT(*), SUM(size_bytes) FROM response_cache WHERE cache_name = ?",
        )
        .bind(BINARY_CACHE_NAME)
        .fetch_one(&self.pool)
        .await?;

        let (cached_pages, page_bytes): (i64, Option<i64>) = sqlx::query_as(
            "SELECT COUNT(*), SUM(size_bytes) FROM response_cache WHERE cache_name != ?",
        )
        .bind(BINARY_CACHE_NAME)
        .fetch_one(&self.pool)
        .await?;

        Ok(StorageStats {
            cached_recipes,
            cached_binaries,
            binary_bytes: binary_bytes.unwrap_or(0),
            cached_pages,
            page_bytes: page_bytes.unwrap_or(0),
        })
    }

    async fn fetch_row(&self, cache_name: &str, url: &str) -> Result<Option<ResponseRow>> {
        let row: Option<ResponseRow> = sqlx::query_as(
            r#"
            SELECT url, status, content_type, body, stored_at
            FROM response_cache
            WHERE cache_name = ? AND url = ?
        "#,
        )
        .bind(cache_name)
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const IMAGE_URL: &str = "http://localhost:8000/api/recipes/r1/image";

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_binary_put_get_delete() {
        let db = test_db().await;
        db.put_binary(IMAGE_URL, b"\x89PNG", Some("image/png"))
            .await
            .unwrap();

        let cached = db.get_binary(IMAGE_URL).await.unwrap().unwrap();
        assert_eq!(cached.bytes, b"\x89PNG".to_vec());
        assert_eq!(cached.content_type.as_deref(), Some("image/png"));
        assert!(db.has_binary(IMAGE_URL).await.unwrap());

        assert!(db.delete_binary(IMAGE_URL).await.unwrap());
        assert!(!db.delete_binary(IMAGE_URL).await.unwrap());
        assert_eq!(db.get_binary(IMAGE_URL).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_binary_key_is_exact_url() {
        let db = test_db().await;
        db.put_binary(IMAGE_URL, b"img", None).await.unwrap();

        let with_query = format!("{IMAGE_URL}?v=2");
        assert_eq!(db.get_binary(&with_query).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_caches_are_isolated_by_name() {
        let db = test_db().await;
        let shell = shell_cache_name("v1");
        db.put_response(&shell, "http://localhost:8000/", 200, Some("text/html"), b"<html>")
            .await
            .unwrap();

        assert_eq!(
            db.match_response(BINARY_CACHE_NAME, "http://localhost:8000/")
                .await
                .unwrap(),
            None
        );
        let page = db
            .match_response(&shell, "http://localhost:8000/")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(page.status, 200);
        assert_eq!(page.body, b"<html>".to_vec());
    }

    #[tokio::test]
    async fn test_delete_cache_and_names() {
        let db = test_db().await;
        db.put_binary(IMAGE_URL, b"img", None).await.unwrap();
        db.put_response(&shell_cache_name("v0"), "http://localhost:8000/", 200, None, b"old")
            .await
            .unwrap();
        db.put_response(&shell_cache_name("v1"), "http://localhost:8000/", 200, None, b"new")
            .await
            .unwrap();

        assert_eq!(
            db.cache_names().await.unwrap(),
            vec!["larder-shell-v0", "larder-shell-v1", "recipe-images-v1"]
        );

        assert_eq!(db.delete_cache("larder-shell-v0").await.unwrap(), 1);
        assert_eq!(
            db.cache_names().await.unwrap(),
            vec!["larder-shell-v1", "recipe-images-v1"]
        );
    }

    #[tokio::test]
    async fn test_storage_stats() {
        let db = test_db().await;
        let stats = db.storage_stats().await.unwrap();
        assert_eq!(stats, StorageStats::default());

        db.put_binary(IMAGE_URL, b"12345", None).await.unwrap();
        db.put_response(&shell_cache_name("v1"), "http://localhost:8000/", 200, None, b"abc")
            .await
            .unwrap();

        let stats = db.storage_stats().await.unwrap();
        assert_eq!(stats.cached_binaries, 1);
        assert_eq!(stats.binary_bytes, 5);
        assert_eq!(stats.cached_pages, 1);
        assert_eq!(stats.page_bytes, 3);
        assert_eq!(stats.cached_recipes, 0);
    }
}
