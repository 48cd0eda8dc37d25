//! Content Store for calcblog: the `source_catalog`, `blogs_v2` and
//! `blog_v2_settings` tables behind one async trait.
//!
//! [`PgContentStore`] is the production implementation. [`MemoryContentStore`]
//! mirrors its semantics in-process and backs the pipeline and API tests.

use async_trait::async_trait;
use calcblog_core::{
    BlogError, BlogFilter, BlogRecord, BlogStatus, FailedAttempt, NewCatalogEntry, PageRequest,
    Paginated, PublishedBlog, Settings, SourceCatalogEntry, SourceKind,
};
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

mod memory;
mod postgres;

pub use memory::MemoryContentStore;
pub use postgres::PgContentStore;

pub const CRATE_NAME: &str = "calcblog-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt row: {0}")]
    Decode(String),
}

impl From<StoreError> for BlogError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => BlogError::NotFound(what),
            other => BlogError::Storage(other.to_string()),
        }
    }
}

/// Persistence seam shared by discovery, generation, the pipeline and the admin API.
///
/// No method takes a lock: uniqueness of `source_url` is the only guard against
/// duplicate rows, and concurrent upserts for the same source resolve last-write-wins.
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn find_catalog_entry(
        &self,
        source_url: &str,
    ) -> Result<Option<SourceCatalogEntry>, StoreError>;

    /// Insert if absent. When another writer got there first the existing row is returned.
    async fn insert_catalog_entry(
        &self,
        entry: &NewCatalogEntry,
    ) -> Result<SourceCatalogEntry, StoreError>;

    async fn update_catalog_title(
        &self,
        source_url: &str,
        title: Option<&str>,
        kind: SourceKind,
    ) -> Result<(), StoreError>;

    async fn set_catalog_blog(&self, source_url: &str, blog_id: Uuid) -> Result<(), StoreError>;

    /// Eligible rows with no blog or a FAILED blog, oldest first.
    async fn list_generation_candidates(
        &self,
        limit: Option<u32>,
    ) -> Result<Vec<SourceCatalogEntry>, StoreError>;

    async fn get_blog(&self, id: Uuid) -> Result<Option<BlogRecord>, StoreError>;

    async fn find_blog_by_source_url(
        &self,
        source_url: &str,
    ) -> Result<Option<BlogRecord>, StoreError>;

    async fn find_published_blog_by_slug(
        &self,
        slug: &str,
    ) -> Result<Option<BlogRecord>, StoreError>;

    /// Newest first.
    async fn list_blogs(
        &self,
        filter: BlogFilter,
        page: PageRequest,
    ) -> Result<Paginated<BlogRecord>, StoreError>;

    async fn upsert_published_blog(&self, blog: &PublishedBlog) -> Result<BlogRecord, StoreError>;

    async fn upsert_failed_blog(&self, attempt: &FailedAttempt) -> Result<BlogRecord, StoreError>;

    /// Persist the admin-editable fields of `record`.
    async fn save_blog_content(&self, record: &BlogRecord) -> Result<BlogRecord, StoreError>;

    /// `published_at` is stamped only on the first move into PUBLISHED.
    async fn update_blog_status(
        &self,
        id: Uuid,
        status: BlogStatus,
        now: DateTime<Utc>,
    ) -> Result<BlogRecord, StoreError>;

    /// Delete the blog, then clear any catalog back-reference to it.
    async fn delete_blog(&self, id: Uuid) -> Result<(), StoreError>;

    /// Read the singleton settings row, inserting the defaults on first access.
    async fn load_settings(&self) -> Result<Settings, StoreError>;

    async fn save_settings(&self, settings: &Settings) -> Result<Settings, StoreError>;
}
