use async_trait::async_trait;
use calcblog_core::{
    BlogFilter, BlogRecord, BlogStatus, FailedAttempt, NewCatalogEntry, PageRequest, Paginated,
    PublishedBlog, Settings, SourceCatalogEntry, SourceKind,
};
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{ContentStore, StoreError};

#[derive(Debug, Default)]
struct MemoryState {
    catalog: Vec<SourceCatalogEntry>,
    blogs: Vec<BlogRecord>,
    settings: Option<Settings>,
    settings_inserts: usize,
}

impl MemoryState {
    fn catalog_mut(&mut self, source_url: &str) -> Result<&mut SourceCatalogEntry, StoreError> {
        self.catalog
            .iter_mut()
            .find(|c| c.source_url == source_url)
            .ok_or_else(|| StoreError::NotFound(format!("catalog entry {source_url}")))
    }

    fn blog_mut(&mut self, id: Uuid) -> Result<&mut BlogRecord, StoreError> {
        self.blogs
            .iter_mut()
            .find(|b| b.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("blog {id}")))
    }
}

/// In-process [`ContentStore`] with the same uniqueness and ordering rules as Postgres.
#[derive(Debug, Default)]
pub struct MemoryContentStore {
    state: Mutex<MemoryState>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a catalog row's `created_at`, for ordering-sensitive tests.
    pub async fn backdate_catalog_entry(
        &self,
        source_url: &str,
        created_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.catalog_mut(source_url)?.created_at = created_at;
        Ok(())
    }

    /// Number of times the default settings row has been inserted.
    pub async fn settings_inserts(&self) -> usize {
        self.state.lock().await.settings_inserts
    }

    pub async fn blog_count(&self) -> usize {
        self.state.lock().await.blogs.len()
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn find_catalog_entry(
        &self,
        source_url: &str,
    ) -> Result<Option<SourceCatalogEntry>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .catalog
            .iter()
            .find(|c| c.source_url == source_url)
            .cloned())
    }

    async fn insert_catalog_entry(
        &self,
        entry: &NewCatalogEntry,
    ) -> Result<SourceCatalogEntry, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state
            .catalog
            .iter()
            .find(|c| c.source_url == entry.source_url)
        {
            return Ok(existing.clone());
        }
        let now = Utc::now();
        let row = SourceCatalogEntry {
            id: Uuid::new_v4(),
            source_url: entry.source_url.clone(),
            title: entry.title.clone(),
            kind: entry.kind,
            region: entry.region.clone(),
            eligible: entry.eligible,
            blog_id: None,
            created_at: now,
            updated_at: now,
        };
        state.catalog.push(row.clone());
        Ok(row)
    }

    async fn update_catalog_title(
        &self,
        source_url: &str,
        title: Option<&str>,
        kind: SourceKind,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let row = state.catalog_mut(source_url)?;
        row.title = title.map(ToString::to_string);
        row.kind = kind;
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn set_catalog_blog(&self, source_url: &str, blog_id: Uuid) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let row = state.catalog_mut(source_url)?;
        row.blog_id = Some(blog_id);
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn list_generation_candidates(
        &self,
        limit: Option<u32>,
    ) -> Result<Vec<SourceCatalogEntry>, StoreError> {
        let state = self.state.lock().await;
        let mut out = state
            .catalog
            .iter()
            .filter(|c| c.eligible)
            .filter(|c| {
                state
                    .blogs
                    .iter()
                    .find(|b| b.source_url == c.source_url)
                    .map_or(true, |b| b.status == BlogStatus::Failed)
            })
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.source_url.cmp(&b.source_url))
        });
        if let Some(limit) = limit {
            out.truncate(limit as usize);
        }
        Ok(out)
    }

    async fn get_blog(&self, id: Uuid) -> Result<Option<BlogRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.blogs.iter().find(|b| b.id == id).cloned())
    }

    async fn find_blog_by_source_url(
        &self,
        source_url: &str,
    ) -> Result<Option<BlogRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .blogs
            .iter()
            .find(|b| b.source_url == source_url)
            .cloned())
    }

    async fn find_published_blog_by_slug(
        &self,
        slug: &str,
    ) -> Result<Option<BlogRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .blogs
            .iter()
            .filter(|b| b.slug == slug && b.status == BlogStatus::Published)
            .max_by_key(|b| b.published_at)
            .cloned())
    }

    async fn list_blogs(
        &self,
        filter: BlogFilter,
        page: PageRequest,
    ) -> Result<Paginated<BlogRecord>, StoreError> {
        let state = self.state.lock().await;
        let mut matching = state
            .blogs
            .iter()
            .filter(|b| filter.matches(b))
            .cloned()
            .collect::<Vec<_>>();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        let total = matching.len() as u64;
        let offset = usize::try_from(page.offset()).unwrap_or(usize::MAX);
        let items = matching
            .into_iter()
            .skip(offset)
            .take(page.limit as usize)
            .collect();
        Ok(Paginated::new(items, total, page))
    }

    async fn upsert_published_blog(&self, blog: &PublishedBlog) -> Result<BlogRecord, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state
            .blogs
            .iter_mut()
            .find(|b| b.source_url == blog.source_url)
        {
            existing.slug = blog.slug.clone();
            existing.title = blog.title.clone();
            existing.meta_title = blog.meta_title.clone();
            existing.meta_desc = blog.meta_desc.clone();
            existing.content_md = blog.content_md.clone();
            existing.html = blog.html.clone();
            existing.json_ld = Some(blog.json_ld.clone());
            existing.keywords = blog.keywords.clone();
            existing.tone = blog.tone.clone();
            existing.audience = blog.audience.clone();
            existing.kind = blog.kind;
            existing.region = blog.region.clone();
            existing.model = blog.model.clone();
            existing.status = BlogStatus::Published;
            existing.last_error = None;
            existing.published_at = Some(blog.published_at);
            existing.updated_at = blog.published_at;
            return Ok(existing.clone());
        }

        let record = BlogRecord {
            id: Uuid::new_v4(),
            source_url: blog.source_url.clone(),
            slug: blog.slug.clone(),
            title: blog.title.clone(),
            meta_title: blog.meta_title.clone(),
            meta_desc: blog.meta_desc.clone(),
            content_md: blog.content_md.clone(),
            html: blog.html.clone(),
            json_ld: Some(blog.json_ld.clone()),
            keywords: blog.keywords.clone(),
            tone: blog.tone.clone(),
            audience: blog.audience.clone(),
            kind: blog.kind,
            region: blog.region.clone(),
            model: blog.model.clone(),
            status: BlogStatus::Published,
            last_error: None,
            scheduled_for: None,
            published_at: Some(blog.published_at),
            created_at: blog.published_at,
            updated_at: blog.published_at,
        };
        state.blogs.push(record.clone());
        Ok(record)
    }

    async fn upsert_failed_blog(&self, attempt: &FailedAttempt) -> Result<BlogRecord, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state
            .blogs
            .iter_mut()
            .find(|b| b.source_url == attempt.source_url)
        {
            existing.status = BlogStatus::Failed;
            existing.last_error = Some(attempt.error.clone());
            existing.updated_at = attempt.failed_at;
            return Ok(existing.clone());
        }

        let record = BlogRecord {
            id: Uuid::new_v4(),
            source_url: attempt.source_url.clone(),
            slug: String::new(),
            title: String::new(),
            meta_title: String::new(),
            meta_desc: String::new(),
            content_md: String::new(),
            html: String::new(),
            json_ld: None,
            keywords: Vec::new(),
            tone: None,
            audience: None,
            kind: attempt.kind,
            region: None,
            model: None,
            status: BlogStatus::Failed,
            last_error: Some(attempt.error.clone()),
            scheduled_for: None,
            published_at: None,
            created_at: attempt.failed_at,
            updated_at: attempt.failed_at,
        };
        state.blogs.push(record.clone());
        Ok(record)
    }

    async fn save_blog_content(&self, record: &BlogRecord) -> Result<BlogRecord, StoreError> {
        let mut state = self.state.lock().await;
        let stored = state.blog_mut(record.id)?;
        stored.title = record.title.clone();
        stored.meta_title = record.meta_title.clone();
        stored.meta_desc = record.meta_desc.clone();
        stored.content_md = record.content_md.clone();
        stored.html = record.html.clone();
        stored.keywords = record.keywords.clone();
        stored.tone = record.tone.clone();
        stored.audience = record.audience.clone();
        stored.scheduled_for = record.scheduled_for;
        stored.updated_at = record.updated_at;
        Ok(stored.clone())
    }

    async fn update_blog_status(
        &self,
        id: Uuid,
        status: BlogStatus,
        now: DateTime<Utc>,
    ) -> Result<BlogRecord, StoreError> {
        let mut state = self.state.lock().await;
        let stored = state.blog_mut(id)?;
        stored.status = status;
        if status == BlogStatus::Published && stored.published_at.is_none() {
            stored.published_at = Some(now);
        }
        stored.updated_at = now;
        Ok(stored.clone())
    }

    async fn delete_blog(&self, id: Uuid) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let before = state.blogs.len();
        state.blogs.retain(|b| b.id != id);
        if state.blogs.len() == before {
            return Err(StoreError::NotFound(format!("blog {id}")));
        }
        let now = Utc::now();
        for entry in state.catalog.iter_mut().filter(|c| c.blog_id == Some(id)) {
            entry.blog_id = None;
            entry.updated_at = now;
        }
        Ok(())
    }

    async fn load_settings(&self) -> Result<Settings, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(settings) = &state.settings {
            return Ok(settings.clone());
        }
        let defaults = Settings::defaults(Utc::now());
        state.settings = Some(defaults.clone());
        state.settings_inserts += 1;
        Ok(defaults)
    }

    async fn save_settings(&self, settings: &Settings) -> Result<Settings, StoreError> {
        let mut state = self.state.lock().await;
        state.settings = Some(settings.clone());
        Ok(settings.clone())
    }
}
