use async_trait::async_trait;
use calcblog_core::{
    BlogFilter, BlogRecord, BlogStatus, FailedAttempt, NewCatalogEntry, PageRequest, Paginated,
    PublishedBlog, Settings, SourceCatalogEntry, SourceKind,
};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::info;
use uuid::Uuid;

use crate::{ContentStore, StoreError};

const CATALOG_COLUMNS: &str =
    "id, source_url, title, kind, region, eligible, blog_id, created_at, updated_at";

const BLOG_COLUMNS: &str = "id, source_url, slug, title, meta_title, meta_desc, content_md, html, \
     json_ld, keywords, tone, audience, kind, region, model, status, last_error, \
     scheduled_for, published_at, created_at, updated_at";

const SETTINGS_COLUMNS: &str =
    "enabled, default_tone, default_model, schedule_hour, schedule_timezone, updated_at";

#[derive(Debug, Clone)]
pub struct PgContentStore {
    pool: PgPool,
}

impl PgContentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn parse_kind(raw: &str) -> Result<SourceKind, StoreError> {
    raw.parse().map_err(|err| StoreError::Decode(format!("{err}")))
}

fn catalog_from_row(row: &PgRow) -> Result<SourceCatalogEntry, StoreError> {
    let kind: String = row.try_get("kind")?;
    Ok(SourceCatalogEntry {
        id: row.try_get("id")?,
        source_url: row.try_get("source_url")?,
        title: row.try_get("title")?,
        kind: parse_kind(&kind)?,
        region: row.try_get("region")?,
        eligible: row.try_get("eligible")?,
        blog_id: row.try_get("blog_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn blog_from_row(row: &PgRow) -> Result<BlogRecord, StoreError> {
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    Ok(BlogRecord {
        id: row.try_get("id")?,
        source_url: row.try_get("source_url")?,
        slug: row.try_get("slug")?,
        title: row.try_get("title")?,
        meta_title: row.try_get("meta_title")?,
        meta_desc: row.try_get("meta_desc")?,
        content_md: row.try_get("content_md")?,
        html: row.try_get("html")?,
        json_ld: row.try_get("json_ld")?,
        keywords: row.try_get("keywords")?,
        tone: row.try_get("tone")?,
        audience: row.try_get("audience")?,
        kind: parse_kind(&kind)?,
        region: row.try_get("region")?,
        model: row.try_get("model")?,
        status: status
            .parse()
            .map_err(|err| StoreError::Decode(format!("{err}")))?,
        last_error: row.try_get("last_error")?,
        scheduled_for: row.try_get("scheduled_for")?,
        published_at: row.try_get("published_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn settings_from_row(row: &PgRow) -> Result<Settings, StoreError> {
    let hour: i32 = row.try_get("schedule_hour")?;
    Ok(Settings {
        enabled: row.try_get("enabled")?,
        default_tone: row.try_get("default_tone")?,
        default_model: row.try_get("default_model")?,
        schedule_hour: u32::try_from(hour)
            .map_err(|_| StoreError::Decode(format!("schedule_hour {hour}")))?,
        schedule_timezone: row.try_get("schedule_timezone")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn hour_to_db(settings: &Settings) -> Result<i32, StoreError> {
    i32::try_from(settings.schedule_hour)
        .map_err(|_| StoreError::Decode(format!("schedule_hour {}", settings.schedule_hour)))
}

#[async_trait]
impl ContentStore for PgContentStore {
    async fn find_catalog_entry(
        &self,
        source_url: &str,
    ) -> Result<Option<SourceCatalogEntry>, StoreError> {
        let sql = format!("SELECT {CATALOG_COLUMNS} FROM source_catalog WHERE source_url = $1");
        let row = sqlx::query(&sql)
            .bind(source_url)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(catalog_from_row).transpose()
    }

    async fn insert_catalog_entry(
        &self,
        entry: &NewCatalogEntry,
    ) -> Result<SourceCatalogEntry, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO source_catalog (id, source_url, title, kind, region, eligible, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
            ON CONFLICT (source_url) DO NOTHING
            RETURNING {CATALOG_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(Uuid::new_v4())
            .bind(&entry.source_url)
            .bind(&entry.title)
            .bind(entry.kind.as_str())
            .bind(&entry.region)
            .bind(entry.eligible)
            .bind(Utc::now())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => catalog_from_row(&row),
            None => self
                .find_catalog_entry(&entry.source_url)
                .await?
                .ok_or_else(|| StoreError::NotFound(format!("catalog entry {}", entry.source_url))),
        }
    }

    async fn update_catalog_title(
        &self,
        source_url: &str,
        title: Option<&str>,
        kind: SourceKind,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE source_catalog
               SET title = $2,
                   kind = $3,
                   updated_at = NOW()
             WHERE source_url = $1
            "#,
        )
        .bind(source_url)
        .bind(title)
        .bind(kind.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("catalog entry {source_url}")));
        }
        Ok(())
    }

    async fn set_catalog_blog(&self, source_url: &str, blog_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE source_catalog
               SET blog_id = $2,
                   updated_at = NOW()
             WHERE source_url = $1
            "#,
        )
        .bind(source_url)
        .bind(blog_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("catalog entry {source_url}")));
        }
        Ok(())
    }

    async fn list_generation_candidates(
        &self,
        limit: Option<u32>,
    ) -> Result<Vec<SourceCatalogEntry>, StoreError> {
        // A NULL limit is LIMIT ALL in Postgres.
        let sql = r#"
            SELECT c.id, c.source_url, c.title, c.kind, c.region, c.eligible, c.blog_id,
                   c.created_at, c.updated_at
              FROM source_catalog c
              LEFT JOIN blogs_v2 b ON b.source_url = c.source_url
             WHERE c.eligible
               AND (b.id IS NULL OR b.status = 'FAILED')
             ORDER BY c.created_at ASC, c.source_url ASC
             LIMIT $1
            "#;
        let rows = sqlx::query(sql)
            .bind(limit.map(i64::from))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(catalog_from_row).collect()
    }

    async fn get_blog(&self, id: Uuid) -> Result<Option<BlogRecord>, StoreError> {
        let sql = format!("SELECT {BLOG_COLUMNS} FROM blogs_v2 WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(blog_from_row).transpose()
    }

    async fn find_blog_by_source_url(
        &self,
        source_url: &str,
    ) -> Result<Option<BlogRecord>, StoreError> {
        let sql = format!("SELECT {BLOG_COLUMNS} FROM blogs_v2 WHERE source_url = $1");
        let row = sqlx::query(&sql)
            .bind(source_url)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(blog_from_row).transpose()
    }

    async fn find_published_blog_by_slug(
        &self,
        slug: &str,
    ) -> Result<Option<BlogRecord>, StoreError> {
        // Slugs are not unique; the most recently published one wins.
        let sql = format!(
            r#"
            SELECT {BLOG_COLUMNS}
              FROM blogs_v2
             WHERE slug = $1
               AND status = 'PUBLISHED'
             ORDER BY published_at DESC NULLS LAST
             LIMIT 1
            "#
        );
        let row = sqlx::query(&sql)
            .bind(slug)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(blog_from_row).transpose()
    }

    async fn list_blogs(
        &self,
        filter: BlogFilter,
        page: PageRequest,
    ) -> Result<Paginated<BlogRecord>, StoreError> {
        let status = filter.status.map(|s| s.as_str());
        let kind = filter.kind.map(|k| k.as_str());

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
              FROM blogs_v2
             WHERE ($1::text IS NULL OR status = $1)
               AND ($2::text IS NULL OR kind = $2)
            "#,
        )
        .bind(status)
        .bind(kind)
        .fetch_one(&self.pool)
        .await?;

        let sql = format!(
            r#"
            SELECT {BLOG_COLUMNS}
              FROM blogs_v2
             WHERE ($1::text IS NULL OR status = $1)
               AND ($2::text IS NULL OR kind = $2)
             ORDER BY created_at DESC, id
             LIMIT $3 OFFSET $4
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(status)
            .bind(kind)
            .bind(i64::from(page.limit))
            .bind(i64::try_from(page.offset()).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        let items = rows.iter().map(blog_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok(Paginated::new(items, u64::try_from(total).unwrap_or(0), page))
    }

    async fn upsert_published_blog(&self, blog: &PublishedBlog) -> Result<BlogRecord, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO blogs_v2 (
                id, source_url, slug, title, meta_title, meta_desc, content_md, html,
                json_ld, keywords, tone, audience, kind, region, model, status, last_error,
                published_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                    'PUBLISHED', NULL, $16, $16, $16)
            ON CONFLICT (source_url) DO UPDATE
               SET slug = EXCLUDED.slug,
                   title = EXCLUDED.title,
                   meta_title = EXCLUDED.meta_title,
                   meta_desc = EXCLUDED.meta_desc,
                   content_md = EXCLUDED.content_md,
                   html = EXCLUDED.html,
                   json_ld = EXCLUDED.json_ld,
                   keywords = EXCLUDED.keywords,
                   tone = EXCLUDED.tone,
                   audience = EXCLUDED.audience,
                   kind = EXCLUDED.kind,
                   region = EXCLUDED.region,
                   model = EXCLUDED.model,
                   status = 'PUBLISHED',
                   last_error = NULL,
                   published_at = EXCLUDED.published_at,
                   updated_at = EXCLUDED.updated_at
            RETURNING {BLOG_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(Uuid::new_v4())
            .bind(&blog.source_url)
            .bind(&blog.slug)
            .bind(&blog.title)
            .bind(&blog.meta_title)
            .bind(&blog.meta_desc)
            .bind(&blog.content_md)
            .bind(&blog.html)
            .bind(&blog.json_ld)
            .bind(&blog.keywords)
            .bind(&blog.tone)
            .bind(&blog.audience)
            .bind(blog.kind.as_str())
            .bind(&blog.region)
            .bind(&blog.model)
            .bind(blog.published_at)
            .fetch_one(&self.pool)
            .await?;
        blog_from_row(&row)
    }

    async fn upsert_failed_blog(&self, attempt: &FailedAttempt) -> Result<BlogRecord, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO blogs_v2 (id, source_url, kind, status, last_error, created_at, updated_at)
            VALUES ($1, $2, $3, 'FAILED', $4, $5, $5)
            ON CONFLICT (source_url) DO UPDATE
               SET status = 'FAILED',
                   last_error = EXCLUDED.last_error,
                   updated_at = EXCLUDED.updated_at
            RETURNING {BLOG_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(Uuid::new_v4())
            .bind(&attempt.source_url)
            .bind(attempt.kind.as_str())
            .bind(&attempt.error)
            .bind(attempt.failed_at)
            .fetch_one(&self.pool)
            .await?;
        blog_from_row(&row)
    }

    async fn save_blog_content(&self, record: &BlogRecord) -> Result<BlogRecord, StoreError> {
        let sql = format!(
            r#"
            UPDATE blogs_v2
               SET title = $2,
                   meta_title = $3,
                   meta_desc = $4,
                   content_md = $5,
                   html = $6,
                   keywords = $7,
                   tone = $8,
                   audience = $9,
                   scheduled_for = $10,
                   updated_at = $11
             WHERE id = $1
            RETURNING {BLOG_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(record.id)
            .bind(&record.title)
            .bind(&record.meta_title)
            .bind(&record.meta_desc)
            .bind(&record.content_md)
            .bind(&record.html)
            .bind(&record.keywords)
            .bind(&record.tone)
            .bind(&record.audience)
            .bind(record.scheduled_for)
            .bind(record.updated_at)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => blog_from_row(&row),
            None => Err(StoreError::NotFound(format!("blog {}", record.id))),
        }
    }

    async fn update_blog_status(
        &self,
        id: Uuid,
        status: BlogStatus,
        now: DateTime<Utc>,
    ) -> Result<BlogRecord, StoreError> {
        let sql = format!(
            r#"
            UPDATE blogs_v2
               SET status = $2::text,
                   published_at = CASE
                       WHEN $2::text = 'PUBLISHED' AND published_at IS NULL THEN $3
                       ELSE published_at
                   END,
                   updated_at = $3
             WHERE id = $1
            RETURNING {BLOG_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(status.as_str())
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => blog_from_row(&row),
            None => Err(StoreError::NotFound(format!("blog {id}"))),
        }
    }

    async fn delete_blog(&self, id: Uuid) -> Result<(), StoreError> {
        let deleted = sqlx::query("DELETE FROM blogs_v2 WHERE id = $1 RETURNING source_url")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        if deleted.is_none() {
            return Err(StoreError::NotFound(format!("blog {id}")));
        }
        sqlx::query(
            r#"
            UPDATE source_catalog
               SET blog_id = NULL,
                   updated_at = NOW()
             WHERE blog_id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_settings(&self) -> Result<Settings, StoreError> {
        let select = format!("SELECT {SETTINGS_COLUMNS} FROM blog_v2_settings WHERE id = 1");
        if let Some(row) = sqlx::query(&select).fetch_optional(&self.pool).await? {
            return settings_from_row(&row);
        }

        let defaults = Settings::defaults(Utc::now());
        let inserted = sqlx::query(
            r#"
            INSERT INTO blog_v2_settings (id, enabled, default_tone, default_model,
                                          schedule_hour, schedule_timezone, updated_at)
            VALUES (1, $1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(defaults.enabled)
        .bind(&defaults.default_tone)
        .bind(&defaults.default_model)
        .bind(hour_to_db(&defaults)?)
        .bind(&defaults.schedule_timezone)
        .bind(defaults.updated_at)
        .execute(&self.pool)
        .await?;
        if inserted.rows_affected() > 0 {
            info!("bootstrapped default blog settings row");
        }

        let row = sqlx::query(&select).fetch_one(&self.pool).await?;
        settings_from_row(&row)
    }

    async fn save_settings(&self, settings: &Settings) -> Result<Settings, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO blog_v2_settings (id, enabled, default_tone, default_model,
                                          schedule_hour, schedule_timezone, updated_at)
            VALUES (1, $1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE
               SET enabled = EXCLUDED.enabled,
                   default_tone = EXCLUDED.default_tone,
                   default_model = EXCLUDED.default_model,
                   schedule_hour = EXCLUDED.schedule_hour,
                   schedule_timezone = EXCLUDED.schedule_timezone,
                   updated_at = EXCLUDED.updated_at
            RETURNING {SETTINGS_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(settings.enabled)
            .bind(&settings.default_tone)
            .bind(&settings.default_model)
            .bind(hour_to_db(settings)?)
            .bind(&settings.schedule_timezone)
            .bind(settings.updated_at)
            .fetch_one(&self.pool)
            .await?;
        settings_from_row(&row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Runs against a live database only when `CALCBLOG_TEST_DATABASE_URL` is set.
    async fn test_store() -> Option<PgContentStore> {
        let url = std::env::var("CALCBLOG_TEST_DATABASE_URL").ok()?;
        let store = PgContentStore::connect(&url).await.expect("connect");
        store.migrate().await.expect("migrate");
        sqlx::query("TRUNCATE source_catalog, blogs_v2, blog_v2_settings")
            .execute(store.pool())
            .await
            .expect("truncate");
        Some(store)
    }

    #[tokio::test]
    async fn postgres_round_trip_when_configured() {
        let Some(store) = test_store().await else {
            return;
        };

        let first = store.load_settings().await.expect("settings");
        let second = store.load_settings().await.expect("settings again");
        assert_eq!(first, second);
        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM blog_v2_settings")
            .fetch_one(store.pool())
            .await
            .expect("count");
        assert_eq!(rows, 1);

        store
            .insert_catalog_entry(&NewCatalogEntry {
                source_url: "/tools/bmi".into(),
                title: Some("BMI".into()),
                kind: SourceKind::Tool,
                region: None,
                eligible: true,
            })
            .await
            .expect("insert");
        let candidates = store.list_generation_candidates(Some(2)).await.expect("candidates");
        assert_eq!(candidates.len(), 1);

        let failed = store
            .upsert_failed_blog(&FailedAttempt {
                source_url: "/tools/bmi".into(),
                kind: SourceKind::Tool,
                error: "boom".into(),
                failed_at: Utc::now(),
            })
            .await
            .expect("failed upsert");
        assert_eq!(failed.status, BlogStatus::Failed);
        let candidates = store.list_generation_candidates(None).await.expect("candidates");
        assert_eq!(candidates.len(), 1);
    }
}
