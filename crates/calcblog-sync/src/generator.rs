//! Draft generation for a single catalog source: prompt, API call, derived
//! fields, upsert, catalog back-reference, and the FAILED marker on error.

use std::sync::Arc;

use calcblog_core::{
    build_json_ld, generate_slug, infer_region, render_markdown, BlogError, BlogRecord,
    BlogStatus, FailedAttempt, JsonLdInput, PublishedBlog, Settings, SourceCatalogEntry,
    SourceKind, DEFAULT_AUDIENCE,
};
use calcblog_storage::ContentStore;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{error, info, info_span, warn, Instrument};

use crate::llm::{GeneratedDraft, PromptRequest, TextGenerator};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteConfig {
    pub base_url: String,
    pub site_name: String,
}

/// Per-request tone/audience that take precedence over the settings defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct GenerationOverrides {
    pub tone: Option<String>,
    pub audience: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationContext {
    pub source_url: String,
    pub title: String,
    pub kind: SourceKind,
    pub region: String,
    pub tone: String,
    pub audience: String,
    pub model: String,
}

impl GenerationContext {
    pub fn resolve(
        entry: &SourceCatalogEntry,
        settings: &Settings,
        overrides: &GenerationOverrides,
    ) -> Self {
        let region = entry
            .region
            .clone()
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| infer_region(&entry.source_url).to_string());
        Self {
            source_url: entry.source_url.clone(),
            title: entry.display_title(),
            kind: entry.kind,
            region,
            tone: overrides
                .tone
                .clone()
                .unwrap_or_else(|| settings.default_tone.clone()),
            audience: overrides
                .audience
                .clone()
                .unwrap_or_else(|| DEFAULT_AUDIENCE.to_string()),
            model: settings.default_model.clone(),
        }
    }
}

const SYSTEM_PROMPT: &str = "You are an experienced editor writing helpful, accurate blog \
posts for a website of free online calculators and tools. Respond with a single JSON object \
and nothing else. The object must have exactly these fields: \"title\" (string), \
\"metaTitle\" (string, at most 60 characters), \"metaDesc\" (string, at most 155 characters), \
\"contentMd\" (string, the full article in Markdown) and \"keywords\" (array of 5 to 8 strings).";

pub fn build_prompt(ctx: &GenerationContext, site: &SiteConfig) -> PromptRequest {
    let tool_url = format!("{}{}", site.base_url.trim_end_matches('/'), ctx.source_url);
    let region_line = if ctx.region == calcblog_core::DEFAULT_REGION {
        "The article is for an international audience; avoid country-specific rules.".to_string()
    } else {
        format!(
            "The page targets {region}; use {region}-specific rules, terminology and currency where relevant.",
            region = ctx.region.replace('-', " ")
        )
    };
    let user = format!(
        "Write a blog post of 1,200 to 1,500 words about the {kind} page \"{title}\" on {site_name}.\n\
         \n\
         Page URL: {tool_url}\n\
         Tone: {tone}\n\
         Audience: {audience}\n\
         {region_line}\n\
         \n\
         Explain what the {kind} does, how to use it step by step, how the results should be \
         interpreted, and common mistakes. Include at least one worked example and a short FAQ \
         section. Link to the page at least once using a Markdown link to {tool_url}. \
         Use H2 and H3 headings, never H1.",
        kind = kind_label(ctx.kind),
        title = ctx.title,
        site_name = site.site_name,
        tone = ctx.tone,
        audience = ctx.audience,
    );
    PromptRequest {
        model: ctx.model.clone(),
        system: SYSTEM_PROMPT.to_string(),
        user,
    }
}

fn kind_label(kind: SourceKind) -> &'static str {
    match kind {
        SourceKind::Calculator => "calculator",
        SourceKind::Tool => "online tool",
        SourceKind::AiHub => "AI tool",
        SourceKind::Other => "page",
    }
}

/// Turn the model's draft into the persisted payload.
pub fn derive_published_blog(
    ctx: &GenerationContext,
    site: &SiteConfig,
    draft: GeneratedDraft,
    now: DateTime<Utc>,
) -> PublishedBlog {
    let slug = generate_slug(&draft.title);
    let json_ld = build_json_ld(&JsonLdInput {
        base_url: &site.base_url,
        site_name: &site.site_name,
        slug: &slug,
        headline: &draft.title,
        description: &draft.meta_desc,
        keywords: &draft.keywords,
        published_at: now,
        modified_at: now,
    });
    PublishedBlog {
        source_url: ctx.source_url.clone(),
        html: render_markdown(&draft.content_md),
        slug,
        title: draft.title,
        meta_title: draft.meta_title,
        meta_desc: draft.meta_desc,
        content_md: draft.content_md,
        json_ld,
        keywords: draft.keywords,
        tone: Some(ctx.tone.clone()),
        audience: Some(ctx.audience.clone()),
        kind: ctx.kind,
        region: Some(ctx.region.clone()),
        model: Some(ctx.model.clone()),
        published_at: now,
    }
}

/// Produces or refreshes exactly one blog row per catalog source.
///
/// There is no claim step before the API call: two attempts for the same source
/// both pay for generation and the later upsert wins.
#[derive(Clone)]
pub struct DraftGenerator {
    store: Arc<dyn ContentStore>,
    llm: Arc<dyn TextGenerator>,
    site: SiteConfig,
}

impl DraftGenerator {
    pub fn new(store: Arc<dyn ContentStore>, llm: Arc<dyn TextGenerator>, site: SiteConfig) -> Self {
        Self { store, llm, site }
    }

    pub fn store(&self) -> &Arc<dyn ContentStore> {
        &self.store
    }

    pub fn site(&self) -> &SiteConfig {
        &self.site
    }

    /// One attempt. On error a FAILED row is written and the error returned;
    /// the caller decides whether to surface it.
    pub async fn generate(
        &self,
        entry: &SourceCatalogEntry,
        settings: &Settings,
        overrides: &GenerationOverrides,
    ) -> Result<BlogRecord, BlogError> {
        let span = info_span!("generate_draft", source_url = %entry.source_url);
        async move {
            match self.attempt(entry, settings, overrides).await {
                Ok(record) => Ok(record),
                Err(err) => {
                    self.record_failure(entry, &err).await;
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Manual entry point: refuses to overwrite an existing blog unless `force`.
    /// A FAILED row counts as nothing to overwrite.
    pub async fn generate_on_demand(
        &self,
        source_url: &str,
        force: bool,
        overrides: &GenerationOverrides,
    ) -> Result<BlogRecord, BlogError> {
        let entry = self
            .store
            .find_catalog_entry(source_url)
            .await?
            .ok_or_else(|| BlogError::NotFound(format!("source {source_url}")))?;

        if let Some(existing) = self.store.find_blog_by_source_url(source_url).await? {
            if !force && existing.status != BlogStatus::Failed {
                return Err(BlogError::AlreadyExists(format!("blog for {source_url}")));
            }
        }

        let settings = self.store.load_settings().await?;
        self.generate(&entry, &settings, overrides).await
    }

    async fn attempt(
        &self,
        entry: &SourceCatalogEntry,
        settings: &Settings,
        overrides: &GenerationOverrides,
    ) -> Result<BlogRecord, BlogError> {
        let ctx = GenerationContext::resolve(entry, settings, overrides);
        let request = build_prompt(&ctx, &self.site);
        let draft = self.llm.generate(&request).await?;

        let published = derive_published_blog(&ctx, &self.site, draft, Utc::now());
        let record = self.store.upsert_published_blog(&published).await?;
        self.store.set_catalog_blog(&entry.source_url, record.id).await?;

        info!(blog_id = %record.id, slug = %record.slug, "draft published");
        Ok(record)
    }

    async fn record_failure(&self, entry: &SourceCatalogEntry, err: &BlogError) {
        let attempt = FailedAttempt {
            source_url: entry.source_url.clone(),
            kind: entry.kind,
            error: err.to_string(),
            failed_at: Utc::now(),
        };
        match self.store.upsert_failed_blog(&attempt).await {
            Ok(record) => warn!(blog_id = %record.id, error = %err, "generation failed; marked FAILED"),
            Err(store_err) => error!(
                error = %err,
                store_error = %store_err,
                "generation failed and the FAILED marker could not be written"
            ),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use calcblog_core::NewCatalogEntry;
    use calcblog_storage::MemoryContentStore;
    use tokio::sync::Mutex;

    use super::*;

    /// Pops one scripted result per call and records every prompt.
    #[derive(Default)]
    pub(crate) struct ScriptedGenerator {
        replies: Mutex<VecDeque<Result<GeneratedDraft, BlogError>>>,
        pub(crate) calls: Mutex<Vec<PromptRequest>>,
    }

    impl ScriptedGenerator {
        pub(crate) fn new(replies: Vec<Result<GeneratedDraft, BlogError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl TextGenerator for ScriptedGenerator {
        async fn generate(&self, request: &PromptRequest) -> Result<GeneratedDraft, BlogError> {
            self.calls.lock().await.push(request.clone());
            self.replies
                .lock()
                .await
                .pop_front()
                .unwrap_or_else(|| Err(BlogError::Upstream("no scripted reply".into())))
        }
    }

    pub(crate) fn draft(title: &str) -> GeneratedDraft {
        GeneratedDraft {
            title: title.to_string(),
            meta_title: format!("{title} | Guide"),
            meta_desc: format!("Everything about {title}"),
            content_md: format!("## {title}\n\nUse the calculator."),
            keywords: vec!["tax".into(), "calculator".into()],
        }
    }

    pub(crate) fn site() -> SiteConfig {
        SiteConfig {
            base_url: "https://calc.example".into(),
            site_name: "Calc Example".into(),
        }
    }

    pub(crate) async fn seed(store: &MemoryContentStore, url: &str, title: &str) -> SourceCatalogEntry {
        store
            .insert_catalog_entry(&NewCatalogEntry {
                source_url: url.to_string(),
                title: Some(title.to_string()),
                kind: SourceKind::Calculator,
                region: None,
                eligible: true,
            })
            .await
            .expect("seed catalog")
    }

    #[tokio::test]
    async fn success_publishes_and_links_catalog() {
        let store = Arc::new(MemoryContentStore::new());
        let entry = seed(&store, "/calculators/australia/income-tax", "Income Tax").await;
        let llm = Arc::new(ScriptedGenerator::new(vec![Ok(draft("Income Tax in Australia!"))]));
        let generator = DraftGenerator::new(store.clone(), llm.clone(), site());
        let settings = Settings::defaults(Utc::now());

        let record = generator
            .generate(&entry, &settings, &GenerationOverrides::default())
            .await
            .expect("generate");

        assert_eq!(record.status, BlogStatus::Published);
        assert_eq!(record.slug, "income-tax-in-australia");
        assert!(record.published_at.is_some());
        assert!(record.html.contains("<h2>Income Tax in Australia!</h2>"));
        assert_eq!(record.region.as_deref(), Some("australia"));
        let json_ld = record.json_ld.clone().expect("json-ld");
        assert_eq!(json_ld["url"], "https://calc.example/blog/income-tax-in-australia");
        assert_eq!(json_ld["keywords"], "tax, calculator");

        let catalog = store
            .find_catalog_entry(&entry.source_url)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(catalog.blog_id, Some(record.id));

        let calls = llm.calls.lock().await;
        assert_eq!(calls[0].model, "gpt-4o-mini");
        assert!(calls[0].user.contains("Tone: professional"));
        assert!(calls[0].user.contains("australia-specific"));
        assert!(calls[0].user.contains("https://calc.example/calculators/australia/income-tax"));
    }

    #[tokio::test]
    async fn failure_marks_failed_and_stays_selectable() {
        let store = Arc::new(MemoryContentStore::new());
        let entry = seed(&store, "/tools/bmi", "BMI").await;
        let llm = Arc::new(ScriptedGenerator::new(vec![Err(BlogError::Upstream(
            "HTTP 500".into(),
        ))]));
        let generator = DraftGenerator::new(store.clone(), llm, site());

        let err = generator
            .generate(&entry, &Settings::defaults(Utc::now()), &GenerationOverrides::default())
            .await
            .unwrap_err();
        assert!(err.is_recoverable());

        let blog = store
            .find_blog_by_source_url("/tools/bmi")
            .await
            .unwrap()
            .expect("failed row");
        assert_eq!(blog.status, BlogStatus::Failed);
        assert!(blog.last_error.unwrap().contains("HTTP 500"));

        let catalog = store.find_catalog_entry("/tools/bmi").await.unwrap().unwrap();
        assert_eq!(catalog.blog_id, None);
        let candidates = store.list_generation_candidates(Some(2)).await.unwrap();
        assert_eq!(candidates[0].source_url, "/tools/bmi");
    }

    #[tokio::test]
    async fn manual_generation_without_force_conflicts() {
        let store = Arc::new(MemoryContentStore::new());
        seed(&store, "/tools/bmi", "BMI").await;
        let llm = Arc::new(ScriptedGenerator::new(vec![
            Ok(draft("BMI Basics")),
            Ok(draft("BMI Revisited")),
        ]));
        let generator = DraftGenerator::new(store.clone(), llm, site());
        let overrides = GenerationOverrides {
            tone: Some("playful".into()),
            audience: Some("students".into()),
        };

        let first = generator
            .generate_on_demand("/tools/bmi", false, &overrides)
            .await
            .expect("first");
        assert_eq!(first.tone.as_deref(), Some("playful"));
        assert_eq!(first.audience.as_deref(), Some("students"));

        let second = generator
            .generate_on_demand("/tools/bmi", false, &overrides)
            .await;
        assert!(matches!(second, Err(BlogError::AlreadyExists(_))));
        assert_eq!(store.blog_count().await, 1);

        let forced = generator
            .generate_on_demand("/tools/bmi", true, &GenerationOverrides::default())
            .await
            .expect("forced");
        assert_eq!(forced.id, first.id);
        assert_eq!(forced.title, "BMI Revisited");
        assert_eq!(store.blog_count().await, 1);
    }

    #[tokio::test]
    async fn manual_generation_of_unknown_source_is_not_found() {
        let store = Arc::new(MemoryContentStore::new());
        let generator = DraftGenerator::new(store.clone(), Arc::new(ScriptedGenerator::default()), site());
        let err = generator
            .generate_on_demand("/nope", false, &GenerationOverrides::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BlogError::NotFound(_)));
        assert_eq!(store.blog_count().await, 0);
    }

    #[tokio::test]
    async fn failed_row_can_be_retried_manually_without_force() {
        let store = Arc::new(MemoryContentStore::new());
        seed(&store, "/tools/bmi", "BMI").await;
        let llm = Arc::new(ScriptedGenerator::new(vec![
            Err(BlogError::MalformedResponse("bad".into())),
            Ok(draft("BMI Basics")),
        ]));
        let generator = DraftGenerator::new(store.clone(), llm, site());
        let overrides = GenerationOverrides::default();

        assert!(generator
            .generate_on_demand("/tools/bmi", false, &overrides)
            .await
            .is_err());
        let retried = generator
            .generate_on_demand("/tools/bmi", false, &overrides)
            .await
            .expect("retry");
        assert_eq!(retried.status, BlogStatus::Published);
        assert_eq!(retried.last_error, None);
    }

    #[test]
    fn context_prefers_overrides_then_settings() {
        let now = Utc::now();
        let entry = SourceCatalogEntry {
            id: uuid::Uuid::new_v4(),
            source_url: "/tools/numerology/life-path".into(),
            title: None,
            kind: SourceKind::Tool,
            region: None,
            eligible: true,
            blog_id: None,
            created_at: now,
            updated_at: now,
        };
        let mut settings = Settings::defaults(now);
        settings.default_tone = "warm".into();
        let ctx = GenerationContext::resolve(&entry, &settings, &GenerationOverrides::default());
        assert_eq!(ctx.title, "Life Path");
        assert_eq!(ctx.tone, "warm");
        assert_eq!(ctx.audience, DEFAULT_AUDIENCE);
        assert_eq!(ctx.region, "global");

        let prompt = build_prompt(&ctx, &site());
        assert!(prompt.system.contains("\"contentMd\""));
        assert!(prompt.user.contains("international audience"));
    }
}
