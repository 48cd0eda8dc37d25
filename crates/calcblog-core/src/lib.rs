//! Core domain model for the calcblog pipeline: catalog entries, blog records,
//! settings, and the pure derivations (slug, region, Markdown, JSON-LD) the
//! generator and the admin API share.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, Utc};
use pulldown_cmark::{html, Options, Parser};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "calcblog-core";

pub const SLUG_MAX_LEN: usize = 100;
pub const DEFAULT_REGION: &str = "global";
pub const DEFAULT_AUDIENCE: &str = "general readers";
pub const DEFAULT_PAGE_LIMIT: u32 = 20;

/// What kind of page a source is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Calculator,
    Tool,
    AiHub,
    #[default]
    Other,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Calculator => "calculator",
            Self::Tool => "tool",
            Self::AiHub => "ai_hub",
            Self::Other => "other",
        }
    }

    /// Catalog rows of kind `other` are tracked but not drafted by default.
    pub fn eligible_by_default(&self) -> bool {
        !matches!(self, Self::Other)
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = BlogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "calculator" => Ok(Self::Calculator),
            "tool" => Ok(Self::Tool),
            "ai_hub" | "ai-hub" => Ok(Self::AiHub),
            "other" => Ok(Self::Other),
            other => Err(BlogError::Invalid(format!("unknown source kind `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BlogStatus {
    Draft,
    Approved,
    Published,
    /// Last generation attempt errored; the source is selectable again.
    Failed,
}

impl BlogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "DRAFT",
            Self::Approved => "APPROVED",
            Self::Published => "PUBLISHED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for BlogStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BlogStatus {
    type Err = BlogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DRAFT" => Ok(Self::Draft),
            "APPROVED" => Ok(Self::Approved),
            "PUBLISHED" => Ok(Self::Published),
            "FAILED" => Ok(Self::Failed),
            other => Err(BlogError::Invalid(format!("unknown blog status `{other}`"))),
        }
    }
}

/// Unified error for every calcblog entry point.
///
/// Background callers (the scheduled pipeline) suppress per-item errors and keep
/// going; request callers map the variant onto a response status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BlogError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("invalid input: {0}")]
    Invalid(String),
    #[error("generation API failed: {0}")]
    Upstream(String),
    #[error("malformed generation response: {0}")]
    MalformedResponse(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl BlogError {
    /// True when a later run could plausibly succeed without anyone intervening.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Upstream(_) | Self::MalformedResponse(_) | Self::Storage(_)
        )
    }
}

/// Catalog row tracking one source page and its generated blog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCatalogEntry {
    pub id: Uuid,
    pub source_url: String,
    pub title: Option<String>,
    pub kind: SourceKind,
    pub region: Option<String>,
    pub eligible: bool,
    pub blog_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SourceCatalogEntry {
    pub fn display_title(&self) -> String {
        self.title
            .clone()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| title_from_path(&self.source_url))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCatalogEntry {
    pub source_url: String,
    pub title: Option<String>,
    pub kind: SourceKind,
    pub region: Option<String>,
    pub eligible: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlogRecord {
    pub id: Uuid,
    pub source_url: String,
    pub slug: String,
    pub title: String,
    pub meta_title: String,
    pub meta_desc: String,
    pub content_md: String,
    pub html: String,
    pub json_ld: Option<JsonValue>,
    pub keywords: Vec<String>,
    pub tone: Option<String>,
    pub audience: Option<String>,
    pub kind: SourceKind,
    pub region: Option<String>,
    pub model: Option<String>,
    pub status: BlogStatus,
    pub last_error: Option<String>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Payload of a successful generation, upserted on `source_url`.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedBlog {
    pub source_url: String,
    pub slug: String,
    pub title: String,
    pub meta_title: String,
    pub meta_desc: String,
    pub content_md: String,
    pub html: String,
    pub json_ld: JsonValue,
    pub keywords: Vec<String>,
    pub tone: Option<String>,
    pub audience: Option<String>,
    pub kind: SourceKind,
    pub region: Option<String>,
    pub model: Option<String>,
    pub published_at: DateTime<Utc>,
}

/// Minimal marker written when a generation attempt errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedAttempt {
    pub source_url: String,
    pub kind: SourceKind,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// Admin edit of a blog. `None` keeps the stored value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlogPatch {
    pub title: Option<String>,
    pub meta_title: Option<String>,
    pub meta_desc: Option<String>,
    pub content_md: Option<String>,
    pub keywords: Option<Vec<String>>,
    pub tone: Option<String>,
    pub audience: Option<String>,
    pub scheduled_for: Option<DateTime<Utc>>,
}

impl BlogPatch {
    /// Apply onto `record`, re-rendering `html` when the Markdown changes.
    pub fn apply(self, record: &mut BlogRecord, now: DateTime<Utc>) {
        if let Some(title) = self.title {
            record.title = title;
        }
        if let Some(meta_title) = self.meta_title {
            record.meta_title = meta_title;
        }
        if let Some(meta_desc) = self.meta_desc {
            record.meta_desc = meta_desc;
        }
        if let Some(content_md) = self.content_md {
            if content_md != record.content_md {
                record.html = render_markdown(&content_md);
                record.content_md = content_md;
            }
        }
        if let Some(keywords) = self.keywords {
            record.keywords = keywords;
        }
        if self.tone.is_some() {
            record.tone = self.tone;
        }
        if self.audience.is_some() {
            record.audience = self.audience;
        }
        if self.scheduled_for.is_some() {
            record.scheduled_for = self.scheduled_for;
        }
        record.updated_at = now;
    }
}

/// Singleton pipeline settings, loaded once per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub enabled: bool,
    pub default_tone: String,
    pub default_model: String,
    pub schedule_hour: u32,
    pub schedule_timezone: String,
    pub updated_at: DateTime<Utc>,
}

impl Settings {
    pub fn defaults(now: DateTime<Utc>) -> Self {
        Self {
            enabled: true,
            default_tone: "professional".to_string(),
            default_model: "gpt-4o-mini".to_string(),
            schedule_hour: 9,
            schedule_timezone: "UTC".to_string(),
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsPatch {
    pub enabled: Option<bool>,
    pub default_tone: Option<String>,
    pub default_model: Option<String>,
    pub schedule_hour: Option<u32>,
    pub schedule_timezone: Option<String>,
}

impl SettingsPatch {
    /// Validates every field before touching `settings`.
    pub fn apply(self, settings: &mut Settings, now: DateTime<Utc>) -> Result<(), BlogError> {
        if let Some(hour) = self.schedule_hour {
            if hour > 23 {
                return Err(BlogError::Invalid(format!("schedule_hour {hour} is not 0-23")));
            }
        }
        if let Some(tz) = &self.schedule_timezone {
            if parse_timezone(tz).is_none() {
                return Err(BlogError::Invalid(format!(
                    "schedule_timezone `{tz}` is not UTC or a fixed offset like +10:00"
                )));
            }
        }

        if let Some(hour) = self.schedule_hour {
            settings.schedule_hour = hour;
        }
        if let Some(enabled) = self.enabled {
            settings.enabled = enabled;
        }
        if let Some(tone) = self.default_tone {
            settings.default_tone = tone;
        }
        if let Some(model) = self.default_model {
            settings.default_model = model;
        }
        if let Some(tz) = self.schedule_timezone {
            settings.schedule_timezone = tz;
        }
        settings.updated_at = now;
        Ok(())
    }
}

/// Accepts `UTC`, `GMT`, `Z`, or a fixed offset like `+10:00`, `-0530`, `UTC+8`.
pub fn parse_timezone(raw: &str) -> Option<FixedOffset> {
    let trimmed = raw.trim();
    let upper = trimmed.to_ascii_uppercase();
    let rest = ["UTC", "GMT"]
        .iter()
        .find_map(|prefix| upper.strip_prefix(*prefix))
        .unwrap_or(upper.as_str());
    if rest.is_empty() || rest == "Z" {
        return FixedOffset::east_opt(0);
    }

    let (sign, digits) = match rest.as_bytes().first()? {
        b'+' => (1, &rest[1..]),
        b'-' => (-1, &rest[1..]),
        _ => return None,
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit() || b == b':') {
        return None;
    }
    let (hours, minutes) = match digits.split_once(':') {
        Some((h, m)) => (h, m),
        None if digits.len() > 2 => digits.split_at(digits.len() - 2),
        None => (digits, "0"),
    };
    let hours: i32 = hours.parse().ok()?;
    let minutes: i32 = minutes.parse().ok()?;
    if hours > 14 || minutes > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlogFilter {
    pub status: Option<BlogStatus>,
    pub kind: Option<SourceKind>,
}

impl BlogFilter {
    pub fn matches(&self, record: &BlogRecord) -> bool {
        self.status.map_or(true, |s| s == record.status)
            && self.kind.map_or(true, |k| k == record.kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: u32,
    pub limit: u32,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

impl PageRequest {
    pub fn new(page: Option<u32>, limit: Option<u32>) -> Self {
        Self {
            page: page.unwrap_or(1).max(1),
            limit: limit.unwrap_or(DEFAULT_PAGE_LIMIT).max(1),
        }
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.limit)
    }
}

pub fn total_pages(total: u64, limit: u32) -> u64 {
    total.div_ceil(u64::from(limit.max(1)))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Paginated<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub limit: u32,
    pub total_pages: u64,
}

impl<T> Paginated<T> {
    pub fn new(items: Vec<T>, total: u64, request: PageRequest) -> Self {
        Self {
            items,
            total,
            page: request.page,
            limit: request.limit,
            total_pages: total_pages(total, request.limit),
        }
    }
}

/// Lowercase, collapse non-alphanumeric runs into `-`, trim, cap at [`SLUG_MAX_LEN`].
pub fn generate_slug(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut pending_dash = false;
    for c in title.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c);
        } else {
            pending_dash = true;
        }
    }
    slug.truncate(SLUG_MAX_LEN);
    slug.trim_end_matches('-').to_string()
}

/// `/calculators/australia/income-tax` -> `Income Tax`.
pub fn title_from_path(path: &str) -> String {
    let last = path
        .trim_end_matches('/')
        .rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or("home");
    last.split(['-', '_'])
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionRule {
    pub pattern: &'static str,
    pub region: &'static str,
}

/// Evaluated top to bottom; the first pattern contained in the path wins.
pub const REGION_RULES: &[RegionRule] = &[
    RegionRule { pattern: "/australia/", region: "australia" },
    RegionRule { pattern: "/au/", region: "australia" },
    RegionRule { pattern: "/new-zealand/", region: "new-zealand" },
    RegionRule { pattern: "/nz/", region: "new-zealand" },
    RegionRule { pattern: "/united-kingdom/", region: "united-kingdom" },
    RegionRule { pattern: "/uk/", region: "united-kingdom" },
    RegionRule { pattern: "/canada/", region: "canada" },
    RegionRule { pattern: "/india/", region: "india" },
    RegionRule { pattern: "/usa/", region: "united-states" },
    RegionRule { pattern: "/us/", region: "united-states" },
];

pub fn infer_region(path: &str) -> &'static str {
    infer_region_with(REGION_RULES, path)
}

pub fn infer_region_with(rules: &[RegionRule], path: &str) -> &'static str {
    let mut normalized = path.to_ascii_lowercase();
    if !normalized.ends_with('/') {
        normalized.push('/');
    }
    rules
        .iter()
        .find(|rule| normalized.contains(rule.pattern))
        .map(|rule| rule.region)
        .unwrap_or(DEFAULT_REGION)
}

pub fn render_markdown(markdown: &str) -> String {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_STRIKETHROUGH);
    let parser = Parser::new_ext(markdown, options);
    let mut out = String::with_capacity(markdown.len() + markdown.len() / 2);
    html::push_html(&mut out, parser);
    out
}

#[derive(Debug, Clone)]
pub struct JsonLdInput<'a> {
    pub base_url: &'a str,
    pub site_name: &'a str,
    pub slug: &'a str,
    pub headline: &'a str,
    pub description: &'a str,
    pub keywords: &'a [String],
    pub published_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

pub fn blog_url(base_url: &str, slug: &str) -> String {
    format!("{}/blog/{}", base_url.trim_end_matches('/'), slug)
}

/// Fixed-shape BlogPosting structured data embedded in each published page.
pub fn build_json_ld(input: &JsonLdInput<'_>) -> JsonValue {
    let url = blog_url(input.base_url, input.slug);
    serde_json::json!({
        "@context": "https://schema.org",
        "@type": "BlogPosting",
        "headline": input.headline,
        "description": input.description,
        "url": url,
        "mainEntityOfPage": {
            "@type": "WebPage",
            "@id": url,
        },
        "datePublished": input.published_at.to_rfc3339(),
        "dateModified": input.modified_at.to_rfc3339(),
        "keywords": input.keywords.join(", "),
        "author": {
            "@type": "Organization",
            "name": input.site_name,
        },
        "publisher": {
            "@type": "Organization",
            "name": input.site_name,
            "url": input.base_url.trim_end_matches('/'),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().unwrap()
    }

    #[test]
    fn slug_collapses_punctuation() {
        assert_eq!(generate_slug("My Cool Title!!"), "my-cool-title");
        assert_eq!(generate_slug("  --Tax (2025/26) & You--  "), "tax-2025-26-you");
        assert_eq!(generate_slug("!!!"), "");
    }

    #[test]
    fn slug_truncates_to_limit() {
        let title = "word ".repeat(40);
        assert_eq!(title.len(), 200);
        let slug = generate_slug(&title);
        assert!(slug.len() <= SLUG_MAX_LEN);
        assert!(!slug.ends_with('-'));
        assert!(slug.starts_with("word-word"));
    }

    #[test]
    fn region_table_is_ordered() {
        assert_eq!(infer_region("/calculators/australia/income-tax"), "australia");
        assert_eq!(infer_region("/tools/uk"), "united-kingdom");
        assert_eq!(infer_region("/tools/mortgage"), DEFAULT_REGION);
        // "/usa/" is listed before "/us/", both resolve the same way.
        assert_eq!(infer_region("/calculators/USA/salary"), "united-states");

        let custom = [
            RegionRule { pattern: "/tax/", region: "tax-first" },
            RegionRule { pattern: "/australia/", region: "australia" },
        ];
        assert_eq!(infer_region_with(&custom, "/australia/tax/"), "tax-first");
    }

    #[test]
    fn title_from_path_capitalizes_last_segment() {
        assert_eq!(title_from_path("/calculators/australia/income-tax/"), "Income Tax");
        assert_eq!(title_from_path("/"), "Home");
    }

    #[test]
    fn pagination_math() {
        let req = PageRequest::new(Some(2), Some(20));
        assert_eq!(req.offset(), 20);
        assert_eq!(total_pages(45, 20), 3);
        assert_eq!(total_pages(0, 20), 0);
        assert_eq!(PageRequest::new(Some(0), Some(0)), PageRequest { page: 1, limit: 1 });
    }

    #[test]
    fn json_ld_has_fixed_shape() {
        let keywords = vec!["tax".to_string(), "australia".to_string()];
        let value = build_json_ld(&JsonLdInput {
            base_url: "https://example.com/",
            site_name: "Calculator Hub",
            slug: "income-tax-guide",
            headline: "Income Tax Guide",
            description: "How it works",
            keywords: &keywords,
            published_at: ts(),
            modified_at: ts(),
        });
        assert_eq!(value["@type"], "BlogPosting");
        assert_eq!(value["url"], "https://example.com/blog/income-tax-guide");
        assert_eq!(value["keywords"], "tax, australia");
        assert_eq!(value["datePublished"], "2026-03-01T09:00:00+00:00");
    }

    #[test]
    fn markdown_renders_tables() {
        let html = render_markdown("# Hi\n\n| a | b |\n|---|---|\n| 1 | 2 |\n");
        assert!(html.contains("<h1>Hi</h1>"));
        assert!(html.contains("<table>"));
    }

    #[test]
    fn patch_keeps_omitted_fields_and_rerenders() {
        let mut record = BlogRecord {
            id: Uuid::new_v4(),
            source_url: "/tools/bmi".into(),
            slug: "bmi".into(),
            title: "BMI".into(),
            meta_title: "BMI meta".into(),
            meta_desc: "desc".into(),
            content_md: "old".into(),
            html: "<p>old</p>\n".into(),
            json_ld: None,
            keywords: vec!["bmi".into()],
            tone: Some("friendly".into()),
            audience: None,
            kind: SourceKind::Tool,
            region: None,
            model: None,
            status: BlogStatus::Draft,
            last_error: None,
            scheduled_for: None,
            published_at: None,
            created_at: ts(),
            updated_at: ts(),
        };
        BlogPatch {
            content_md: Some("**new**".into()),
            ..Default::default()
        }
        .apply(&mut record, ts());
        assert_eq!(record.title, "BMI");
        assert_eq!(record.tone.as_deref(), Some("friendly"));
        assert_eq!(record.html, "<p><strong>new</strong></p>\n");
    }

    #[test]
    fn status_and_kind_parse() {
        assert_eq!("failed".parse::<BlogStatus>().unwrap(), BlogStatus::Failed);
        assert_eq!("ai_hub".parse::<SourceKind>().unwrap(), SourceKind::AiHub);
        assert!("nope".parse::<BlogStatus>().is_err());
        assert_eq!(
            serde_json::to_value(BlogStatus::Published).unwrap(),
            serde_json::json!("PUBLISHED")
        );
    }

    #[test]
    fn settings_patch_rejects_bad_hour() {
        let mut settings = Settings::defaults(ts());
        let err = SettingsPatch {
            schedule_hour: Some(24),
            ..Default::default()
        }
        .apply(&mut settings, ts())
        .unwrap_err();
        assert!(matches!(err, BlogError::Invalid(_)));
        assert_eq!(settings.schedule_hour, 9);
    }

    #[test]
    fn settings_patch_rejects_unparseable_timezone_without_partial_update() {
        let mut settings = Settings::defaults(ts());
        for tz in ["UTC+€", "+€", "Mars/Olympus", "+"] {
            let err = SettingsPatch {
                schedule_hour: Some(6),
                schedule_timezone: Some(tz.to_string()),
                ..Default::default()
            }
            .apply(&mut settings, ts())
            .unwrap_err();
            assert!(matches!(err, BlogError::Invalid(_)), "{tz}");
        }
        assert_eq!(settings.schedule_hour, 9);
        assert_eq!(settings.schedule_timezone, "UTC");

        SettingsPatch {
            schedule_timezone: Some("+10:00".into()),
            ..Default::default()
        }
        .apply(&mut settings, ts())
        .expect("fixed offset accepted");
        assert_eq!(settings.schedule_timezone, "+10:00");
    }

    #[test]
    fn timezone_parsing() {
        assert_eq!(parse_timezone("utc"), FixedOffset::east_opt(0));
        assert_eq!(parse_timezone("Z"), FixedOffset::east_opt(0));
        assert_eq!(parse_timezone("+05:30"), FixedOffset::east_opt(19_800));
        assert_eq!(parse_timezone("-0530"), FixedOffset::west_opt(19_800));
        assert_eq!(parse_timezone("GMT-8"), FixedOffset::west_opt(8 * 3600));
        assert_eq!(parse_timezone("Australia/Sydney"), None);
        assert_eq!(parse_timezone("+25:00"), None);
    }

    #[test]
    fn non_ascii_offsets_are_rejected_not_split() {
        assert_eq!(parse_timezone("+€"), None);
        assert_eq!(parse_timezone("UTC+€"), None);
        assert_eq!(parse_timezone("-1€"), None);
        assert_eq!(parse_timezone("+0é30"), None);
    }
}
