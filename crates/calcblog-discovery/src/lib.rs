//! Source discovery: merge the static route registry with sitemap `<loc>` entries
//! and upsert the result into the catalog.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use calcblog_core::{infer_region, title_from_path, NewCatalogEntry, SourceKind};
use calcblog_storage::ContentStore;
use regex::Regex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "calcblog-discovery";

pub const DEFAULT_EXCLUDED_PREFIXES: &[&str] = &["/blog", "/api", "/admin"];

/// One route from the registry file. The registry is authoritative over the sitemap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub kind: SourceKind,
    #[serde(default)]
    pub region: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceOrigin {
    Registry,
    Sitemap,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredSource {
    pub path: String,
    pub title: Option<String>,
    pub kind: SourceKind,
    pub region: String,
    pub origin: SourceOrigin,
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub registry_path: Option<PathBuf>,
    pub sitemap_path: Option<PathBuf>,
    pub excluded_prefixes: Vec<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            registry_path: None,
            sitemap_path: None,
            excluded_prefixes: DEFAULT_EXCLUDED_PREFIXES
                .iter()
                .map(ToString::to_string)
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiscoverySummary {
    pub discovered: usize,
    pub inserted: usize,
    pub updated: usize,
    pub failed: usize,
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

pub fn load_registry(path: impl AsRef<Path>) -> Result<Vec<RegistryEntry>> {
    read_json_file(path)
}

pub fn load_sitemap(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let path = path.as_ref();
    let xml = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(extract_sitemap_paths(&xml))
}

fn loc_pattern() -> &'static Regex {
    static LOC: OnceLock<Regex> = OnceLock::new();
    LOC.get_or_init(|| Regex::new(r"(?is)<loc>\s*(.*?)\s*</loc>").expect("static <loc> pattern compiles"))
}

/// Pull `<loc>` values out of a sitemap by pattern, reduced to unique paths in
/// document order. No XML parser is involved.
pub fn extract_sitemap_paths(xml: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    loc_pattern()
        .captures_iter(xml)
        .filter_map(|caps| caps.get(1))
        .filter_map(|m| normalize_path(&m.as_str().replace("&amp;", "&")))
        .filter(|path| seen.insert(path.clone()))
        .collect()
}

/// `https://site.test/tools/bmi/?x=1` -> `/tools/bmi`.
pub fn normalize_path(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let without_scheme = match raw.find("://") {
        Some(idx) => {
            let rest = &raw[idx + 3..];
            match rest.find('/') {
                Some(slash) => &rest[slash..],
                None => "/",
            }
        }
        None => raw,
    };
    let path = without_scheme
        .split(['?', '#'])
        .next()
        .unwrap_or_default()
        .trim_end_matches('/');
    if path.is_empty() {
        return Some("/".to_string());
    }
    if path.starts_with('/') {
        Some(path.to_string())
    } else {
        Some(format!("/{path}"))
    }
}

pub fn kind_for_path(path: &str) -> SourceKind {
    let first = path
        .trim_start_matches('/')
        .split('/')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    match first.as_str() {
        "calculators" | "calculator" => SourceKind::Calculator,
        "tools" | "tool" => SourceKind::Tool,
        "ai" | "ai-tools" | "ai-hub" => SourceKind::AiHub,
        _ => SourceKind::Other,
    }
}

fn is_excluded(path: &str, excluded_prefixes: &[String]) -> bool {
    path == "/"
        || excluded_prefixes.iter().any(|prefix| {
            path == prefix || path.starts_with(&format!("{}/", prefix.trim_end_matches('/')))
        })
}

/// Registry entries win; sitemap paths only fill gaps.
pub fn merge_sources(
    registry: &[RegistryEntry],
    sitemap_paths: &[String],
    excluded_prefixes: &[String],
) -> BTreeMap<String, DiscoveredSource> {
    let mut out = BTreeMap::new();

    for entry in registry {
        let Some(path) = normalize_path(&entry.url) else {
            continue;
        };
        let region = entry
            .region
            .clone()
            .unwrap_or_else(|| infer_region(&path).to_string());
        out.insert(
            path.clone(),
            DiscoveredSource {
                path,
                title: entry.title.clone(),
                kind: entry.kind,
                region,
                origin: SourceOrigin::Registry,
            },
        );
    }

    for path in sitemap_paths {
        if is_excluded(path, excluded_prefixes) || out.contains_key(path) {
            continue;
        }
        out.insert(
            path.clone(),
            DiscoveredSource {
                path: path.clone(),
                title: Some(title_from_path(path)),
                kind: kind_for_path(path),
                region: infer_region(path).to_string(),
                origin: SourceOrigin::Sitemap,
            },
        );
    }

    out
}

/// Best effort: a missing or broken registry/sitemap is logged and treated as empty.
pub fn discover_sources(config: &DiscoveryConfig) -> BTreeMap<String, DiscoveredSource> {
    let registry = match &config.registry_path {
        Some(path) => load_registry(path).unwrap_or_else(|err| {
            warn!(error = %format!("{err:#}"), "registry unavailable; continuing without it");
            Vec::new()
        }),
        None => Vec::new(),
    };
    let sitemap = match &config.sitemap_path {
        Some(path) => load_sitemap(path).unwrap_or_else(|err| {
            warn!(error = %format!("{err:#}"), "sitemap unavailable; continuing without it");
            Vec::new()
        }),
        None => Vec::new(),
    };
    debug!(
        registry = registry.len(),
        sitemap = sitemap.len(),
        "loaded discovery inputs"
    );
    merge_sources(&registry, &sitemap, &config.excluded_prefixes)
}

/// Insert unknown sources, refresh titles that changed, leave the rest alone.
/// A failing entry is logged and counted; the batch carries on.
pub async fn sync_catalog(
    store: &dyn ContentStore,
    discovered: &BTreeMap<String, DiscoveredSource>,
) -> DiscoverySummary {
    let mut summary = DiscoverySummary {
        discovered: discovered.len(),
        ..Default::default()
    };

    for source in discovered.values() {
        match upsert_source(store, source).await {
            Ok(UpsertOutcome::Inserted) => summary.inserted += 1,
            Ok(UpsertOutcome::Updated) => summary.updated += 1,
            Ok(UpsertOutcome::Unchanged) => {}
            Err(err) => {
                summary.failed += 1;
                warn!(source_url = %source.path, error = %err, "catalog upsert failed");
            }
        }
    }

    info!(
        discovered = summary.discovered,
        inserted = summary.inserted,
        updated = summary.updated,
        failed = summary.failed,
        "catalog sync finished"
    );
    summary
}

enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

async fn upsert_source(
    store: &dyn ContentStore,
    source: &DiscoveredSource,
) -> Result<UpsertOutcome, calcblog_storage::StoreError> {
    match store.find_catalog_entry(&source.path).await? {
        None => {
            store
                .insert_catalog_entry(&NewCatalogEntry {
                    source_url: source.path.clone(),
                    title: source.title.clone(),
                    kind: source.kind,
                    region: Some(source.region.clone()),
                    eligible: source.kind.eligible_by_default(),
                })
                .await?;
            Ok(UpsertOutcome::Inserted)
        }
        Some(existing) if existing.title != source.title => {
            store
                .update_catalog_title(&source.path, source.title.as_deref(), source.kind)
                .await?;
            Ok(UpsertOutcome::Updated)
        }
        Some(_) => Ok(UpsertOutcome::Unchanged),
    }
}
