//! Snapshot sources, detail-page extraction and listing normalization.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rehome_core::{title_case, AgeGroup, Compatibility, ImageDescriptor, NormalizedListing, RawListing};
use rehome_storage::{write_atomic, HttpFetcher, Throttle};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "rehome-adapters";

pub const DEFAULT_PLACEHOLDER_IMAGE_IDS: [&str; 3] =
    ["imageId=295471", "imageId=A204567", "imageId=296517"];

const NAME_SELECTOR: &str = ".animalHeading h1";
const LOCATION_SELECTOR: &str = ".establishmentLocation > p:nth-child(2)";
const BREED_SELECTOR: &str = ".aboutMe.desktop table tr:nth-child(1) > td";
const AGE_SELECTOR: &str = ".aboutMe.desktop table tr:nth-child(3) > td";
const DESCRIPTION_SELECTOR: &str = ".petDescription p";
const GALLERY_SELECTOR: &str = ".carouselImgHolder img";
const SINGLE_IMAGE_SELECTOR: &str = "#largeImage";
const VIDEO_SELECTOR: &str = "#largeVid";
const LIFESTYLE_ICON_DIR: &str = "/webContent/staticImages/findapet/lifestyle";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("template drift on {source_url}: required element `{field}` not found")]
    TemplateDrift { source_url: String, field: &'static str },
    #[error("invalid selector `{selector}`: {message}")]
    Selector { selector: String, message: String },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// A whole run's worth of raw listings, as persisted in the cache file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub organisation_name: String,
    pub base_url: String,
    pub captured_at: DateTime<Utc>,
    pub listings: Vec<RawListing>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotOrigin {
    Live,
    Cached,
}

#[async_trait]
pub trait ListingSource: Send + Sync {
    fn origin(&self) -> SnapshotOrigin;

    async fn snapshot(&self) -> Result<Snapshot, AdapterError>;
}

pub fn snapshot_cache_path(workspace_root: &Path, organisation_name: &str) -> PathBuf {
    workspace_root
        .join("data")
        .join(format!("{organisation_name}.json"))
}

pub async fn load_snapshot(path: impl AsRef<Path>) -> anyhow::Result<Snapshot> {
    let path = path.as_ref();
    let data = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

pub async fn save_snapshot(path: impl AsRef<Path>, snapshot: &Snapshot) -> anyhow::Result<()> {
    let path = path.as_ref();
    let bytes = serde_json::to_vec_pretty(snapshot).context("serializing snapshot")?;
    write_atomic(path, &bytes).await
}

/// Detail-page URLs, one per line. Blank lines and `#` comments are skipped.
pub async fn load_page_index(path: impl AsRef<Path>) -> anyhow::Result<Vec<String>> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading page index {}", path.display()))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

#[derive(Debug, Clone)]
pub struct CachedSnapshot {
    path: PathBuf,
}

impl CachedSnapshot {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ListingSource for CachedSnapshot {
    fn origin(&self) -> SnapshotOrigin {
        SnapshotOrigin::Cached
    }

    async fn snapshot(&self) -> Result<Snapshot, AdapterError> {
        Ok(load_snapshot(&self.path).await?)
    }
}

/// Fetches every indexed detail page, extracts it and refreshes the cache file.
pub struct LiveSnapshot {
    fetcher: Arc<HttpFetcher>,
    throttle: Arc<Throttle>,
    pages: Vec<String>,
    cache_path: PathBuf,
    organisation_name: String,
    base_url: String,
}

impl LiveSnapshot {
    pub fn new(
        fetcher: Arc<HttpFetcher>,
        throttle: Arc<Throttle>,
        pages: Vec<String>,
        cache_path: impl Into<PathBuf>,
        organisation_name: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            fetcher,
            throttle,
            pages,
            cache_path: cache_path.into(),
            organisation_name: organisation_name.into(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl ListingSource for LiveSnapshot {
    fn origin(&self) -> SnapshotOrigin {
        SnapshotOrigin::Live
    }

    async fn snapshot(&self) -> Result<Snapshot, AdapterError> {
        let mut listings = Vec::with_capacity(self.pages.len());
        for url in &self.pages {
            self.throttle.pace().await;
            let html = self
                .fetcher
                .fetch_text(url)
                .await
                .with_context(|| format!("fetching detail page {url}"))?;
            listings.push(extract_detail_page(url, &html)?);
        }

        let snapshot = Snapshot {
            organisation_name: self.organisation_name.clone(),
            base_url: self.base_url.clone(),
            captured_at: Utc::now(),
            listings,
        };
        save_snapshot(&self.cache_path, &snapshot).await?;
        info!(
            pages = snapshot.listings.len(),
            cache = %self.cache_path.display(),
            "live snapshot captured"
        );
        Ok(snapshot)
    }
}

fn selector(raw: &str) -> Result<Selector, AdapterError> {
    Selector::parse(raw).map_err(|e| AdapterError::Selector {
        selector: raw.to_string(),
        message: e.to_string(),
    })
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn element_text(element: ElementRef<'_>) -> Option<String> {
    text_or_none(element.text().collect::<String>())
}

fn select_first_text(document: &Html, raw: &str) -> Result<Option<String>, AdapterError> {
    let sel = selector(raw)?;
    Ok(document.select(&sel).next().and_then(element_text))
}

fn select_all_texts(document: &Html, raw: &str) -> Result<Vec<String>, AdapterError> {
    let sel = selector(raw)?;
    Ok(document.select(&sel).filter_map(element_text).collect())
}

fn select_first_attr(document: &Html, raw: &str, attr: &str) -> Result<Option<String>, AdapterError> {
    let sel = selector(raw)?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string())))
}

fn select_all_attrs(document: &Html, raw: &str, attr: &str) -> Result<Vec<String>, AdapterError> {
    let sel = selector(raw)?;
    Ok(document
        .select(&sel)
        .filter_map(|n| n.value().attr(attr))
        .filter_map(|s| text_or_none(s.to_string()))
        .collect())
}

/// Element must exist; its text may still be empty.
fn require_text(
    document: &Html,
    raw: &str,
    source_url: &str,
    field: &'static str,
) -> Result<Option<String>, AdapterError> {
    let sel = selector(raw)?;
    let element = document
        .select(&sel)
        .next()
        .ok_or_else(|| AdapterError::TemplateDrift {
            source_url: source_url.to_string(),
            field,
        })?;
    Ok(element_text(element))
}

fn lifestyle_text(document: &Html, icon: &str) -> Result<Option<String>, AdapterError> {
    select_first_text(
        document,
        &format!("#lifeStyle img[src=\"{LIFESTYLE_ICON_DIR}/{icon}.png\"] + span"),
    )
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Pull the raw fields of one detail page. Sex and size are not part of the
/// page template and are never extracted.
pub fn extract_detail_page(source_url: &str, html: &str) -> Result<RawListing, AdapterError> {
    let document = Html::parse_document(html);

    let name = require_text(&document, NAME_SELECTOR, source_url, "name")?;
    let location = require_text(&document, LOCATION_SELECTOR, source_url, "location")?;
    let breed = select_first_text(&document, BREED_SELECTOR)?.map(|b| collapse_whitespace(&b));
    let age = select_first_text(&document, AGE_SELECTOR)?;

    Ok(RawListing {
        source: source_url.to_string(),
        name,
        breed,
        age,
        location,
        description_paragraphs: select_all_texts(&document, DESCRIPTION_SELECTOR)?,
        family_text: lifestyle_text(&document, "family")?,
        dog_text: lifestyle_text(&document, "dog")?,
        cat_text: lifestyle_text(&document, "cat")?,
        gallery_images: select_all_attrs(&document, GALLERY_SELECTOR, "src")?,
        single_image: select_first_attr(&document, SINGLE_IMAGE_SELECTOR, "src")?,
        video_src: select_first_attr(&document, VIDEO_SELECTOR, "src")?,
    })
}

/// Organisation-specific knobs for [`normalize_listing`].
#[derive(Debug, Clone)]
pub struct NormalizeRules {
    pub base_url: String,
    pub placeholder_image_ids: Vec<String>,
}

impl NormalizeRules {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            placeholder_image_ids: DEFAULT_PLACEHOLDER_IMAGE_IDS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    pub fn with_placeholders(mut self, placeholder_image_ids: Vec<String>) -> Self {
        self.placeholder_image_ids = placeholder_image_ids;
        self
    }

    fn is_placeholder(&self, url: &str) -> bool {
        self.placeholder_image_ids
            .iter()
            .any(|needle| url.contains(needle.as_str()))
    }

    fn absolute(&self, src: &str) -> String {
        if src.starts_with("http://") || src.starts_with("https://") {
            src.to_string()
        } else if let Some(rest) = src.strip_prefix("//") {
            format!("https://{rest}")
        } else if src.starts_with('/') {
            format!("{}{src}", self.base_url)
        } else {
            format!("{}/{src}", self.base_url)
        }
    }
}

pub fn age_group_for(age: &str) -> AgeGroup {
    match age {
        "3-6 Months" => AgeGroup::Puppy,
        "6-12 Months" | "1 Year (approx)" | "2 Years (approx)" => AgeGroup::Juvenile,
        _ => AgeGroup::Adult,
    }
}

fn compatibility_for(text: Option<&str>, refusal: &str) -> Compatibility {
    match text {
        None => Compatibility::Unknown,
        Some(t) if t.trim() == refusal => Compatibility::No,
        Some(_) => Compatibility::Yes,
    }
}

pub fn youtube_id(src: &str) -> Option<String> {
    let without_scheme = src
        .trim_start_matches("https:")
        .trim_start_matches("http:");
    let id = without_scheme
        .trim_start_matches("//www.youtube.com/embed/")
        .split('?')
        .next()
        .unwrap_or_default()
        .trim();
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn render_description(paragraphs: &[String]) -> Option<String> {
    let rendered = paragraphs
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .map(|p| format!("<p>{}</p>", escape_html(p)))
        .collect::<String>();
    if rendered.is_empty() {
        None
    } else {
        Some(rendered)
    }
}

/// Gallery images win over the single fallback image; the first survivor is main.
fn collect_images(raw: &RawListing, rules: &NormalizeRules) -> Vec<ImageDescriptor> {
    let mut urls: Vec<String> = raw
        .gallery_images
        .iter()
        .filter(|src| !rules.is_placeholder(src))
        .map(|src| rules.absolute(&src.replace("size=small", "size=large")))
        .collect();

    if urls.is_empty() {
        if let Some(single) = raw.single_image.as_deref() {
            if !rules.is_placeholder(single) {
                urls.push(rules.absolute(single));
            }
        }
    }

    let mut seen = std::collections::HashSet::new();
    urls.retain(|url| seen.insert(url.clone()));

    urls.into_iter()
        .enumerate()
        .map(|(index, url)| ImageDescriptor {
            url,
            is_main: index == 0,
        })
        .collect()
}

/// Map raw extracted fields onto the canonical listing shape. Pure.
pub fn normalize_listing(raw: &RawListing, rules: &NormalizeRules) -> NormalizedListing {
    let name = raw
        .name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(title_case);

    let images = collect_images(raw, rules);
    if raw.gallery_images.len() + usize::from(raw.single_image.is_some()) > 0 && images.is_empty() {
        warn!(source = raw.source.as_str(), "all listing images are placeholders");
    }

    NormalizedListing {
        source: raw.source.clone(),
        name,
        sex: None,
        size: None,
        age_group: raw.age.as_deref().map(str::trim).map(age_group_for),
        breed_name: raw
            .breed
            .as_deref()
            .map(collapse_whitespace)
            .filter(|b| !b.is_empty()),
        location_name: raw
            .location
            .as_deref()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string),
        description: render_description(&raw.description_paragraphs),
        children: compatibility_for(raw.family_text.as_deref(), "I'd prefer an adult only household"),
        dogs: compatibility_for(raw.dog_text.as_deref(), "I'd prefer to be the only dog in a home"),
        cats: compatibility_for(raw.cat_text.as_deref(), "I'd prefer not to live with a cat"),
        youtube: raw.video_src.as_deref().and_then(youtube_id),
        images,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "https://www.rspca.org.uk";

    fn raw(source: &str) -> RawListing {
        RawListing {
            source: source.to_string(),
            name: Some("  rEX ".into()),
            ..RawListing::default()
        }
    }

    #[test]
    fn age_text_buckets_into_groups() {
        assert_eq!(age_group_for("3-6 Months"), AgeGroup::Puppy);
        assert_eq!(age_group_for("6-12 Months"), AgeGroup::Juvenile);
        assert_eq!(age_group_for("1 Year (approx)"), AgeGroup::Juvenile);
        assert_eq!(age_group_for("2 Years (approx)"), AgeGroup::Juvenile);
        assert_eq!(age_group_for("7 Years (approx)"), AgeGroup::Adult);
        assert_eq!(age_group_for("0-3 Months"), AgeGroup::Adult);
    }

    #[test]
    fn compatibility_is_tri_state() {
        let mut listing = raw("/dog/1");
        listing.family_text = Some("I'd prefer an adult only household".into());
        listing.dog_text = Some("I can live with other dogs".into());
        let normalized = normalize_listing(&listing, &NormalizeRules::new(BASE));
        assert_eq!(normalized.children, Compatibility::No);
        assert_eq!(normalized.dogs, Compatibility::Yes);
        assert_eq!(normalized.cats, Compatibility::Unknown);
    }

    #[test]
    fn name_is_trimmed_and_title_cased() {
        let normalized = normalize_listing(&raw("/dog/1"), &NormalizeRules::new(BASE));
        assert_eq!(normalized.name.as_deref(), Some("Rex"));
        assert_eq!(normalized.sex, None);
        assert_eq!(normalized.size, None);
    }

    #[test]
    fn blank_name_normalizes_to_none() {
        let mut listing = raw("/dog/1");
        listing.name = Some("   ".into());
        assert_eq!(normalize_listing(&listing, &NormalizeRules::new(BASE)).name, None);
    }

    #[test]
    fn placeholder_gallery_images_are_dropped_and_first_survivor_is_main() {
        let mut listing = raw("/dog/1");
        listing.gallery_images = vec![
            "/ImageLocator/locate.do?imageId=A1&size=small".into(),
            "/ImageLocator/locate.do?imageId=295471&size=small".into(),
            "https://www.rspca.org.uk/ImageLocator/locate.do?imageId=A3&size=small".into(),
        ];
        let normalized = normalize_listing(&listing, &NormalizeRules::new(BASE));
        assert_eq!(
            normalized.images,
            vec![
                ImageDescriptor {
                    url: "https://www.rspca.org.uk/ImageLocator/locate.do?imageId=A1&size=large".into(),
                    is_main: true,
                },
                ImageDescriptor {
                    url: "https://www.rspca.org.uk/ImageLocator/locate.do?imageId=A3&size=large".into(),
                    is_main: false,
                },
            ]
        );
    }

    #[test]
    fn single_image_is_used_full_size_when_gallery_is_empty() {
        let mut listing = raw("/dog/1");
        listing.gallery_images = vec!["/i?imageId=A204567&size=small".into()];
        listing.single_image = Some("/i?imageId=B7&size=small".into());
        let normalized = normalize_listing(&listing, &NormalizeRules::new(BASE));
        assert_eq!(normalized.images.len(), 1);
        assert_eq!(normalized.images[0].url, "https://www.rspca.org.uk/i?imageId=B7&size=small");
        assert!(normalized.images[0].is_main);
    }

    #[test]
    fn placeholder_single_image_yields_no_images() {
        let mut listing = raw("/dog/1");
        listing.single_image = Some("/i?imageId=296517".into());
        assert!(normalize_listing(&listing, &NormalizeRules::new(BASE)).images.is_empty());
    }

    #[test]
    fn custom_placeholder_list_replaces_defaults() {
        let mut listing = raw("/dog/1");
        listing.gallery_images = vec!["/i?imageId=295471".into(), "/i?imageId=X1".into()];
        let rules = NormalizeRules::new(BASE).with_placeholders(vec!["imageId=X1".into()]);
        let normalized = normalize_listing(&listing, &rules);
        assert_eq!(normalized.images.len(), 1);
        assert!(normalized.images[0].url.contains("imageId=295471"));
    }

    #[test]
    fn youtube_embed_is_reduced_to_video_id() {
        assert_eq!(
            youtube_id("//www.youtube.com/embed/dQw4w9WgXcQ?rel=0").as_deref(),
            Some("dQw4w9WgXcQ")
        );
        assert_eq!(
            youtube_id("https://www.youtube.com/embed/abc123").as_deref(),
            Some("abc123")
        );
        assert_eq!(youtube_id("//www.youtube.com/embed/?rel=0"), None);
    }

    #[test]
    fn description_paragraphs_render_as_escaped_html() {
        let mut listing = raw("/dog/1");
        listing.description_paragraphs = vec!["Loves walks & <treats>".into(), " ".into(), "Calm".into()];
        let normalized = normalize_listing(&listing, &NormalizeRules::new(BASE));
        assert_eq!(
            normalized.description.as_deref(),
            Some("<p>Loves walks &amp; &lt;treats&gt;</p><p>Calm</p>")
        );
        assert_eq!(normalize_listing(&raw("/dog/2"), &NormalizeRules::new(BASE)).description, None);
    }

    #[test]
    fn missing_heading_is_template_drift() {
        let html = "<html><body><div class=\"establishmentLocation\"><p>At</p><p>Leeds</p></div></body></html>";
        let err = extract_detail_page("https://x.test/dog/1", html).unwrap_err();
        assert!(matches!(err, AdapterError::TemplateDrift { field: "name", .. }));
    }

    #[test]
    fn missing_location_block_is_template_drift() {
        let html = "<html><body><div class=\"animalHeading\"><h1>Rex</h1></div></body></html>";
        let err = extract_detail_page("https://x.test/dog/1", html).unwrap_err();
        assert!(matches!(err, AdapterError::TemplateDrift { field: "location", .. }));
    }

    #[test]
    fn empty_heading_is_not_drift() {
        let html = "<html><body><div class=\"animalHeading\"><h1> </h1></div>\
                    <div class=\"establishmentLocation\"><p>At</p><p>Leeds</p></div></body></html>";
        let listing = extract_detail_page("https://x.test/dog/1", html).expect("extract");
        assert_eq!(listing.name, None);
        assert_eq!(listing.location.as_deref(), Some("Leeds"));
    }
}
