//! Image asset storage, derivative generation, pacing and HTTP fetch utilities.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "rehome-storage";

pub const RESIZED_WIDTHS: [u32; 4] = [200, 400, 600, 800];
pub const JPEG_QUALITY: u8 = 75;

/// On-disk locations of every rendition of one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivativePaths {
    pub base: PathBuf,
    pub optimized: PathBuf,
    pub resized: Vec<(u32, PathBuf)>,
}

impl DerivativePaths {
    /// Base file first, then the optimized and resized variants.
    pub fn all(&self) -> Vec<&Path> {
        let mut out = vec![self.base.as_path(), self.optimized.as_path()];
        out.extend(self.resized.iter().map(|(_, path)| path.as_path()));
        out
    }
}

#[derive(Debug, Clone)]
pub struct StoredImage {
    pub paths: DerivativePaths,
    pub byte_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Removed,
    Missing,
}

/// Per-organisation, per-dog image directory tree.
#[derive(Debug, Clone)]
pub struct AssetStore {
    root: PathBuf,
}

impl AssetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn dog_dir(&self, organisation_id: i64, dog_id: i64) -> PathBuf {
        self.root
            .join(format!("org{organisation_id}"))
            .join(format!("dog{dog_id}"))
    }

    pub fn derivative_paths(&self, organisation_id: i64, dog_id: i64, stem: &str) -> DerivativePaths {
        let dir = self.dog_dir(organisation_id, dog_id);
        DerivativePaths {
            base: dir.join(format!("{stem}.jpg")),
            optimized: dir.join(format!("{stem}-opt.jpg")),
            resized: RESIZED_WIDTHS
                .iter()
                .map(|width| (*width, dir.join(format!("{stem}-{width}.jpg"))))
                .collect(),
        }
    }

    pub async fn ensure_dog_dir(&self, organisation_id: i64, dog_id: i64) -> anyhow::Result<PathBuf> {
        let dir = self.dog_dir(organisation_id, dog_id);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating image directory {}", dir.display()))?;
        Ok(dir)
    }

    /// The base file is written last, so its presence implies a complete set.
    pub async fn base_exists(&self, organisation_id: i64, dog_id: i64, stem: &str) -> anyhow::Result<bool> {
        let base = self.derivative_paths(organisation_id, dog_id, stem).base;
        fs::try_exists(&base)
            .await
            .with_context(|| format!("checking image path {}", base.display()))
    }

    /// Decode `bytes`, write every derived rendition and finally the base file.
    pub async fn write_image_set(
        &self,
        organisation_id: i64,
        dog_id: i64,
        stem: &str,
        bytes: Vec<u8>,
    ) -> anyhow::Result<StoredImage> {
        self.ensure_dog_dir(organisation_id, dog_id).await?;
        let paths = self.derivative_paths(organisation_id, dog_id, stem);
        let byte_size = bytes.len();

        let (bytes, variants) = tokio::task::spawn_blocking(move || {
            let variants = derive_variants(&bytes)?;
            Ok::<_, anyhow::Error>((bytes, variants))
        })
        .await
        .context("joining image derivation task")?
        .with_context(|| format!("deriving renditions for {stem}"))?;

        write_atomic(&paths.optimized, &variants.optimized).await?;
        for ((_, path), (_, encoded)) in paths.resized.iter().zip(variants.resized.iter()) {
            write_atomic(path, encoded).await?;
        }
        write_atomic(&paths.base, &bytes).await?;

        Ok(StoredImage { paths, byte_size })
    }

    /// Remove all six renditions. Each path gets its own outcome; nothing here
    /// aborts on the first failure.
    pub async fn delete_derivatives(
        &self,
        organisation_id: i64,
        dog_id: i64,
        stem: &str,
    ) -> Vec<(PathBuf, std::io::Result<Removal>)> {
        let paths = self.derivative_paths(organisation_id, dog_id, stem);
        let mut outcomes = Vec::with_capacity(6);
        for path in paths.all() {
            let outcome = match fs::remove_file(path).await {
                Ok(()) => Ok(Removal::Removed),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Removal::Missing),
                Err(err) => Err(err),
            };
            outcomes.push((path.to_path_buf(), outcome));
        }
        outcomes
    }

    pub async fn remove_dog_dir(&self, organisation_id: i64, dog_id: i64) -> std::io::Result<Removal> {
        let dir = self.dog_dir(organisation_id, dog_id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(Removal::Removed),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Removal::Missing),
            Err(err) => Err(err),
        }
    }
}

/// Write via a uniquely named temp file in the same directory, then rename.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct DerivedVariants {
    pub optimized: Vec<u8>,
    pub resized: Vec<(u32, Vec<u8>)>,
}

/// Re-encode `bytes` as quality-75 JPEGs: one at full size and one per
/// entry of [`RESIZED_WIDTHS`], aspect ratio preserved.
pub fn derive_variants(bytes: &[u8]) -> anyhow::Result<DerivedVariants> {
    let img = image::load_from_memory(bytes).context("decoding downloaded image")?;
    let optimized = encode_jpeg(&img)?;
    let mut resized = Vec::with_capacity(RESIZED_WIDTHS.len());
    for width in RESIZED_WIDTHS {
        let height = scaled_height(img.width(), img.height(), width);
        let scaled = img.resize_exact(width, height, FilterType::Lanczos3);
        resized.push((width, encode_jpeg(&scaled)?));
    }
    Ok(DerivedVariants { optimized, resized })
}

fn scaled_height(width: u32, height: u32, target_width: u32) -> u32 {
    if width == 0 {
        return 1;
    }
    let scaled = (u64::from(height) * u64::from(target_width) + u64::from(width) / 2) / u64::from(width);
    scaled.clamp(1, u64::from(u32::MAX)) as u32
}

fn encode_jpeg(img: &DynamicImage) -> anyhow::Result<Vec<u8>> {
    let rgb = img.to_rgb8();
    let mut out = Cursor::new(Vec::new());
    let mut encoder = JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY);
    encoder.encode_image(&rgb).context("encoding jpeg")?;
    Ok(out.into_inner())
}

/// Fixed-delay pacing shared by every unit of a run.
///
/// The delay is served while holding the gate, so two paced operations are
/// always at least `delay` apart regardless of which task issues them.
#[derive(Debug)]
pub struct Throttle {
    delay: Duration,
    gate: Mutex<()>,
}

impl Throttle {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            gate: Mutex::new(()),
        }
    }

    pub fn from_millis(millis: u64) -> Self {
        Self::new(Duration::from_millis(millis))
    }

    pub async fn pace(&self) {
        let _gate = self.gate.lock().await;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            max_concurrency: 8,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetcher is shut down")]
    Closed,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let _permit = self.limit.acquire().await.map_err(|_| FetchError::Closed)?;
        self.fetch_with_retries(url)
            .instrument(info_span!("http_fetch", url))
            .await
    }

    pub async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        let response = self.fetch_bytes(url).await?;
        Ok(String::from_utf8_lossy(&response.body).into_owned())
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0;
        loop {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(%status, attempt, "retrying fetch");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(error = %err, attempt, "retrying fetch");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};
    use std::time::Instant;
    use tempfile::tempdir;

    fn sample_jpeg(width: u32, height: u32) -> Vec<u8> {
        let img = ImageBuffer::from_pixel(width, height, Rgb([180u8, 120, 60]));
        encode_jpeg(&DynamicImage::ImageRgb8(img)).expect("encode sample")
    }

    #[test]
    fn derivative_layout_matches_upload_tree() {
        let store = AssetStore::new("public/uploads");
        let paths = store.derivative_paths(2, 15, "A1234");
        let all: Vec<String> = paths
            .all()
            .iter()
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .collect();
        assert_eq!(
            all,
            vec![
                "public/uploads/org2/dog15/A1234.jpg",
                "public/uploads/org2/dog15/A1234-opt.jpg",
                "public/uploads/org2/dog15/A1234-200.jpg",
                "public/uploads/org2/dog15/A1234-400.jpg",
                "public/uploads/org2/dog15/A1234-600.jpg",
                "public/uploads/org2/dog15/A1234-800.jpg",
            ]
        );
    }

    #[tokio::test]
    async fn image_set_writes_all_renditions() {
        let dir = tempdir().expect("tempdir");
        let store = AssetStore::new(dir.path());
        let bytes = sample_jpeg(64, 32);

        let stored = store
            .write_image_set(2, 9, "img1", bytes.clone())
            .await
            .expect("write set");

        for path in stored.paths.all() {
            assert!(path.exists(), "{} missing", path.display());
        }
        assert_eq!(std::fs::read(&stored.paths.base).expect("base"), bytes);

        let (_, small) = &stored.paths.resized[0];
        let decoded = image::open(small).expect("decode 200");
        assert_eq!(decoded.width(), 200);
        assert_eq!(decoded.height(), 100);
        assert!(store.base_exists(2, 9, "img1").await.expect("exists"));
    }

    #[tokio::test]
    async fn undecodable_bytes_leave_no_base_file() {
        let dir = tempdir().expect("tempdir");
        let store = AssetStore::new(dir.path());

        let result = store
            .write_image_set(2, 9, "broken", b"<html>not an image</html>".to_vec())
            .await;

        assert!(result.is_err());
        assert!(!store.base_exists(2, 9, "broken").await.expect("exists"));
    }

    #[tokio::test]
    async fn deleting_missing_renditions_is_not_an_error() {
        let dir = tempdir().expect("tempdir");
        let store = AssetStore::new(dir.path());
        store
            .write_image_set(1, 3, "keep", sample_jpeg(16, 16))
            .await
            .expect("write set");
        std::fs::remove_file(store.derivative_paths(1, 3, "keep").optimized).expect("rm opt");

        let outcomes = store.delete_derivatives(1, 3, "keep").await;

        assert_eq!(outcomes.len(), 6);
        let missing = outcomes
            .iter()
            .filter(|(_, r)| matches!(r, Ok(Removal::Missing)))
            .count();
        let removed = outcomes
            .iter()
            .filter(|(_, r)| matches!(r, Ok(Removal::Removed)))
            .count();
        assert_eq!((missing, removed), (1, 5));
    }

    #[tokio::test]
    async fn removing_absent_dog_dir_reports_missing() {
        let dir = tempdir().expect("tempdir");
        let store = AssetStore::new(dir.path());
        let outcome = store.remove_dog_dir(1, 404).await.expect("remove");
        assert_eq!(outcome, Removal::Missing);
    }

    #[tokio::test]
    async fn throttle_spaces_consecutive_calls() {
        let throttle = Arc::new(Throttle::from_millis(30));
        let started = Instant::now();
        let a = {
            let throttle = throttle.clone();
            tokio::spawn(async move { throttle.pace().await })
        };
        let b = {
            let throttle = throttle.clone();
            tokio::spawn(async move { throttle.pace().await })
        };
        a.await.expect("a");
        b.await.expect("b");
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    fn scaled_height_preserves_aspect() {
        assert_eq!(scaled_height(800, 600, 200), 150);
        assert_eq!(scaled_height(3, 1, 200), 67);
        assert_eq!(scaled_height(1000, 1, 200), 1);
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }
}
