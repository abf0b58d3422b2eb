//! Per-dog image reconciliation: import, re-home, self-heal, main flag.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rehome_core::{image_filename, image_stem, ImageDescriptor, NewImage};
use rehome_storage::{AssetStore, HttpFetcher, Throttle};
use tracing::debug;

use crate::catalog::Catalog;
use crate::cleanup::remove_image_files;
use crate::error::SyncError;

#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch_image(&self, url: &str) -> Result<Vec<u8>>;
}

#[async_trait]
impl ImageFetcher for HttpFetcher {
    async fn fetch_image(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .fetch_bytes(url)
            .await
            .with_context(|| format!("downloading image {url}"))?;
        if response.final_url != url {
            debug!(url, final_url = response.final_url.as_str(), "image request redirected");
        }
        Ok(response.body)
    }
}

/// The two pacing gates of a run.
#[derive(Debug, Clone)]
pub struct Throttles {
    /// Before every outbound fetch.
    pub fetch: Arc<Throttle>,
    /// Before every image row insert.
    pub db: Arc<Throttle>,
}

impl Throttles {
    pub fn from_millis(fetch_ms: u64, db_ms: u64) -> Self {
        Self {
            fetch: Arc::new(Throttle::from_millis(fetch_ms)),
            db: Arc::new(Throttle::from_millis(db_ms)),
        }
    }

    pub fn disabled() -> Self {
        Self::from_millis(0, 0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImageOutcome {
    pub added: usize,
    pub repaired: usize,
}

#[derive(Clone)]
pub struct ImagePipeline {
    catalog: Arc<dyn Catalog>,
    assets: AssetStore,
    fetcher: Arc<dyn ImageFetcher>,
    throttles: Throttles,
    organisation_id: i64,
    actor_id: i64,
}

enum Step {
    Add,
    Repair,
    Keep,
}

impl ImagePipeline {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        assets: AssetStore,
        fetcher: Arc<dyn ImageFetcher>,
        throttles: Throttles,
        organisation_id: i64,
        actor_id: i64,
    ) -> Self {
        Self {
            catalog,
            assets,
            fetcher,
            throttles,
            organisation_id,
            actor_id,
        }
    }

    /// Walk `descriptors` in order, then point the dog's main flag at the
    /// descriptor marked main. Stale images must already be gone.
    pub async fn sync_dog_images(
        &self,
        dog_id: i64,
        descriptors: &[ImageDescriptor],
        now: DateTime<Utc>,
    ) -> Result<ImageOutcome> {
        let mut outcome = ImageOutcome::default();

        for descriptor in descriptors {
            let url = descriptor.url.as_str();
            let stem = image_stem(url);

            let existing = self
                .catalog
                .image_by_source(url)
                .await
                .with_context(|| format!("looking up image {url}"))?;

            let step = match existing {
                None => Step::Add,
                Some(image) if image.dog_id != dog_id => {
                    debug!(url, from = image.dog_id, to = dog_id, "image moved to another dog");
                    remove_image_files(&self.assets, self.organisation_id, &image).await;
                    self.catalog
                        .delete_image(image.id)
                        .await
                        .with_context(|| format!("deleting re-homed image {}", image.id))?;
                    Step::Add
                }
                Some(_) => {
                    if self
                        .assets
                        .base_exists(self.organisation_id, dog_id, &stem)
                        .await?
                    {
                        Step::Keep
                    } else {
                        Step::Repair
                    }
                }
            };

            match step {
                Step::Keep => debug!(url, dog_id, "image already imported"),
                Step::Repair => {
                    debug!(url, dog_id, "base file missing, re-importing");
                    self.import(dog_id, &stem, url).await?;
                    outcome.repaired += 1;
                }
                Step::Add => {
                    self.import(dog_id, &stem, url).await?;
                    self.throttles.db.pace().await;
                    let filename = image_filename(&stem);
                    let image_id = self
                        .catalog
                        .create_image(&NewImage {
                            filename,
                            is_main: false,
                            dog_id,
                            source: url.to_string(),
                            updated_at: now,
                            updated_by: self.actor_id,
                        })
                        .await
                        .with_context(|| format!("creating image record {url}"))?
                        .ok_or_else(|| SyncError::ImageNotCreated {
                            source_url: url.to_string(),
                        })?;
                    debug!(url, dog_id, image_id, "image imported");
                    outcome.added += 1;
                }
            }
        }

        if let Some(main) = descriptors.iter().find(|d| d.is_main) {
            self.catalog
                .set_main_by_source(&main.url)
                .await
                .with_context(|| format!("setting main image for dog {dog_id}"))?;
        }

        Ok(outcome)
    }

    /// Download and write the full rendition set. Completes before any
    /// catalog row is created or trusted.
    async fn import(&self, dog_id: i64, stem: &str, url: &str) -> Result<()> {
        self.throttles.fetch.pace().await;
        let bytes = self.fetcher.fetch_image(url).await?;
        let stored = self
            .assets
            .write_image_set(self.organisation_id, dog_id, stem, bytes)
            .await
            .with_context(|| format!("importing image {url}"))?;
        debug!(
            url,
            dog_id,
            base = %stored.paths.base.display(),
            bytes = stored.byte_size,
            "image renditions stored"
        );
        Ok(())
    }
}
