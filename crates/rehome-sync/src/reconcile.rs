//! Snapshot-to-catalog diffing keyed on listing source URLs.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use rehome_adapters::{normalize_listing, NormalizeRules};
use rehome_core::{DogFields, DogUpdate, Listing, NewDog, RawListing};
use rehome_storage::AssetStore;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::cleanup::{remove_stale_dogs, remove_stale_images};
use crate::error::SyncError;
use crate::images::{ImageFetcher, ImageOutcome, ImagePipeline, Throttles};
use crate::resolver::{FollowUpQueue, Resolution, Resolver};
use crate::OrganisationConfig;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunCounts {
    pub dogs_added: usize,
    pub dogs_updated: usize,
    pub dogs_deleted: usize,
    pub images_added: usize,
    pub images_repaired: usize,
    pub images_deleted: usize,
    pub dropped_listings: usize,
    /// Unresolved location names, once each, for manual follow-up.
    pub new_locations: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
struct DogOutcome {
    created: bool,
    images: ImageOutcome,
    images_deleted: usize,
}

struct Resolved {
    listings: Vec<Listing>,
    dropped: usize,
    new_locations: Vec<String>,
}

pub struct Reconciler {
    organisation_id: i64,
    actor_id: i64,
    rules: NormalizeRules,
    catalog: Arc<dyn Catalog>,
    assets: AssetStore,
    images: ImagePipeline,
}

impl Reconciler {
    pub fn new(
        organisation: &OrganisationConfig,
        actor_id: i64,
        catalog: Arc<dyn Catalog>,
        assets: AssetStore,
        fetcher: Arc<dyn ImageFetcher>,
        throttles: Throttles,
    ) -> Self {
        let images = ImagePipeline::new(
            catalog.clone(),
            assets.clone(),
            fetcher,
            throttles,
            organisation.id,
            actor_id,
        );
        Self {
            organisation_id: organisation.id,
            actor_id,
            rules: organisation.normalize_rules(),
            catalog,
            assets,
            images,
        }
    }

    /// Bring the organisation's sourced dogs in line with `raw`.
    ///
    /// Order: resolve everything, delete dogs whose source vanished, then run
    /// one create/update + image unit per listing concurrently. The first
    /// fatal unit error aborts the run; finished units are not rolled back.
    pub async fn reconcile(&self, raw: &[RawListing], now: DateTime<Utc>) -> Result<RunCounts> {
        if raw.is_empty() {
            return Err(SyncError::EmptySnapshot.into());
        }

        let resolved = self.resolve_all(raw).await?;

        // Dropped listings count as gone, so only resolved sources are kept.
        let keep: HashSet<&str> = resolved.listings.iter().map(|l| l.source.as_str()).collect();
        let dogs_deleted =
            remove_stale_dogs(self.catalog.as_ref(), &self.assets, self.organisation_id, &keep)
                .await
                .context("removing stale dogs")?;

        let outcomes = try_join_all(
            resolved
                .listings
                .iter()
                .map(|listing| self.process_listing(listing, now)),
        )
        .await?;

        let counts = outcomes.iter().fold(
            RunCounts {
                dogs_deleted,
                dropped_listings: resolved.dropped,
                new_locations: resolved.new_locations,
                ..RunCounts::default()
            },
            |mut acc, outcome| {
                if outcome.created {
                    acc.dogs_added += 1;
                } else {
                    acc.dogs_updated += 1;
                }
                acc.images_added += outcome.images.added;
                acc.images_repaired += outcome.images.repaired;
                acc.images_deleted += outcome.images_deleted;
                acc
            },
        );

        info!(
            dogs_added = counts.dogs_added,
            dogs_updated = counts.dogs_updated,
            dogs_deleted = counts.dogs_deleted,
            images_added = counts.images_added,
            images_repaired = counts.images_repaired,
            images_deleted = counts.images_deleted,
            dropped = counts.dropped_listings,
            "reconciliation finished"
        );
        Ok(counts)
    }

    async fn resolve_all(&self, raw: &[RawListing]) -> Result<Resolved> {
        let resolver = Resolver::new(self.catalog.as_ref(), self.organisation_id);
        let mut follow_up = FollowUpQueue::default();
        let mut seen = HashSet::new();
        let mut listings = Vec::with_capacity(raw.len());
        let mut dropped = 0;

        for item in raw {
            if !seen.insert(item.source.as_str()) {
                warn!(source = item.source.as_str(), "duplicate listing in snapshot, keeping first");
                continue;
            }
            let normalized = normalize_listing(item, &self.rules);
            let resolution = resolver
                .resolve(normalized, &mut follow_up)
                .await
                .with_context(|| format!("resolving references for {}", item.source))?;
            match resolution {
                Resolution::Resolved(listing) => listings.push(listing),
                Resolution::UnknownLocation { name } => {
                    warn!(
                        source = item.source.as_str(),
                        location = name.as_deref().unwrap_or("<missing>"),
                        "listing dropped: location not resolved"
                    );
                    dropped += 1;
                }
                Resolution::MissingName => {
                    warn!(source = item.source.as_str(), "listing dropped: no name");
                    dropped += 1;
                }
            }
        }

        Ok(Resolved {
            listings,
            dropped,
            new_locations: follow_up.into_names(),
        })
    }

    async fn process_listing(&self, listing: &Listing, now: DateTime<Utc>) -> Result<DogOutcome> {
        let (dog_id, created) = self.upsert_dog(listing, now).await?;
        self.assets.ensure_dog_dir(self.organisation_id, dog_id).await?;

        let images_deleted = remove_stale_images(
            self.catalog.as_ref(),
            &self.assets,
            self.organisation_id,
            dog_id,
            &listing.images,
        )
        .await?;

        let images = self
            .images
            .sync_dog_images(dog_id, &listing.images, now)
            .await
            .with_context(|| format!("syncing images for {}", listing.source))?;

        debug!(dog_id, created, source = listing.source.as_str(), "listing reconciled");
        Ok(DogOutcome {
            created,
            images,
            images_deleted,
        })
    }

    async fn upsert_dog(&self, listing: &Listing, now: DateTime<Utc>) -> Result<(i64, bool)> {
        let fields = DogFields::from(listing);
        let existing = self
            .catalog
            .dog_by_source(&listing.source)
            .await
            .with_context(|| format!("looking up dog for {}", listing.source))?;

        match existing {
            Some(dog) => {
                let updated = self
                    .catalog
                    .update_dog(
                        dog.id,
                        &DogUpdate {
                            fields,
                            updated_at: now,
                            updated_by: self.actor_id,
                        },
                    )
                    .await
                    .with_context(|| format!("updating dog for {}", listing.source))?;
                if !updated {
                    return Err(SyncError::DogNotUpdated {
                        dog_id: dog.id,
                        source_url: listing.source.clone(),
                    }
                    .into());
                }
                Ok((dog.id, false))
            }
            None => {
                let id = self
                    .catalog
                    .create_dog(&NewDog {
                        organisation_id: self.organisation_id,
                        source: listing.source.clone(),
                        fields,
                        created_at: now,
                        created_by: self.actor_id,
                    })
                    .await
                    .with_context(|| format!("creating dog for {}", listing.source))?
                    .ok_or_else(|| SyncError::DogNotCreated {
                        source_url: listing.source.clone(),
                    })?;
                Ok((id, true))
            }
        }
    }
}
