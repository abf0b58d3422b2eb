//! Removal of dogs and images that dropped out of the latest snapshot.
//!
//! Filesystem work here is best-effort: every outcome is logged and none of
//! them fail the run. Catalog errors still propagate.

use std::collections::HashSet;

use anyhow::{Context, Result};
use rehome_core::{ImageDescriptor, ImageRecord};
use rehome_storage::{AssetStore, Removal};
use tracing::{debug, info, warn};

use crate::catalog::Catalog;

/// Delete every sourced dog of the organisation whose source is not in `keep`.
/// Dogs without a source were entered by hand and are skipped.
pub async fn remove_stale_dogs(
    catalog: &dyn Catalog,
    assets: &AssetStore,
    organisation_id: i64,
    keep: &HashSet<&str>,
) -> Result<usize> {
    let dogs = catalog
        .dogs_for_organisation(organisation_id)
        .await
        .context("listing current dogs")?;

    let mut deleted = 0;
    for dog in dogs {
        let Some(source) = dog.source.as_deref() else {
            continue;
        };
        if keep.contains(source) {
            continue;
        }

        let images = catalog
            .delete_images_for_dog(dog.id)
            .await
            .with_context(|| format!("deleting images of stale dog {}", dog.id))?;
        remove_dog_dir(assets, organisation_id, dog.id).await;
        catalog
            .delete_dog(dog.id)
            .await
            .with_context(|| format!("deleting stale dog {}", dog.id))?;

        info!(dog_id = dog.id, source, images, "deleted dog no longer listed");
        deleted += 1;
    }
    Ok(deleted)
}

pub async fn remove_dog_dir(assets: &AssetStore, organisation_id: i64, dog_id: i64) {
    let dir = assets.dog_dir(organisation_id, dog_id);
    match assets.remove_dog_dir(organisation_id, dog_id).await {
        Ok(Removal::Removed) => debug!(dir = %dir.display(), "removed dog image directory"),
        Ok(Removal::Missing) => debug!(dir = %dir.display(), "dog image directory already absent"),
        Err(err) => warn!(dir = %dir.display(), error = %err, "failed to remove dog image directory"),
    }
}

fn filename_stem(filename: &str) -> &str {
    filename.strip_suffix(".jpg").unwrap_or(filename)
}

/// Best-effort removal of the six renditions behind an image record.
pub async fn remove_image_files(assets: &AssetStore, organisation_id: i64, image: &ImageRecord) {
    let stem = filename_stem(&image.filename);
    for (path, outcome) in assets
        .delete_derivatives(organisation_id, image.dog_id, stem)
        .await
    {
        match outcome {
            Ok(Removal::Removed) => debug!(path = %path.display(), "removed image file"),
            Ok(Removal::Missing) => info!(path = %path.display(), "image file already absent"),
            Err(err) => warn!(path = %path.display(), error = %err, "failed to remove image file"),
        }
    }
}

/// Drop images of `dog_id` whose source is no longer among `descriptors`.
pub async fn remove_stale_images(
    catalog: &dyn Catalog,
    assets: &AssetStore,
    organisation_id: i64,
    dog_id: i64,
    descriptors: &[ImageDescriptor],
) -> Result<usize> {
    let wanted: HashSet<&str> = descriptors.iter().map(|d| d.url.as_str()).collect();
    let current = catalog
        .images_for_dog(dog_id)
        .await
        .with_context(|| format!("listing images of dog {dog_id}"))?;

    let mut deleted = 0;
    for image in current.iter().filter(|image| !wanted.contains(image.source.as_str())) {
        remove_image_files(assets, organisation_id, image).await;
        catalog
            .delete_image(image.id)
            .await
            .with_context(|| format!("deleting stale image {}", image.id))?;
        debug!(dog_id, image_id = image.id, source = image.source.as_str(), "deleted stale image");
        deleted += 1;
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stem_is_filename_without_jpg_suffix() {
        assert_eq!(filename_stem("A918273.jpg"), "A918273");
        assert_eq!(filename_stem("legacy"), "legacy");
    }
}
