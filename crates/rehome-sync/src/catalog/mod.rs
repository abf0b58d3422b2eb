//! Repository seams over the persisted catalog.

use anyhow::Result;
use async_trait::async_trait;
use rehome_core::{DogRecord, DogUpdate, ImageRecord, LocationRecord, NewDog, NewImage};

mod memory;
mod postgres;

pub use memory::MemoryCatalog;
pub use postgres::{migrate, PgCatalog};

#[async_trait]
pub trait BreedLookup: Send + Sync {
    async fn breed_id_by_name(&self, name: &str) -> Result<Option<i64>>;
}

#[async_trait]
pub trait LocationLookup: Send + Sync {
    /// Every location with this exact name, across all organisations.
    async fn locations_by_name(&self, name: &str) -> Result<Vec<LocationRecord>>;
}

#[async_trait]
pub trait DogRepository: Send + Sync {
    async fn dog_by_source(&self, source: &str) -> Result<Option<DogRecord>>;

    async fn dogs_for_organisation(&self, organisation_id: i64) -> Result<Vec<DogRecord>>;

    /// `Ok(None)` means the store accepted the call but produced no row.
    async fn create_dog(&self, dog: &NewDog) -> Result<Option<i64>>;

    /// Returns whether a row was updated.
    async fn update_dog(&self, id: i64, update: &DogUpdate) -> Result<bool>;

    async fn delete_dog(&self, id: i64) -> Result<()>;
}

#[async_trait]
pub trait ImageRepository: Send + Sync {
    async fn image_by_source(&self, source: &str) -> Result<Option<ImageRecord>>;

    async fn images_for_dog(&self, dog_id: i64) -> Result<Vec<ImageRecord>>;

    async fn create_image(&self, image: &NewImage) -> Result<Option<i64>>;

    async fn delete_image(&self, id: i64) -> Result<()>;

    async fn delete_images_for_dog(&self, dog_id: i64) -> Result<u64>;

    /// Flag the image with this source as main and clear the flag on its siblings.
    async fn set_main_by_source(&self, source: &str) -> Result<()>;
}

pub trait Catalog: BreedLookup + LocationLookup + DogRepository + ImageRepository {}

impl<T> Catalog for T where T: BreedLookup + LocationLookup + DogRepository + ImageRepository {}
