use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use async_trait::async_trait;
use rehome_core::{DogRecord, DogUpdate, ImageRecord, LocationRecord, NewDog, NewImage};

use super::{BreedLookup, DogRepository, ImageRepository, LocationLookup};

#[derive(Debug, Default)]
struct State {
    breeds: BTreeMap<i64, String>,
    locations: Vec<LocationRecord>,
    dogs: BTreeMap<i64, DogRecord>,
    images: BTreeMap<i64, ImageRecord>,
    last_dog_id: i64,
    last_image_id: i64,
}

/// Ids are never reused, even after the highest row is deleted.
fn allocate(last: &mut i64) -> i64 {
    *last += 1;
    *last
}

/// Process-local catalog used by tests and offline runs.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    state: Mutex<State>,
    reject_dog_writes: AtomicBool,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn with_breed(self, id: i64, name: &str) -> Self {
        self.state().breeds.insert(id, name.to_string());
        self
    }

    pub fn with_location(self, id: i64, name: &str, organisation_id: i64) -> Self {
        self.state().locations.push(LocationRecord {
            id,
            name: name.to_string(),
            organisation_id,
        });
        self
    }

    pub fn insert_dog(&self, dog: DogRecord) {
        let mut state = self.state();
        state.last_dog_id = state.last_dog_id.max(dog.id);
        state.dogs.insert(dog.id, dog);
    }

    pub fn insert_image(&self, image: ImageRecord) {
        let mut state = self.state();
        state.last_image_id = state.last_image_id.max(image.id);
        state.images.insert(image.id, image);
    }

    pub fn dogs(&self) -> Vec<DogRecord> {
        self.state().dogs.values().cloned().collect()
    }

    pub fn images(&self) -> Vec<ImageRecord> {
        self.state().images.values().cloned().collect()
    }

    /// Make every later dog create/update come back without a row.
    pub fn reject_dog_writes(&self) {
        self.reject_dog_writes.store(true, Ordering::SeqCst);
    }

    fn rejecting(&self) -> bool {
        self.reject_dog_writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BreedLookup for MemoryCatalog {
    async fn breed_id_by_name(&self, name: &str) -> Result<Option<i64>> {
        Ok(self
            .state()
            .breeds
            .iter()
            .find(|(_, breed)| breed.as_str() == name)
            .map(|(id, _)| *id))
    }
}

#[async_trait]
impl LocationLookup for MemoryCatalog {
    async fn locations_by_name(&self, name: &str) -> Result<Vec<LocationRecord>> {
        Ok(self
            .state()
            .locations
            .iter()
            .filter(|location| location.name == name)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl DogRepository for MemoryCatalog {
    async fn dog_by_source(&self, source: &str) -> Result<Option<DogRecord>> {
        Ok(self
            .state()
            .dogs
            .values()
            .find(|dog| dog.source.as_deref() == Some(source))
            .cloned())
    }

    async fn dogs_for_organisation(&self, organisation_id: i64) -> Result<Vec<DogRecord>> {
        Ok(self
            .state()
            .dogs
            .values()
            .filter(|dog| dog.organisation_id == organisation_id)
            .cloned()
            .collect())
    }

    async fn create_dog(&self, dog: &NewDog) -> Result<Option<i64>> {
        if self.rejecting() {
            return Ok(None);
        }
        let mut state = self.state();
        if state.dogs.values().any(|d| d.source.as_deref() == Some(dog.source.as_str())) {
            anyhow::bail!("duplicate dog source {}", dog.source);
        }
        let id = allocate(&mut state.last_dog_id);
        state.dogs.insert(
            id,
            DogRecord {
                id,
                organisation_id: dog.organisation_id,
                source: Some(dog.source.clone()),
                fields: dog.fields.clone(),
                created_at: Some(dog.created_at),
                created_by: Some(dog.created_by),
                updated_at: None,
                updated_by: None,
            },
        );
        Ok(Some(id))
    }

    async fn update_dog(&self, id: i64, update: &DogUpdate) -> Result<bool> {
        if self.rejecting() {
            return Ok(false);
        }
        let mut state = self.state();
        let Some(dog) = state.dogs.get_mut(&id) else {
            return Ok(false);
        };
        dog.fields = update.fields.clone();
        dog.updated_at = Some(update.updated_at);
        dog.updated_by = Some(update.updated_by);
        Ok(true)
    }

    async fn delete_dog(&self, id: i64) -> Result<()> {
        let mut state = self.state();
        state.dogs.remove(&id);
        state.images.retain(|_, image| image.dog_id != id);
        Ok(())
    }
}

#[async_trait]
impl ImageRepository for MemoryCatalog {
    async fn image_by_source(&self, source: &str) -> Result<Option<ImageRecord>> {
        Ok(self
            .state()
            .images
            .values()
            .find(|image| image.source == source)
            .cloned())
    }

    async fn images_for_dog(&self, dog_id: i64) -> Result<Vec<ImageRecord>> {
        Ok(self
            .state()
            .images
            .values()
            .filter(|image| image.dog_id == dog_id)
            .cloned()
            .collect())
    }

    async fn create_image(&self, image: &NewImage) -> Result<Option<i64>> {
        let mut state = self.state();
        if state.images.values().any(|i| i.source == image.source) {
            anyhow::bail!("duplicate image source {}", image.source);
        }
        let id = allocate(&mut state.last_image_id);
        state.images.insert(
            id,
            ImageRecord {
                id,
                filename: image.filename.clone(),
                is_main: image.is_main,
                dog_id: image.dog_id,
                source: image.source.clone(),
            },
        );
        Ok(Some(id))
    }

    async fn delete_image(&self, id: i64) -> Result<()> {
        self.state().images.remove(&id);
        Ok(())
    }

    async fn delete_images_for_dog(&self, dog_id: i64) -> Result<u64> {
        let mut state = self.state();
        let before = state.images.len();
        state.images.retain(|_, image| image.dog_id != dog_id);
        Ok((before - state.images.len()) as u64)
    }

    async fn set_main_by_source(&self, source: &str) -> Result<()> {
        let mut state = self.state();
        let Some(dog_id) = state
            .images
            .values()
            .find(|image| image.source == source)
            .map(|image| image.dog_id)
        else {
            return Ok(());
        };
        for image in state.images.values_mut().filter(|image| image.dog_id == dog_id) {
            image.is_main = image.source == source;
        }
        Ok(())
    }
}
