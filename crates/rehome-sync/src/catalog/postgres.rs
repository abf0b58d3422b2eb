use anyhow::{Context, Result};
use async_trait::async_trait;
use rehome_core::{
    AgeGroup, Compatibility, DogFields, DogRecord, DogUpdate, ImageRecord, LocationRecord, NewDog,
    NewImage,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};

use super::{BreedLookup, DogRepository, ImageRepository, LocationLookup};

const DOG_COLUMNS: &str = "id, organisation, source, name, breed, breedname, size, sex, tagline, \
     location, description, children, dogs, cats, agegroup, age, youtube, \
     created_at, created_by, updated_at, updated_by";

const IMAGE_COLUMNS: &str = "id, filename, is_main, dog, source";

pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .context("applying catalog migrations")
}

#[derive(Debug, Clone)]
pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("connecting to catalog database")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn dog_from_row(row: &PgRow) -> Result<DogRecord> {
    let children: String = row.try_get("children")?;
    let dogs: String = row.try_get("dogs")?;
    let cats: String = row.try_get("cats")?;
    let age_group: Option<String> = row.try_get("agegroup")?;
    Ok(DogRecord {
        id: row.try_get("id")?,
        organisation_id: row.try_get("organisation")?,
        source: row.try_get("source")?,
        fields: DogFields {
            name: row.try_get("name")?,
            breed_id: row.try_get("breed")?,
            breed_name: row.try_get("breedname")?,
            size: row.try_get("size")?,
            sex: row.try_get("sex")?,
            tagline: row.try_get("tagline")?,
            location_id: row.try_get("location")?,
            description: row.try_get("description")?,
            children: Compatibility::parse(&children),
            dogs: Compatibility::parse(&dogs),
            cats: Compatibility::parse(&cats),
            age_group: age_group.as_deref().and_then(AgeGroup::parse),
            age: row.try_get("age")?,
            youtube: row.try_get("youtube")?,
        },
        created_at: row.try_get("created_at")?,
        created_by: row.try_get("created_by")?,
        updated_at: row.try_get("updated_at")?,
        updated_by: row.try_get("updated_by")?,
    })
}

fn image_from_row(row: &PgRow) -> Result<ImageRecord> {
    Ok(ImageRecord {
        id: row.try_get("id")?,
        filename: row.try_get("filename")?,
        is_main: row.try_get("is_main")?,
        dog_id: row.try_get("dog")?,
        source: row.try_get("source")?,
    })
}

#[async_trait]
impl BreedLookup for PgCatalog {
    async fn breed_id_by_name(&self, name: &str) -> Result<Option<i64>> {
        let row = sqlx::query("SELECT id FROM breeds WHERE name = $1 LIMIT 1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("looking up breed {name:?}"))?;
        row.map(|r| r.try_get("id")).transpose().map_err(Into::into)
    }
}

#[async_trait]
impl LocationLookup for PgCatalog {
    async fn locations_by_name(&self, name: &str) -> Result<Vec<LocationRecord>> {
        let rows = sqlx::query("SELECT id, name, organisation FROM locations WHERE name = $1")
            .bind(name)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("looking up location {name:?}"))?;
        rows.iter()
            .map(|row| -> Result<LocationRecord> {
                Ok(LocationRecord {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    organisation_id: row.try_get("organisation")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl DogRepository for PgCatalog {
    async fn dog_by_source(&self, source: &str) -> Result<Option<DogRecord>> {
        let row = sqlx::query(&format!("SELECT {DOG_COLUMNS} FROM dogs WHERE source = $1"))
            .bind(source)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("looking up dog by source {source}"))?;
        row.as_ref().map(dog_from_row).transpose()
    }

    async fn dogs_for_organisation(&self, organisation_id: i64) -> Result<Vec<DogRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {DOG_COLUMNS} FROM dogs WHERE organisation = $1 ORDER BY id"
        ))
        .bind(organisation_id)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("listing dogs for organisation {organisation_id}"))?;
        rows.iter().map(dog_from_row).collect()
    }

    async fn create_dog(&self, dog: &NewDog) -> Result<Option<i64>> {
        let f = &dog.fields;
        let row = sqlx::query(
            "INSERT INTO dogs (organisation, source, name, breed, breedname, size, sex, tagline, \
             location, description, children, dogs, cats, agegroup, age, youtube, created_at, created_by) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18) \
             RETURNING id",
        )
        .bind(dog.organisation_id)
        .bind(&dog.source)
        .bind(&f.name)
        .bind(f.breed_id)
        .bind(f.breed_name.as_deref())
        .bind(f.size.as_deref())
        .bind(f.sex.as_deref())
        .bind(f.tagline.as_deref())
        .bind(f.location_id)
        .bind(f.description.as_deref())
        .bind(f.children.as_str())
        .bind(f.dogs.as_str())
        .bind(f.cats.as_str())
        .bind(f.age_group.map(|a| a.as_str()))
        .bind(f.age.as_deref())
        .bind(f.youtube.as_deref())
        .bind(dog.created_at)
        .bind(dog.created_by)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("inserting dog {}", dog.source))?;
        row.map(|r| r.try_get("id")).transpose().map_err(Into::into)
    }

    async fn update_dog(&self, id: i64, update: &DogUpdate) -> Result<bool> {
        let f = &update.fields;
        let result = sqlx::query(
            "UPDATE dogs SET name = $2, breed = $3, breedname = $4, size = $5, sex = $6, tagline = $7, \
             location = $8, description = $9, children = $10, dogs = $11, cats = $12, agegroup = $13, \
             age = $14, youtube = $15, updated_at = $16, updated_by = $17 WHERE id = $1",
        )
        .bind(id)
        .bind(&f.name)
        .bind(f.breed_id)
        .bind(f.breed_name.as_deref())
        .bind(f.size.as_deref())
        .bind(f.sex.as_deref())
        .bind(f.tagline.as_deref())
        .bind(f.location_id)
        .bind(f.description.as_deref())
        .bind(f.children.as_str())
        .bind(f.dogs.as_str())
        .bind(f.cats.as_str())
        .bind(f.age_group.map(|a| a.as_str()))
        .bind(f.age.as_deref())
        .bind(f.youtube.as_deref())
        .bind(update.updated_at)
        .bind(update.updated_by)
        .execute(&self.pool)
        .await
        .with_context(|| format!("updating dog {id}"))?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_dog(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM dogs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("deleting dog {id}"))?;
        Ok(())
    }
}

#[async_trait]
impl ImageRepository for PgCatalog {
    async fn image_by_source(&self, source: &str) -> Result<Option<ImageRecord>> {
        let row = sqlx::query(&format!("SELECT {IMAGE_COLUMNS} FROM images WHERE source = $1"))
            .bind(source)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("looking up image {source}"))?;
        row.as_ref().map(image_from_row).transpose()
    }

    async fn images_for_dog(&self, dog_id: i64) -> Result<Vec<ImageRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {IMAGE_COLUMNS} FROM images WHERE dog = $1 ORDER BY id"
        ))
        .bind(dog_id)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("listing images for dog {dog_id}"))?;
        rows.iter().map(image_from_row).collect()
    }

    async fn create_image(&self, image: &NewImage) -> Result<Option<i64>> {
        let row = sqlx::query(
            "INSERT INTO images (filename, is_main, dog, source, updated_at, updated_by) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING id",
        )
        .bind(&image.filename)
        .bind(image.is_main)
        .bind(image.dog_id)
        .bind(&image.source)
        .bind(image.updated_at)
        .bind(image.updated_by)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("inserting image {}", image.source))?;
        row.map(|r| r.try_get("id")).transpose().map_err(Into::into)
    }

    async fn delete_image(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM images WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("deleting image {id}"))?;
        Ok(())
    }

    async fn delete_images_for_dog(&self, dog_id: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM images WHERE dog = $1")
            .bind(dog_id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("deleting images for dog {dog_id}"))?;
        Ok(result.rows_affected())
    }

    async fn set_main_by_source(&self, source: &str) -> Result<()> {
        sqlx::query(
            "UPDATE images SET is_main = (source = $1) \
             WHERE dog = (SELECT dog FROM images WHERE source = $1)",
        )
        .bind(source)
        .execute(&self.pool)
        .await
        .with_context(|| format!("setting main image {source}"))?;
        Ok(())
    }
}
