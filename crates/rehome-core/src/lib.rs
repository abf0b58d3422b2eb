//! Core domain model for the adoption listing catalog.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const CRATE_NAME: &str = "rehome-core";

/// Reserved breed id meaning "breed unspecified/unresolved".
pub const UNKNOWN_BREED_ID: i64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgeGroup {
    Puppy,
    Juvenile,
    Adult,
}

impl AgeGroup {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgeGroup::Puppy => "puppy",
            AgeGroup::Juvenile => "juvenile",
            AgeGroup::Adult => "adult",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "puppy" => Some(AgeGroup::Puppy),
            "juvenile" => Some(AgeGroup::Juvenile),
            "adult" => Some(AgeGroup::Adult),
            _ => None,
        }
    }
}

/// Tri-state answer for "can live with children/dogs/cats".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Compatibility {
    Yes,
    No,
    #[default]
    Unknown,
}

impl Compatibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Compatibility::Yes => "yes",
            Compatibility::No => "no",
            Compatibility::Unknown => "unknown",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "yes" => Compatibility::Yes,
            "no" => Compatibility::No,
            _ => Compatibility::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDescriptor {
    pub url: String,
    pub is_main: bool,
}

/// Extractor output for one detail page, before any normalization.
///
/// This is the unit stored in cached snapshot files, so every field the
/// extractor may fail to find is optional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RawListing {
    pub source: String,
    pub name: Option<String>,
    pub breed: Option<String>,
    pub age: Option<String>,
    pub location: Option<String>,
    #[serde(default)]
    pub description_paragraphs: Vec<String>,
    pub family_text: Option<String>,
    pub dog_text: Option<String>,
    pub cat_text: Option<String>,
    #[serde(default)]
    pub gallery_images: Vec<String>,
    pub single_image: Option<String>,
    pub video_src: Option<String>,
}

/// Listing after normalization but before reference resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NormalizedListing {
    pub source: String,
    pub name: Option<String>,
    pub sex: Option<String>,
    pub size: Option<String>,
    pub age_group: Option<AgeGroup>,
    pub breed_name: Option<String>,
    pub location_name: Option<String>,
    pub description: Option<String>,
    pub children: Compatibility,
    pub dogs: Compatibility,
    pub cats: Compatibility,
    pub youtube: Option<String>,
    pub images: Vec<ImageDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreedRef {
    pub id: i64,
    /// Only kept when `id` is the unknown sentinel.
    pub raw_name: Option<String>,
}

impl BreedRef {
    pub fn resolved(id: i64) -> Self {
        Self { id, raw_name: None }
    }

    pub fn unresolved(raw_name: Option<String>) -> Self {
        Self {
            id: UNKNOWN_BREED_ID,
            raw_name,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.id == UNKNOWN_BREED_ID
    }
}

/// Canonical, fully resolved listing for one source item in a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Listing {
    pub source: String,
    pub name: String,
    pub sex: Option<String>,
    pub size: Option<String>,
    pub age_group: Option<AgeGroup>,
    pub breed: BreedRef,
    pub location_id: i64,
    pub description: Option<String>,
    pub children: Compatibility,
    pub dogs: Compatibility,
    pub cats: Compatibility,
    pub youtube: Option<String>,
    pub images: Vec<ImageDescriptor>,
}

/// Columns of a dog row that a sync run owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DogFields {
    pub name: String,
    pub breed_id: i64,
    pub breed_name: Option<String>,
    pub size: Option<String>,
    pub sex: Option<String>,
    pub tagline: Option<String>,
    pub location_id: i64,
    pub description: Option<String>,
    pub children: Compatibility,
    pub dogs: Compatibility,
    pub cats: Compatibility,
    pub age_group: Option<AgeGroup>,
    pub age: Option<String>,
    pub youtube: Option<String>,
}

impl From<&Listing> for DogFields {
    fn from(listing: &Listing) -> Self {
        let breed_name = if listing.breed.is_unknown() {
            listing.breed.raw_name.clone()
        } else {
            None
        };
        Self {
            name: listing.name.clone(),
            breed_id: listing.breed.id,
            breed_name,
            size: listing.size.clone(),
            sex: listing.sex.clone(),
            tagline: None,
            location_id: listing.location_id,
            description: listing.description.clone(),
            children: listing.children,
            dogs: listing.dogs,
            cats: listing.cats,
            age_group: listing.age_group,
            age: None,
            youtube: listing.youtube.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DogRecord {
    pub id: i64,
    pub organisation_id: i64,
    /// `None` for dogs entered by hand; those are never touched by a sync run.
    pub source: Option<String>,
    pub fields: DogFields,
    pub created_at: Option<DateTime<Utc>>,
    pub created_by: Option<i64>,
    pub updated_at: Option<DateTime<Utc>>,
    pub updated_by: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDog {
    pub organisation_id: i64,
    pub source: String,
    pub fields: DogFields,
    pub created_at: DateTime<Utc>,
    pub created_by: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DogUpdate {
    pub fields: DogFields,
    pub updated_at: DateTime<Utc>,
    pub updated_by: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: i64,
    pub filename: String,
    pub is_main: bool,
    pub dog_id: i64,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewImage {
    pub filename: String,
    pub is_main: bool,
    pub dog_id: i64,
    pub source: String,
    pub updated_at: DateTime<Utc>,
    pub updated_by: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationRecord {
    pub id: i64,
    pub name: String,
    pub organisation_id: i64,
}

/// Deterministic asset stem for an image source URL.
///
/// Uses the `imageId` query parameter when present, otherwise a short
/// SHA-256 prefix of the whole URL.
pub fn image_stem(url: &str) -> String {
    let from_query = url
        .split_once('?')
        .map(|(_, query)| query)
        .and_then(|query| {
            query
                .split('&')
                .filter_map(|pair| pair.split_once('='))
                .find(|(key, _)| *key == "imageId")
                .map(|(_, value)| value)
        })
        .map(|value| {
            value
                .chars()
                .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
                .collect::<String>()
        })
        .filter(|stem| !stem.is_empty());

    from_query.unwrap_or_else(|| {
        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        let digest = hex::encode(hasher.finalize());
        digest[..16].to_string()
    })
}

pub fn image_filename(stem: &str) -> String {
    format!("{stem}.jpg")
}

/// Upper-cases the first character and lower-cases the rest.
pub fn title_case(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(|c| c.to_lowercase())).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(breed: BreedRef) -> Listing {
        Listing {
            source: "https://example.org/dog/1".into(),
            name: "Rex".into(),
            sex: None,
            size: None,
            age_group: Some(AgeGroup::Adult),
            breed,
            location_id: 7,
            description: None,
            children: Compatibility::Unknown,
            dogs: Compatibility::Yes,
            cats: Compatibility::No,
            youtube: None,
            images: vec![],
        }
    }

    #[test]
    fn stem_uses_image_id_query_parameter() {
        assert_eq!(
            image_stem("https://www.rspca.org.uk/ImageLocator/locate.do?imageId=A12345&size=large"),
            "A12345"
        );
        assert_eq!(image_filename("A12345"), "A12345.jpg");
    }

    #[test]
    fn stem_falls_back_to_url_digest() {
        let a = image_stem("https://cdn.example.org/photos/rex.jpg");
        let b = image_stem("https://cdn.example.org/photos/rex.jpg");
        let c = image_stem("https://cdn.example.org/photos/max.jpg");
        assert_eq!(a.len(), 16);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn stem_strips_path_characters() {
        assert_eq!(image_stem("https://x.test/i?imageId=../../etc&size=large"), "etc");
    }

    #[test]
    fn title_case_lowercases_tail() {
        assert_eq!(title_case("rEX"), "Rex");
        assert_eq!(title_case("BELLA MAE"), "Bella mae");
        assert_eq!(title_case(""), "");
    }

    #[test]
    fn resolved_breed_drops_raw_name() {
        let fields = DogFields::from(&listing(BreedRef {
            id: 42,
            raw_name: Some("Collie".into()),
        }));
        assert_eq!(fields.breed_id, 42);
        assert_eq!(fields.breed_name, None);

        let fields = DogFields::from(&listing(BreedRef::unresolved(Some("Mystery Mix".into()))));
        assert_eq!(fields.breed_id, UNKNOWN_BREED_ID);
        assert_eq!(fields.breed_name.as_deref(), Some("Mystery Mix"));
    }
}
