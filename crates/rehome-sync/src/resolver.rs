//! Breed and location resolution against the catalog's reference tables.

use std::collections::HashSet;

use anyhow::Result;
use rehome_core::{BreedRef, Listing, NormalizedListing};

use crate::catalog::Catalog;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Resolved(Listing),
    /// Location text absent or not known for this organisation.
    UnknownLocation { name: Option<String> },
    /// Location resolved but no usable name.
    MissingName,
}

/// Unresolved location names in first-seen order, each listed once.
#[derive(Debug, Default, Clone)]
pub struct FollowUpQueue {
    seen: HashSet<String>,
    names: Vec<String>,
}

impl FollowUpQueue {
    pub fn push(&mut self, name: &str) {
        if self.seen.insert(name.to_string()) {
            self.names.push(name.to_string());
        }
    }

    pub fn into_names(self) -> Vec<String> {
        self.names
    }
}

pub struct Resolver<'a> {
    catalog: &'a dyn Catalog,
    organisation_id: i64,
}

impl<'a> Resolver<'a> {
    pub fn new(catalog: &'a dyn Catalog, organisation_id: i64) -> Self {
        Self {
            catalog,
            organisation_id,
        }
    }

    /// Exact-name match; anything unknown falls back to the sentinel and keeps
    /// the raw text so it can be fixed up by hand.
    pub async fn breed(&self, name: Option<&str>) -> Result<BreedRef> {
        let Some(name) = name else {
            return Ok(BreedRef::unresolved(None));
        };
        Ok(match self.catalog.breed_id_by_name(name).await? {
            Some(id) => BreedRef::resolved(id),
            None => BreedRef::unresolved(Some(name.to_string())),
        })
    }

    /// Several organisations may share a location name; only ours counts.
    pub async fn location(&self, name: &str) -> Result<Option<i64>> {
        Ok(self
            .catalog
            .locations_by_name(name)
            .await?
            .into_iter()
            .find(|location| location.organisation_id == self.organisation_id)
            .map(|location| location.id))
    }

    pub async fn resolve(
        &self,
        listing: NormalizedListing,
        follow_up: &mut FollowUpQueue,
    ) -> Result<Resolution> {
        let Some(location_name) = listing.location_name.clone() else {
            return Ok(Resolution::UnknownLocation { name: None });
        };
        let Some(location_id) = self.location(&location_name).await? else {
            follow_up.push(&location_name);
            return Ok(Resolution::UnknownLocation {
                name: Some(location_name),
            });
        };

        let Some(name) = listing.name.clone() else {
            return Ok(Resolution::MissingName);
        };

        let breed = self.breed(listing.breed_name.as_deref()).await?;

        Ok(Resolution::Resolved(Listing {
            source: listing.source,
            name,
            sex: listing.sex,
            size: listing.size,
            age_group: listing.age_group,
            breed,
            location_id,
            description: listing.description,
            children: listing.children,
            dogs: listing.dogs,
            cats: listing.cats,
            youtube: listing.youtube,
            images: listing.images,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;
    use rehome_core::{Compatibility, UNKNOWN_BREED_ID};

    fn normalized(name: Option<&str>, location: Option<&str>, breed: Option<&str>) -> NormalizedListing {
        NormalizedListing {
            source: "https://x.test/dog/1".into(),
            name: name.map(str::to_string),
            sex: None,
            size: None,
            age_group: None,
            breed_name: breed.map(str::to_string),
            location_name: location.map(str::to_string),
            description: None,
            children: Compatibility::Unknown,
            dogs: Compatibility::Unknown,
            cats: Compatibility::Unknown,
            youtube: None,
            images: vec![],
        }
    }

    fn catalog() -> MemoryCatalog {
        MemoryCatalog::new()
            .with_breed(UNKNOWN_BREED_ID, "Unknown")
            .with_breed(12, "Lurcher")
            .with_location(3, "Leeds", 1)
            .with_location(4, "Leeds", 2)
    }

    #[tokio::test]
    async fn location_is_scoped_to_organisation() {
        let catalog = catalog();
        assert_eq!(Resolver::new(&catalog, 2).location("Leeds").await.unwrap(), Some(4));
        assert_eq!(Resolver::new(&catalog, 1).location("Leeds").await.unwrap(), Some(3));
        assert_eq!(Resolver::new(&catalog, 9).location("Leeds").await.unwrap(), None);
    }

    #[tokio::test]
    async fn unknown_breed_keeps_raw_name() {
        let catalog = catalog();
        let resolver = Resolver::new(&catalog, 2);
        assert_eq!(resolver.breed(Some("Lurcher")).await.unwrap(), BreedRef::resolved(12));
        let unknown = resolver.breed(Some("Space Dog")).await.unwrap();
        assert_eq!(unknown.id, UNKNOWN_BREED_ID);
        assert_eq!(unknown.raw_name.as_deref(), Some("Space Dog"));
        assert_eq!(resolver.breed(None).await.unwrap(), BreedRef::unresolved(None));
    }

    #[tokio::test]
    async fn unresolved_locations_are_queued_once() {
        let catalog = catalog();
        let resolver = Resolver::new(&catalog, 2);
        let mut queue = FollowUpQueue::default();

        for _ in 0..3 {
            let resolution = resolver
                .resolve(normalized(Some("Rex"), Some("Atlantis"), None), &mut queue)
                .await
                .unwrap();
            assert!(matches!(resolution, Resolution::UnknownLocation { .. }));
        }
        resolver
            .resolve(normalized(Some("Rex"), Some("Leeds"), None), &mut queue)
            .await
            .unwrap();

        assert_eq!(queue.into_names(), vec!["Atlantis".to_string()]);
    }

    #[tokio::test]
    async fn nameless_listing_is_dropped() {
        let catalog = catalog();
        let mut queue = FollowUpQueue::default();
        let resolver = Resolver::new(&catalog, 2);

        let resolution = resolver
            .resolve(normalized(None, Some("Leeds"), None), &mut queue)
            .await
            .unwrap();
        assert_eq!(resolution, Resolution::MissingName);

        // An unknown location is still worth following up even without a name.
        resolver
            .resolve(normalized(None, Some("Atlantis"), None), &mut queue)
            .await
            .unwrap();
        assert_eq!(queue.into_names(), vec!["Atlantis".to_string()]);
    }
}
