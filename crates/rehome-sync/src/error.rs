use thiserror::Error;

/// Fatal conditions raised by the reconciler itself. Collaborator failures
/// arrive as `anyhow` errors with stage context attached.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("snapshot contains no listings; refusing to reconcile an empty catalog view")]
    EmptySnapshot,
    #[error("creating dog for {source_url} returned no id")]
    DogNotCreated { source_url: String },
    #[error("updating dog {dog_id} for {source_url} affected no rows")]
    DogNotUpdated { dog_id: i64, source_url: String },
    #[error("creating image record for {source_url} returned no id")]
    ImageNotCreated { source_url: String },
    #[error("organisation config {path}: {message}")]
    InvalidOrganisation { path: String, message: String },
}
