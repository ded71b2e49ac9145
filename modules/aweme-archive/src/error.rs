/// Result type alias for archive operations.
pub type Result<T> = std::result::Result<T, ArchiveError>;

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// A payload did not match the shape the decoder expects.
    #[error("schema drift in {entity} {id}: {field}: {detail}")]
    SchemaDrift {
        entity: &'static str,
        id: u64,
        field: String,
        detail: String,
    },

    /// Timeline and page views of the same post disagree.
    #[error("post {id}: {field} differs between sources (timeline={timeline}, page={page})")]
    Inconsistent {
        id: u64,
        field: String,
        timeline: String,
        page: String,
    },

    #[error("{entity} {id}: {field} went backwards ({previous} -> {current})")]
    Monotonicity {
        entity: &'static str,
        id: u64,
        field: String,
        previous: String,
        current: String,
    },

    #[error("{entity} {id}: {field} is blank")]
    BlankValue {
        entity: &'static str,
        id: u64,
        field: String,
    },

    #[error("cannot plan media for post {id}: {detail}")]
    MediaPlan { id: u64, detail: String },

    #[error("download of {url} failed: {detail}")]
    Download { url: String, detail: String },

    #[error("Fetch failed: {0}")]
    Fetch(#[from] aweme_client::FetchError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ArchiveError {
    pub(crate) fn drift(
        entity: &'static str,
        id: u64,
        field: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        ArchiveError::SchemaDrift {
            entity,
            id,
            field: field.into(),
            detail: detail.into(),
        }
    }
}
