pub mod config;
pub mod db;
pub mod embeddings;
pub mod error;
pub mod generation;
pub mod models;
pub mod similarity;
pub mod store;
pub mod text;

pub use config::WayfindConfig;
pub use embeddings::{EmbeddingBackend, EmbeddingError, VoyageEmbeddingClient, EMBEDDING_DIMENSIONS};
pub use error::WayfindError;
pub use generation::{GenerationChunk, GenerationError, GenerationProvider, Usage};
pub use models::entity::{EmbeddableEntity, EntityKind};
pub use similarity::cosine_similarity;
pub use store::{EntityStore, MessageStore, PgEntityStore, PgMessageStore, StoreError};
