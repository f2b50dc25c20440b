//! Embeddable travel entities.
//!
//! Four concrete entity types carry an optional pgvector embedding column.
//! `EntityKind` is a closed enum so both the text builder and the entity
//! loader dispatch exhaustively; an unrecognized kind string can only appear
//! at the job-parsing boundary.

use pgvector::Vector;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The closed set of entity kinds that can carry embeddings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Amenity,
    Category,
    Destination,
    Resort,
}

impl EntityKind {
    /// Parse a wire-level kind string. `None` marks a poison job.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "amenity" => Some(Self::Amenity),
            "category" => Some(Self::Category),
            "destination" => Some(Self::Destination),
            "resort" => Some(Self::Resort),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Amenity => "amenity",
            Self::Category => "category",
            Self::Destination => "destination",
            Self::Resort => "resort",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Destination {
    pub id: Uuid,
    pub name: String,
    pub country: String,
    pub region: Option<String>,
    pub description: Option<String>,
    pub activities: Vec<String>,
    pub embedding: Option<Vector>,
}

#[derive(Debug, Clone)]
pub struct Resort {
    pub id: Uuid,
    pub name: String,
    /// Human-readable containing location, e.g. "Cancun, Mexico".
    pub location: Option<String>,
    pub star_rating: Option<i16>,
    pub room_count: Option<i32>,
    pub amenities: Vec<String>,
    pub description: Option<String>,
    pub embedding: Option<Vector>,
}

#[derive(Debug, Clone)]
pub struct Category {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub embedding: Option<Vector>,
}

#[derive(Debug, Clone)]
pub struct Amenity {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub embedding: Option<Vector>,
}

/// Tagged union over the four entity kinds.
#[derive(Debug, Clone)]
pub enum EmbeddableEntity {
    Amenity(Amenity),
    Category(Category),
    Destination(Destination),
    Resort(Resort),
}

impl EmbeddableEntity {
    pub fn id(&self) -> Uuid {
        match self {
            Self::Amenity(a) => a.id,
            Self::Category(c) => c.id,
            Self::Destination(d) => d.id,
            Self::Resort(r) => r.id,
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Amenity(_) => EntityKind::Amenity,
            Self::Category(_) => EntityKind::Category,
            Self::Destination(_) => EntityKind::Destination,
            Self::Resort(_) => EntityKind::Resort,
        }
    }

    /// A non-empty embedding means the entity is already indexed.
    pub fn has_embedding(&self) -> bool {
        let embedding = match self {
            Self::Amenity(a) => &a.embedding,
            Self::Category(c) => &c.embedding,
            Self::Destination(d) => &d.embedding,
            Self::Resort(r) => &r.embedding,
        };
        embedding
            .as_ref()
            .map(|v| !v.as_slice().is_empty())
            .unwrap_or(false)
    }
}
