//! Canonical text synthesis for embedding input.
//!
//! `canonical_text` is a pure function of an entity's current attribute
//! values: unchanged attributes always yield a byte-identical string, which
//! is what makes the embedding worker's skip check safe. The numeric-to-label
//! mappings below are part of the contract — changing them silently changes
//! every embedding on the next forced re-embed.

use crate::models::entity::{Amenity, Category, Destination, EmbeddableEntity, Resort};

/// Qualitative label for a resort star rating. Ratings outside 1..=5 are
/// clamped rather than rejected; the label only feeds embedding text.
pub fn star_rating_label(rating: i16) -> &'static str {
    match rating {
        i16::MIN..=1 => "budget-friendly accommodation",
        2 => "value-oriented hotel",
        3 => "comfortable mid-scale resort",
        4 => "upscale luxury resort",
        _ => "ultra-luxury resort",
    }
}

/// Size descriptor derived from room count buckets.
pub fn room_count_label(rooms: i32) -> &'static str {
    match rooms {
        i32::MIN..=49 => "intimate boutique property",
        50..=199 => "mid-sized resort",
        200..=499 => "large resort complex",
        _ => "sprawling mega-resort",
    }
}

impl EmbeddableEntity {
    /// Deterministic descriptive string used as embedding input.
    ///
    /// Assembles an ordered list of clauses per kind and joins the non-empty
    /// ones with `". "`. An entity with no usable attributes yields an empty
    /// string, which the worker treats as nothing-to-embed.
    pub fn canonical_text(&self) -> String {
        let clauses = match self {
            Self::Amenity(a) => amenity_clauses(a),
            Self::Category(c) => category_clauses(c),
            Self::Destination(d) => destination_clauses(d),
            Self::Resort(r) => resort_clauses(r),
        };
        join_clauses(clauses)
    }
}

fn join_clauses(clauses: Vec<String>) -> String {
    clauses
        .into_iter()
        .filter(|c| !c.trim().is_empty())
        .collect::<Vec<_>>()
        .join(". ")
}

fn destination_clauses(d: &Destination) -> Vec<String> {
    let mut clauses = vec![d.name.clone(), format!("Country: {}", d.country)];
    if let Some(region) = &d.region {
        clauses.push(format!("Region: {region}"));
    }
    if let Some(description) = &d.description {
        clauses.push(description.clone());
    }
    if !d.activities.is_empty() {
        clauses.push(format!("Activities: {}", d.activities.join(", ")));
    }
    clauses
}

fn resort_clauses(r: &Resort) -> Vec<String> {
    let mut clauses = vec![r.name.clone()];
    if let Some(rating) = r.star_rating {
        clauses.push(star_rating_label(rating).to_string());
    }
    if let Some(rooms) = r.room_count {
        clauses.push(room_count_label(rooms).to_string());
    }
    if let Some(location) = &r.location {
        clauses.push(format!("Located in {location}"));
    }
    if !r.amenities.is_empty() {
        clauses.push(format!("Amenities: {}", r.amenities.join(", ")));
    }
    if let Some(description) = &r.description {
        clauses.push(description.clone());
    }
    clauses
}

fn category_clauses(c: &Category) -> Vec<String> {
    let mut clauses = vec![c.name.clone()];
    if let Some(description) = &c.description {
        clauses.push(description.clone());
    }
    clauses
}

fn amenity_clauses(a: &Amenity) -> Vec<String> {
    let mut clauses = vec![a.name.clone()];
    if let Some(description) = &a.description {
        clauses.push(description.clone());
    }
    clauses
}
