//! Pure input validation, run before any backend access.

use crate::error::{GraphError, GraphResult};

use super::{Entity, GraphBatch, ObservationAddition, ObservationDeletion, Relation};

pub const MAX_NAME_LENGTH: usize = 256;
pub const MAX_TYPE_LENGTH: usize = 128;
pub const MAX_OBSERVATION_LENGTH: usize = 4096;

fn check_label(value: &str, field: &str, max: usize) -> GraphResult<()> {
    if value.trim().is_empty() {
        return Err(GraphError::validation(field, "cannot be empty"));
    }
    if value.len() > max {
        return Err(GraphError::validation(
            field,
            format!("too long ({} bytes, max {max})", value.len()),
        ));
    }
    if value.chars().any(char::is_control) {
        return Err(GraphError::validation(field, "contains control characters"));
    }
    Ok(())
}

/// Entity names and relation endpoints.
pub fn validate_name(name: &str, field: &str) -> GraphResult<()> {
    check_label(name, field, MAX_NAME_LENGTH)
}

/// Entity and relation type labels.
pub fn validate_type(label: &str, field: &str) -> GraphResult<()> {
    check_label(label, field, MAX_TYPE_LENGTH)
}

pub fn validate_observation(text: &str) -> GraphResult<()> {
    if text.len() > MAX_OBSERVATION_LENGTH {
        return Err(GraphError::validation(
            "observation",
            format!("too long ({} bytes, max {MAX_OBSERVATION_LENGTH})", text.len()),
        ));
    }
    if text.contains('\0') {
        return Err(GraphError::validation("observation", "contains NUL bytes"));
    }
    Ok(())
}

pub fn validate_entity(entity: &Entity) -> GraphResult<()> {
    validate_name(&entity.name, "entity name")?;
    validate_type(&entity.entity_type, "entity type")?;
    entity
        .observations
        .iter()
        .try_for_each(|obs| validate_observation(obs))
}

pub fn validate_relation(relation: &Relation) -> GraphResult<()> {
    validate_name(&relation.from, "relation from")?;
    validate_name(&relation.to, "relation to")?;
    validate_type(&relation.relation_type, "relation type")
}

pub fn validate_addition(addition: &ObservationAddition) -> GraphResult<()> {
    validate_name(&addition.entity_name, "entity name")?;
    addition
        .contents
        .iter()
        .try_for_each(|obs| validate_observation(obs))
}

pub fn validate_deletion(deletion: &ObservationDeletion) -> GraphResult<()> {
    validate_name(&deletion.entity_name, "entity name")
}

/// Search queries must contain something other than whitespace.
pub fn validate_query(query: &str) -> GraphResult<()> {
    if query.trim().is_empty() {
        return Err(GraphError::validation("query", "search query cannot be empty"));
    }
    Ok(())
}

pub fn validate_names<S: AsRef<str>>(names: &[S]) -> GraphResult<()> {
    names
        .iter()
        .try_for_each(|name| validate_name(name.as_ref(), "entity name"))
}

/// Validate every part of a batch; the first failure rejects the whole batch.
pub fn validate_batch(batch: &GraphBatch) -> GraphResult<()> {
    batch.entities.iter().try_for_each(validate_entity)?;
    batch.relations.iter().try_for_each(validate_relation)?;
    batch.observations.iter().try_for_each(validate_addition)?;
    batch.deletions.iter().try_for_each(validate_deletion)
}
