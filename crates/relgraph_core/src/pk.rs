//! Primary key generation for new objects.

use crate::error::{CoreError, CoreResult};
use parking_lot::Mutex;
use relgraph_codec::Value;
use relgraph_schema::Entity;
use std::collections::HashMap;

/// Source of primary key values for NEW objects that were not given one.
pub trait PkGenerator: Send + Sync {
    /// Returns the next key for `entity`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::MissingPrimaryKey`] when the entity's key cannot
    /// be generated.
    fn next_key(&self, entity: &Entity) -> CoreResult<Value>;

    /// Returns the key `next_key` would hand out after `ahead` further
    /// calls, without reserving anything.
    ///
    /// # Errors
    ///
    /// Same as [`Self::next_key`].
    fn peek_key(&self, entity: &Entity, ahead: usize) -> CoreResult<Value>;
}

#[derive(Debug, Clone, Copy)]
struct Block {
    next: i64,
    end: i64,
}

/// In-memory per-entity sequence that hands keys out in cached blocks.
///
/// Each refill reserves `cache_size` keys, the way an `AUTO_PK_SUPPORT`
/// table hands out ranges.
#[derive(Debug)]
pub struct SequencePkGenerator {
    start: i64,
    cache_size: i64,
    blocks: Mutex<HashMap<String, Block>>,
}

impl SequencePkGenerator {
    /// Creates a generator whose first key is `start`.
    #[must_use]
    pub fn new(start: i64, cache_size: i64) -> Self {
        Self {
            start,
            cache_size: cache_size.max(1),
            blocks: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for SequencePkGenerator {
    fn default() -> Self {
        Self::new(200, 20)
    }
}

/// Fails unless the entity has a single integral key column.
fn check_generated(entity: &Entity) -> CoreResult<()> {
    let pk: Vec<_> = entity.primary_key().collect();
    let [attribute] = pk.as_slice() else {
        return Err(CoreError::MissingPrimaryKey {
            entity: entity.name.clone(),
            message: format!("composite key ({} columns) must be set explicitly", pk.len()),
        });
    };
    if !attribute.column_type.is_integral() {
        return Err(CoreError::MissingPrimaryKey {
            entity: entity.name.clone(),
            message: format!("{} key '{}' must be set explicitly", attribute.column_type, attribute.name),
        });
    }
    Ok(())
}

impl PkGenerator for SequencePkGenerator {
    fn next_key(&self, entity: &Entity) -> CoreResult<Value> {
        check_generated(entity)?;
        let mut blocks = self.blocks.lock();
        let block = blocks.entry(entity.name.clone()).or_insert(Block {
            next: self.start,
            end: self.start,
        });
        if block.next >= block.end {
            block.end = block.next + self.cache_size;
            tracing::debug!(entity = %entity.name, from = block.next, to = block.end, "reserved key block");
        }
        let key = block.next;
        block.next += 1;
        Ok(Value::Integer(key))
    }

    fn peek_key(&self, entity: &Entity, ahead: usize) -> CoreResult<Value> {
        check_generated(entity)?;
        let next = self.blocks.lock().get(&entity.name).map_or(self.start, |b| b.next);
        let ahead = i64::try_from(ahead).unwrap_or(i64::MAX);
        Ok(Value::Integer(next.saturating_add(ahead)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relgraph_schema::{Attribute, ColumnType};

    fn entity(name: &str) -> Entity {
        Entity::new(name, name.to_uppercase())
            .attribute(Attribute::new("id", "ID", ColumnType::Integer).primary_key())
    }

    #[test]
    fn sequence_starts_at_200() {
        let generator = SequencePkGenerator::default();
        let artist = entity("Artist");
        assert_eq!(generator.next_key(&artist).unwrap(), Value::Integer(200));
        assert_eq!(generator.next_key(&artist).unwrap(), Value::Integer(201));
    }

    #[test]
    fn sequences_are_per_entity() {
        let generator = SequencePkGenerator::new(1, 2);
        let artist = entity("Artist");
        let painting = entity("Painting");
        assert_eq!(generator.next_key(&artist).unwrap(), Value::Integer(1));
        assert_eq!(generator.next_key(&painting).unwrap(), Value::Integer(1));
        assert_eq!(generator.next_key(&artist).unwrap(), Value::Integer(2));
        // Crosses a block boundary.
        assert_eq!(generator.next_key(&artist).unwrap(), Value::Integer(3));
    }

    #[test]
    fn peeking_reserves_nothing() {
        let generator = SequencePkGenerator::new(1, 2);
        let artist = entity("Artist");
        assert_eq!(generator.peek_key(&artist, 0).unwrap(), Value::Integer(1));
        assert_eq!(generator.peek_key(&artist, 3).unwrap(), Value::Integer(4));
        assert_eq!(generator.next_key(&artist).unwrap(), Value::Integer(1));
        assert_eq!(generator.peek_key(&artist, 0).unwrap(), Value::Integer(2));
        assert_eq!(generator.next_key(&artist).unwrap(), Value::Integer(2));
    }

    #[test]
    fn composite_key_is_refused() {
        let generator = SequencePkGenerator::default();
        let link = Entity::new("Link", "LINK")
            .attribute(Attribute::new("a", "A", ColumnType::Integer).primary_key())
            .attribute(Attribute::new("b", "B", ColumnType::Integer).primary_key());
        assert!(matches!(
            generator.next_key(&link),
            Err(CoreError::MissingPrimaryKey { .. })
        ));
    }

    #[test]
    fn text_key_is_refused() {
        let generator = SequencePkGenerator::default();
        let code = Entity::new("Code", "CODE")
            .attribute(Attribute::new("code", "CODE", ColumnType::VarChar).primary_key());
        assert!(generator.next_key(&code).is_err());
    }
}
