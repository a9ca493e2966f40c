//! Dependency ordering of entities along foreign keys.

use crate::entity::Relationship;
use crate::error::{SchemaError, SchemaResult};
use crate::schema::Schema;
use std::collections::BTreeSet;

/// Orders `count` nodes so that for every edge `(before, after)` the first
/// node precedes the second. Ties are broken by node index.
///
/// Returns the nodes left on cycles as the error.
pub fn topological_order(count: usize, edges: &[(usize, usize)]) -> Result<Vec<usize>, Vec<usize>> {
    let mut incoming = vec![0usize; count];
    let mut outgoing: Vec<Vec<usize>> = vec![Vec::new(); count];
    for &(before, after) in edges {
        if before == after {
            continue;
        }
        incoming[after] += 1;
        outgoing[before].push(after);
    }

    let mut ready: BTreeSet<usize> = (0..count).filter(|&n| incoming[n] == 0).collect();
    let mut order = Vec::with_capacity(count);
    while let Some(node) = ready.pop_first() {
        order.push(node);
        for &next in &outgoing[node] {
            incoming[next] -= 1;
            if incoming[next] == 0 {
                ready.insert(next);
            }
        }
    }

    if order.len() == count {
        Ok(order)
    } else {
        Err((0..count).filter(|&n| incoming[n] > 0).collect())
    }
}

/// Sorts entities so that parents (referenced tables) come before children
/// (tables holding the foreign key).
///
/// Reflexive relationships are ignored at this level; rows of a
/// self-referencing entity are ordered object by object by the caller.
#[derive(Debug, Clone, Copy)]
pub struct EntitySorter<'a> {
    schema: &'a Schema,
    allow_cycles: bool,
}

impl<'a> EntitySorter<'a> {
    /// Creates a sorter that fails on cycles.
    #[must_use]
    pub fn new(schema: &'a Schema) -> Self {
        Self {
            schema,
            allow_cycles: false,
        }
    }

    /// When set, cycles are broken in declaration order instead of failing.
    /// Use with stores that check constraints at commit time.
    #[must_use]
    pub const fn allow_cycles(mut self, allow: bool) -> Self {
        self.allow_cycles = allow;
        self
    }

    /// Orders `entities` parents first.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::UnknownEntity`] for an undeclared name and
    /// [`SchemaError::CyclicDependency`] when no order exists and cycles are
    /// not allowed.
    pub fn sort_for_insert<'n>(&self, entities: impl IntoIterator<Item = &'n str>) -> SchemaResult<Vec<String>> {
        let mut nodes: Vec<&str> = Vec::new();
        for name in entities {
            self.schema.entity(name)?;
            if !nodes.contains(&name) {
                nodes.push(name);
            }
        }
        nodes.sort_by_key(|n| self.schema.position(n));

        let mut edges = Vec::new();
        for (child, name) in nodes.iter().enumerate() {
            let entity = self.schema.entity(name)?;
            for rel in entity.foreign_key_relationships() {
                if rel.is_reflexive() {
                    continue;
                }
                if let Some(parent) = nodes.iter().position(|n| *n == rel.target) {
                    edges.push((parent, child));
                }
            }
        }

        let order = match topological_order(nodes.len(), &edges) {
            Ok(order) => order,
            Err(cycle) if self.allow_cycles => {
                tracing::warn!(
                    entities = ?cycle.iter().map(|&i| nodes[i]).collect::<Vec<_>>(),
                    "breaking foreign key cycle"
                );
                let mut remaining: Vec<(usize, usize)> = edges
                    .iter()
                    .copied()
                    .filter(|(a, b)| !(cycle.contains(a) && cycle.contains(b)))
                    .collect();
                remaining.sort_unstable();
                topological_order(nodes.len(), &remaining)
                    .map_err(|c| cyclic(&nodes, &c))?
            }
            Err(cycle) => return Err(cyclic(&nodes, &cycle)),
        };

        let sorted: Vec<String> = order.into_iter().map(|i| nodes[i].to_string()).collect();
        tracing::debug!(order = ?sorted, "sorted entities");
        Ok(sorted)
    }

    /// Orders `entities` children first.
    ///
    /// # Errors
    ///
    /// Same as [`Self::sort_for_insert`].
    pub fn sort_for_delete<'n>(&self, entities: impl IntoIterator<Item = &'n str>) -> SchemaResult<Vec<String>> {
        let mut order = self.sort_for_insert(entities)?;
        order.reverse();
        Ok(order)
    }

    /// Self-referencing to-one relationships of an entity that hold a
    /// foreign key.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::UnknownEntity`] for an undeclared name.
    pub fn reflexive_relationships(&self, entity: &str) -> SchemaResult<Vec<&'a Relationship>> {
        let e = self.schema.entity(entity)?;
        Ok(e.foreign_key_relationships().filter(|r| r.is_reflexive()).collect())
    }
}

fn cyclic(nodes: &[&str], cycle: &[usize]) -> SchemaError {
    SchemaError::CyclicDependency {
        entities: cycle.iter().map(|&i| nodes[i].to_string()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Attribute, Entity};
    use crate::types::ColumnType;
    use proptest::prelude::*;

    fn pk(name: &str, table: &str) -> Entity {
        Entity::new(name, table).attribute(Attribute::new("id", "ID", ColumnType::BigInt).primary_key())
    }

    fn gallery_schema() -> Schema {
        Schema::builder()
            .entity(pk("Exhibit", "EXHIBIT").relationship(Relationship::to_one("gallery", "Gallery").join("GALLERY_ID", "ID")))
            .entity(
                pk("Painting", "PAINTING")
                    .relationship(Relationship::to_one("artist", "Artist").join("ARTIST_ID", "ID"))
                    .relationship(Relationship::to_one("gallery", "Gallery").join("GALLERY_ID", "ID")),
            )
            .entity(pk("Gallery", "GALLERY"))
            .entity(pk("Artist", "ARTIST").relationship(Relationship::to_one("mentor", "Artist").join("MENTOR_ID", "ID")))
            .build()
            .unwrap()
    }

    #[test]
    fn parents_first() {
        let schema = gallery_schema();
        let order = EntitySorter::new(&schema)
            .sort_for_insert(["Exhibit", "Painting", "Gallery", "Artist"])
            .unwrap();
        let pos = |n: &str| order.iter().position(|o| o == n).unwrap();
        assert!(pos("Gallery") < pos("Exhibit"));
        assert!(pos("Gallery") < pos("Painting"));
        assert!(pos("Artist") < pos("Painting"));
    }

    #[test]
    fn children_first_for_delete() {
        let schema = gallery_schema();
        let order = EntitySorter::new(&schema)
            .sort_for_delete(["Gallery", "Painting"])
            .unwrap();
        assert_eq!(order, vec!["Painting", "Gallery"]);
    }

    #[test]
    fn reflexive_is_not_a_cycle() {
        let schema = gallery_schema();
        let sorter = EntitySorter::new(&schema);
        assert_eq!(sorter.sort_for_insert(["Artist"]).unwrap(), vec!["Artist"]);
        let reflexive = sorter.reflexive_relationships("Artist").unwrap();
        assert_eq!(reflexive.len(), 1);
        assert_eq!(reflexive[0].name, "mentor");
    }

    #[test]
    fn cycle_fails_unless_allowed() {
        let schema = Schema::builder()
            .entity(pk("A", "A").relationship(Relationship::to_one("b", "B").join("B_ID", "ID")))
            .entity(pk("B", "B").relationship(Relationship::to_one("a", "A").join("A_ID", "ID")))
            .build()
            .unwrap();
        let err = EntitySorter::new(&schema).sort_for_insert(["A", "B"]).unwrap_err();
        assert!(matches!(err, SchemaError::CyclicDependency { ref entities } if entities.len() == 2));

        let order = EntitySorter::new(&schema)
            .allow_cycles(true)
            .sort_for_insert(["A", "B"])
            .unwrap();
        assert_eq!(order, vec!["A", "B"]);
    }

    #[test]
    fn unknown_entity() {
        let schema = gallery_schema();
        assert!(matches!(
            EntitySorter::new(&schema).sort_for_insert(["Nope"]),
            Err(SchemaError::UnknownEntity { .. })
        ));
    }

    proptest! {
        #[test]
        fn order_respects_every_edge(
            count in 1usize..12,
            raw in prop::collection::vec((0usize..12, 0usize..12), 0..30)
        ) {
            // Only forward edges, so the graph is acyclic.
            let edges: Vec<(usize, usize)> = raw
                .into_iter()
                .map(|(a, b)| (a % count, b % count))
                .filter(|(a, b)| a < b)
                .collect();
            let order = topological_order(count, &edges).unwrap();
            prop_assert_eq!(order.len(), count);
            for (a, b) in edges {
                let pa = order.iter().position(|&n| n == a).unwrap();
                let pb = order.iter().position(|&n| n == b).unwrap();
                prop_assert!(pa < pb);
            }
        }
    }
}
