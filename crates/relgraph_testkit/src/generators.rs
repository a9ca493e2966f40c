//! Property-based test generators using proptest.
//!
//! Provides strategies for values, field edits, to-many membership
//! operations and query paths over the gallery schema.

use proptest::prelude::*;
use relgraph_codec::Value;

/// Strategy for generating artist names.
pub fn name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[A-Z][a-z]{1,12}").expect("Invalid regex")
}

/// Strategy for generating scalar values of every non-binary kind.
pub fn scalar_value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Integer),
        "[a-zA-Z0-9 ]{0,16}".prop_map(Value::Text),
    ]
}

/// One attribute write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldEdit {
    /// Attribute name.
    pub attribute: &'static str,
    /// Written value.
    pub value: Value,
}

/// Strategy for sequences of artist attribute writes.
///
/// Values come from a tiny alphabet so that sequences often write a value
/// back to what it was.
pub fn field_edits_strategy(max_len: usize) -> impl Strategy<Value = Vec<FieldEdit>> {
    let edit = (
        prop::sample::select(vec!["name", "bio"]),
        prop::sample::select(vec!["a", "b", "c"]),
    )
        .prop_map(|(attribute, text)| FieldEdit {
            attribute,
            value: Value::from(text),
        });
    prop::collection::vec(edit, 0..=max_len)
}

/// One to-many membership operation on a painting id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipOp {
    /// Add the painting.
    Add(i64),
    /// Remove the painting.
    Remove(i64),
}

impl MembershipOp {
    /// Painting id the operation touches.
    pub fn painting(self) -> i64 {
        match self {
            Self::Add(id) | Self::Remove(id) => id,
        }
    }
}

/// Strategy for sequences of membership operations over paintings
/// `1..=paintings`.
pub fn membership_ops_strategy(paintings: i64, max_len: usize) -> impl Strategy<Value = Vec<MembershipOp>> {
    let op = (any::<bool>(), 1..=paintings).prop_map(|(add, id)| {
        if add {
            MembershipOp::Add(id)
        } else {
            MembershipOp::Remove(id)
        }
    });
    prop::collection::vec(op, 0..=max_len)
}

/// Strategy for attribute paths rooted at `Painting`.
pub fn painting_path_strategy() -> impl Strategy<Value = &'static str> {
    prop::sample::select(vec![
        "title",
        "artist.name",
        "artist.mentor.name",
        "artist.paintings.title",
        "gallery.name",
        "gallery.exhibits.number",
        "artist+.name",
    ])
}

/// Case counts for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Few cases, for properties that drive a whole context per case.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 48,
            max_shrink_iters: 200,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::strategy::ValueTree;
    use proptest::test_runner::TestRunner;

    #[test]
    fn test_name_strategy() {
        let mut runner = TestRunner::default();
        let name = name_strategy().new_tree(&mut runner).unwrap().current();
        assert!(name.chars().next().unwrap().is_ascii_uppercase());
    }

    #[test]
    fn test_membership_ops_stay_in_range() {
        let mut runner = TestRunner::default();
        for _ in 0..20 {
            let ops = membership_ops_strategy(3, 10).new_tree(&mut runner).unwrap().current();
            assert!(ops.iter().all(|op| (1..=3).contains(&op.painting())));
        }
    }
}
