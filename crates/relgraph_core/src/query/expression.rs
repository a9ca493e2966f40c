//! Qualifier expressions over property paths.

use crate::object::EntityRef;
use relgraph_codec::{Identity, Value};
use std::ops::Not;

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    /// `=`
    Eq,
    /// `<>`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

impl CompareOp {
    /// SQL operator text.
    #[must_use]
    pub const fn sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "<>",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }
}

/// Right-hand side of a comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    /// A scalar literal.
    Value(Value),
    /// A tracked object, compared by its primary key.
    Object(EntityRef),
    /// An object identity, compared by its primary key.
    Identity(Identity),
}

impl From<Value> for Operand {
    fn from(v: Value) -> Self {
        Self::Value(v)
    }
}

impl From<&str> for Operand {
    fn from(v: &str) -> Self {
        Self::Value(v.into())
    }
}

impl From<String> for Operand {
    fn from(v: String) -> Self {
        Self::Value(v.into())
    }
}

impl From<i64> for Operand {
    fn from(v: i64) -> Self {
        Self::Value(v.into())
    }
}

impl From<i32> for Operand {
    fn from(v: i32) -> Self {
        Self::Value(v.into())
    }
}

impl From<bool> for Operand {
    fn from(v: bool) -> Self {
        Self::Value(v.into())
    }
}

impl From<EntityRef> for Operand {
    fn from(v: EntityRef) -> Self {
        Self::Object(v)
    }
}

impl From<&EntityRef> for Operand {
    fn from(v: &EntityRef) -> Self {
        Self::Object(v.clone())
    }
}

impl From<Identity> for Operand {
    fn from(v: Identity) -> Self {
        Self::Identity(v)
    }
}

/// A qualifier tree.
///
/// Paths are dot-separated property names starting at the query root.
/// A component suffixed with `+` is traversed with an outer join, and a
/// component prefixed with `db:` names a column directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expression {
    /// `path <op> operand`
    Compare {
        /// Property path.
        path: String,
        /// Operator.
        op: CompareOp,
        /// Right-hand side.
        operand: Operand,
    },
    /// `path IN (operands)`
    In {
        /// Property path.
        path: String,
        /// Candidate values.
        operands: Vec<Operand>,
    },
    /// `path LIKE pattern`
    Like {
        /// Property path.
        path: String,
        /// Pattern with `%` and `_` wildcards.
        pattern: String,
        /// Compare upper-cased.
        case_insensitive: bool,
        /// Escape character for wildcards.
        escape: Option<char>,
    },
    /// Conjunction.
    And(Vec<Expression>),
    /// Disjunction.
    Or(Vec<Expression>),
    /// Negation.
    Not(Box<Expression>),
}

impl Expression {
    /// Conjunction with another expression.
    #[must_use]
    pub fn and(self, other: Expression) -> Self {
        match self {
            Self::And(mut list) => {
                list.push(other);
                Self::And(list)
            }
            first => Self::And(vec![first, other]),
        }
    }

    /// Disjunction with another expression.
    #[must_use]
    pub fn or(self, other: Expression) -> Self {
        match self {
            Self::Or(mut list) => {
                list.push(other);
                Self::Or(list)
            }
            first => Self::Or(vec![first, other]),
        }
    }

    /// Sets the escape character of a `LIKE` expression. Other expressions
    /// are returned unchanged.
    #[must_use]
    pub fn escape(self, c: char) -> Self {
        match self {
            Self::Like {
                path,
                pattern,
                case_insensitive,
                ..
            } => Self::Like {
                path,
                pattern,
                case_insensitive,
                escape: Some(c),
            },
            other => other,
        }
    }
}

impl Not for Expression {
    type Output = Expression;

    fn not(self) -> Expression {
        Expression::Not(Box::new(self))
    }
}

/// Builder for expressions on one path.
///
/// ```rust
/// use relgraph_core::query::Property;
///
/// let qualifier = Property::new("paintings.title")
///     .like("Water%")
///     .and(Property::new("name").ne("Manet"));
/// ```
#[derive(Debug, Clone)]
pub struct Property {
    path: String,
}

impl Property {
    /// Creates a builder for `path`.
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    /// Creates a builder for a column of the root entity.
    pub fn db(column: impl AsRef<str>) -> Self {
        Self {
            path: format!("db:{}", column.as_ref()),
        }
    }

    /// The path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    fn compare(self, op: CompareOp, operand: impl Into<Operand>) -> Expression {
        Expression::Compare {
            path: self.path,
            op,
            operand: operand.into(),
        }
    }

    /// `path = value`; a null value compiles to `IS NULL`.
    #[must_use]
    pub fn eq(self, operand: impl Into<Operand>) -> Expression {
        self.compare(CompareOp::Eq, operand)
    }

    /// `path <> value`; a null value compiles to `IS NOT NULL`.
    #[must_use]
    pub fn ne(self, operand: impl Into<Operand>) -> Expression {
        self.compare(CompareOp::Ne, operand)
    }

    /// `path < value`
    #[must_use]
    pub fn lt(self, operand: impl Into<Operand>) -> Expression {
        self.compare(CompareOp::Lt, operand)
    }

    /// `path <= value`
    #[must_use]
    pub fn le(self, operand: impl Into<Operand>) -> Expression {
        self.compare(CompareOp::Le, operand)
    }

    /// `path > value`
    #[must_use]
    pub fn gt(self, operand: impl Into<Operand>) -> Expression {
        self.compare(CompareOp::Gt, operand)
    }

    /// `path >= value`
    #[must_use]
    pub fn ge(self, operand: impl Into<Operand>) -> Expression {
        self.compare(CompareOp::Ge, operand)
    }

    /// `path IS NULL`
    #[must_use]
    pub fn is_null(self) -> Expression {
        self.compare(CompareOp::Eq, Value::Null)
    }

    /// `path IS NOT NULL`
    #[must_use]
    pub fn is_not_null(self) -> Expression {
        self.compare(CompareOp::Ne, Value::Null)
    }

    /// `path IN (...)`
    #[must_use]
    pub fn in_list<I, T>(self, operands: I) -> Expression
    where
        I: IntoIterator<Item = T>,
        T: Into<Operand>,
    {
        Expression::In {
            path: self.path,
            operands: operands.into_iter().map(Into::into).collect(),
        }
    }

    /// `path LIKE pattern`
    #[must_use]
    pub fn like(self, pattern: impl Into<String>) -> Expression {
        Expression::Like {
            path: self.path,
            pattern: pattern.into(),
            case_insensitive: false,
            escape: None,
        }
    }

    /// Case-insensitive `LIKE`.
    #[must_use]
    pub fn like_ignore_case(self, pattern: impl Into<String>) -> Expression {
        Expression::Like {
            path: self.path,
            pattern: pattern.into(),
            case_insensitive: true,
            escape: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn and_flattens() {
        let e = Property::new("a")
            .eq(1)
            .and(Property::new("b").eq(2))
            .and(Property::new("c").eq(3));
        match e {
            Expression::And(list) => assert_eq!(list.len(), 3),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn null_helpers() {
        assert_eq!(
            Property::new("name").is_null(),
            Expression::Compare {
                path: "name".into(),
                op: CompareOp::Eq,
                operand: Operand::Value(Value::Null),
            }
        );
    }

    #[test]
    fn negation_and_escape() {
        let e = !Property::new("name").like("A!%%").escape('!');
        let Expression::Not(inner) = e else {
            panic!("expected NOT");
        };
        assert!(matches!(*inner, Expression::Like { escape: Some('!'), .. }));
    }

    #[test]
    fn db_path() {
        assert_eq!(Property::db("ARTIST_ID").path(), "db:ARTIST_ID");
    }
}
