//! Compile command implementation.

use relgraph_codec::Value;
use relgraph_core::query::{Expression, Ordering, Property, SelectQuery, SqlCompiler};
use relgraph_core::SqlConfig;
use relgraph_schema::Schema;
use serde::Serialize;
use std::path::Path;
use thiserror::Error;

/// Errors in command-line query arguments.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CliError {
    /// A filter has no recognized operator.
    #[error("filter '{0}' has no operator (use =, !=, <, <=, >, >= or ~)")]
    MissingOperator(String),

    /// A filter has an empty path.
    #[error("filter '{0}' has an empty path")]
    EmptyPath(String),
}

/// Arguments of the compile command.
#[derive(Debug, Clone, Default)]
pub struct Request {
    /// Root entity.
    pub entity: String,
    /// Filters, combined with AND.
    pub filters: Vec<String>,
    /// Ordering paths; a leading `-` means descending.
    pub orderings: Vec<String>,
    /// Projected column paths.
    pub columns: Vec<String>,
    /// Project `COUNT(*)`.
    pub count: bool,
    /// Request distinct rows.
    pub distinct: bool,
    /// Fetch limit.
    pub limit: Option<usize>,
    /// Fetch offset.
    pub offset: usize,
    /// Identifier quote character.
    pub quote: Option<char>,
}

/// Compilation result.
#[derive(Debug, Serialize)]
pub struct CompileResult {
    /// SQL text.
    pub sql: String,
    /// Positional parameters.
    pub params: Vec<Value>,
    /// Result column labels.
    pub columns: Vec<String>,
    /// `DISTINCT` was emitted.
    pub distinct: bool,
    /// Distinct rows are enforced in memory.
    pub suppressed_distinct: bool,
}

/// Runs the compile command.
pub fn run(path: &Path, request: &Request, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let schema = Schema::from_json_file(path)?;
    let result = compile(&schema, request)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

/// Builds and compiles the query described by `request`.
pub fn compile(schema: &Schema, request: &Request) -> Result<CompileResult, Box<dyn std::error::Error>> {
    let query = build_query(request)?;
    let mut config = SqlConfig::new();
    if let Some(q) = request.quote {
        config = config.quote_identifiers(true).quote_char(q);
    }
    let compiled = SqlCompiler::new(schema, &config).compile_select(&query)?;
    tracing::debug!(sql = %compiled.sql, "compiled query");

    Ok(CompileResult {
        sql: compiled.sql,
        params: compiled.params,
        columns: compiled.columns.into_iter().map(|c| c.label).collect(),
        distinct: compiled.distinct,
        suppressed_distinct: compiled.suppressed_distinct,
    })
}

/// Turns command-line arguments into a [`SelectQuery`].
pub fn build_query(request: &Request) -> Result<SelectQuery, CliError> {
    let mut query = SelectQuery::new(request.entity.as_str());

    let mut qualifier: Option<Expression> = None;
    for filter in &request.filters {
        let expression = parse_filter(filter)?;
        qualifier = Some(match qualifier {
            Some(q) => q.and(expression),
            None => expression,
        });
    }
    if let Some(q) = qualifier {
        query = query.filter(q);
    }

    for ordering in &request.orderings {
        query = query.order_by(match ordering.strip_prefix('-') {
            Some(path) => Ordering::desc(path),
            None => Ordering::asc(ordering.as_str()),
        });
    }
    for column in &request.columns {
        query = query.column(column.as_str());
    }
    if request.count {
        query = query.count();
    }
    if request.distinct {
        query = query.distinct();
    }
    if let Some(limit) = request.limit {
        query = query.limit(limit);
    }
    if request.offset > 0 {
        query = query.offset(request.offset);
    }
    Ok(query)
}

/// Parses `path<op>value`.
///
/// The leftmost operator wins; at equal positions the longer one does, so
/// `<=` is never read as `<` followed by `=value`.
pub fn parse_filter(filter: &str) -> Result<Expression, CliError> {
    const OPERATORS: [&str; 7] = ["!=", "<=", ">=", "=", "<", ">", "~"];

    let (pos, op) = OPERATORS
        .iter()
        .filter_map(|op| filter.find(op).map(|pos| (pos, *op)))
        .min_by_key(|(pos, op)| (*pos, std::cmp::Reverse(op.len())))
        .ok_or_else(|| CliError::MissingOperator(filter.to_string()))?;

    let path = filter[..pos].trim();
    if path.is_empty() {
        return Err(CliError::EmptyPath(filter.to_string()));
    }
    let raw = filter[pos + op.len()..].trim();
    let property = Property::new(path);

    if op == "~" {
        return Ok(property.like(raw));
    }
    let value = parse_value(raw);
    Ok(match (op, value) {
        ("=", Value::Null) => property.is_null(),
        ("!=", Value::Null) => property.is_not_null(),
        ("=", v) => property.eq(v),
        ("!=", v) => property.ne(v),
        ("<", v) => property.lt(v),
        ("<=", v) => property.le(v),
        (">", v) => property.gt(v),
        (_, v) => property.ge(v),
    })
}

/// Literal value: integer, boolean, `null`, or text.
pub fn parse_value(raw: &str) -> Value {
    if let Ok(i) = raw.parse::<i64>() {
        return Value::Integer(i);
    }
    match raw {
        "null" => Value::Null,
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::Text(raw.trim_matches('\'').to_string()),
    }
}

fn print_text_output(result: &CompileResult) {
    println!("relgraph Query");
    println!("==============");
    println!();
    println!("{}", result.sql);
    if !result.params.is_empty() {
        println!();
        println!("Parameters:");
        for (i, param) in result.params.iter().enumerate() {
            println!("  {:>3}: {param}", i + 1);
        }
    }
    println!();
    println!("Columns: {}", result.columns.join(", "));
    if result.suppressed_distinct {
        println!("DISTINCT suppressed; rows are de-duplicated after fetch");
    }
}
