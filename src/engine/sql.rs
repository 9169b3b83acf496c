//! SQL generation for the SQLite engine.
//!
//! Every statement is parameterized; only identifiers taken from the entity
//! schema and raw fragments supplied by the caller are spliced into the text.

use rusqlite::types::Value as SqlValue;
use serde_json::Value;

use super::error::{EngineError, EngineResult};
use super::options::{Filter, FindOptions, Record};
use crate::protocol::{FindOperator, Scalar};
use crate::schema::{ColumnDef, ColumnType, EntitySchema};

/// Placeholder a raw fragment uses to refer to its column.
pub const RAW_COLUMN_PLACEHOLDER: &str = "{column}";

/// SQL text with its positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

/// What a `SELECT` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Projection {
    Rows,
    Count,
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn column<'a>(entity: &'a EntitySchema, name: &str) -> EngineResult<&'a ColumnDef> {
    entity
        .column(name)
        .ok_or_else(|| EngineError::unknown_column(entity.name, name))
}

fn scalar_param(scalar: &Scalar) -> SqlValue {
    match scalar {
        Scalar::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Scalar::Integer(i) => SqlValue::Integer(*i),
        Scalar::Real(f) => SqlValue::Real(*f),
        Scalar::Text(s) => SqlValue::Text(s.clone()),
    }
}

/// Bind value for an optional scalar (raw query parameters).
pub fn optional_param(scalar: Option<&Scalar>) -> SqlValue {
    scalar.map_or(SqlValue::Null, scalar_param)
}

fn json_list_param(values: &[Scalar]) -> SqlValue {
    let list = Value::Array(values.iter().map(Scalar::to_json).collect());
    SqlValue::Text(list.to_string())
}

/// Convert a written JSON value into the column's storage form.
pub fn column_value(entity: &EntitySchema, def: &ColumnDef, value: &Value) -> EngineResult<SqlValue> {
    let invalid = |reason: &str| EngineError::invalid_value(entity.name, def.name, reason);

    if value.is_null() {
        return Ok(SqlValue::Null);
    }

    match def.ty {
        ColumnType::Json => Ok(SqlValue::Text(value.to_string())),
        ColumnType::Boolean => match value {
            Value::Bool(b) => Ok(SqlValue::Integer(i64::from(*b))),
            Value::Number(n) if n.as_i64() == Some(0) || n.as_i64() == Some(1) => {
                Ok(SqlValue::Integer(n.as_i64().unwrap_or_default()))
            }
            _ => Err(invalid("expected a boolean")),
        },
        ColumnType::Integer => value
            .as_i64()
            .map(SqlValue::Integer)
            .ok_or_else(|| invalid("expected an integer")),
        ColumnType::Real => value
            .as_f64()
            .map(SqlValue::Real)
            .ok_or_else(|| invalid("expected a number")),
        ColumnType::Text => value
            .as_str()
            .map(|s| SqlValue::Text(s.to_string()))
            .ok_or_else(|| invalid("expected a string")),
    }
}

// ============================================================================
// Conditions
// ============================================================================

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn compare(col: &str, symbol: &str, value: &Scalar, params: &mut Vec<SqlValue>) -> String {
    params.push(scalar_param(value));
    format!("{} {} ?", col, symbol)
}

fn condition(
    entity: &EntitySchema,
    def: &ColumnDef,
    op: &FindOperator,
    params: &mut Vec<SqlValue>,
) -> EngineResult<String> {
    let col = quote_ident(def.name);

    let sql = match op {
        FindOperator::Equal(v) => compare(&col, "=", v, params),
        FindOperator::LessThan(v) => compare(&col, "<", v, params),
        FindOperator::LessThanOrEqual(v) => compare(&col, "<=", v, params),
        FindOperator::MoreThan(v) => compare(&col, ">", v, params),
        FindOperator::MoreThanOrEqual(v) => compare(&col, ">=", v, params),
        FindOperator::Like(pattern) => {
            params.push(SqlValue::Text(pattern.clone()));
            format!("{} LIKE ?", col)
        }
        FindOperator::IsNull => format!("{} IS NULL", col),
        FindOperator::Between(low, high) => {
            params.push(scalar_param(low));
            params.push(scalar_param(high));
            format!("{} BETWEEN ? AND ?", col)
        }
        FindOperator::In(values) | FindOperator::Any(values) => {
            if values.is_empty() {
                "0 = 1".to_string()
            } else {
                params.extend(values.iter().map(scalar_param));
                format!("{} IN ({})", col, placeholders(values.len()))
            }
        }
        FindOperator::Not(inner) => format!("NOT ({})", condition(entity, def, inner, params)?),
        FindOperator::ArrayContains(values) => {
            require_json(entity, def, op)?;
            params.push(json_list_param(values));
            format!(
                "NOT EXISTS (SELECT 1 FROM json_each(?) AS p WHERE p.value NOT IN (SELECT value FROM json_each({})))",
                col
            )
        }
        FindOperator::ArrayContainedBy(values) => {
            require_json(entity, def, op)?;
            params.push(json_list_param(values));
            format!(
                "{} IS NOT NULL AND NOT EXISTS (SELECT 1 FROM json_each({}) AS e WHERE e.value NOT IN (SELECT value FROM json_each(?)))",
                col, col
            )
        }
        FindOperator::ArrayOverlap(values) => {
            require_json(entity, def, op)?;
            params.push(json_list_param(values));
            format!(
                "EXISTS (SELECT 1 FROM json_each({}) AS e WHERE e.value IN (SELECT value FROM json_each(?)))",
                col
            )
        }
        FindOperator::Raw(fragment) => {
            if fragment.contains(RAW_COLUMN_PLACEHOLDER) {
                fragment.replace(RAW_COLUMN_PLACEHOLDER, &col)
            } else {
                format!("{} = {}", col, fragment)
            }
        }
    };

    Ok(sql)
}

fn require_json(entity: &EntitySchema, def: &ColumnDef, op: &FindOperator) -> EngineResult<()> {
    if def.ty == ColumnType::Json {
        Ok(())
    } else {
        Err(EngineError::invalid_value(
            entity.name,
            def.name,
            format!("`{}` needs a JSON array column", op.kind()),
        ))
    }
}

/// Render a filter, or `None` when it matches everything.
pub fn where_clause(
    entity: &EntitySchema,
    filter: &Filter,
    params: &mut Vec<SqlValue>,
) -> EngineResult<Option<String>> {
    if filter.is_empty() {
        return Ok(None);
    }

    let mut alternatives = Vec::with_capacity(filter.groups.len());
    for group in &filter.groups {
        let mut parts = Vec::new();
        for (name, op) in group.iter() {
            let def = column(entity, name)?;
            parts.push(condition(entity, def, op, params)?);
        }
        alternatives.push(match parts.len() {
            0 => "1 = 1".to_string(),
            _ => parts.join(" AND "),
        });
    }

    Ok(Some(if alternatives.len() == 1 {
        alternatives.remove(0)
    } else {
        alternatives
            .iter()
            .map(|a| format!("({})", a))
            .collect::<Vec<_>>()
            .join(" OR ")
    }))
}

// ============================================================================
// Statements
// ============================================================================

/// Columns a query returns, validated against the schema.
pub fn selected_columns<'a>(
    entity: &'a EntitySchema,
    options: &FindOptions,
) -> EngineResult<Vec<&'a ColumnDef>> {
    match &options.select {
        Some(names) if !names.is_empty() => names.iter().map(|n| column(entity, n)).collect(),
        _ => Ok(entity.columns.iter().collect()),
    }
}

pub fn select(
    entity: &EntitySchema,
    options: &FindOptions,
    projection: Projection,
) -> EngineResult<Statement> {
    let mut params = Vec::new();
    let table = quote_ident(entity.table);

    let mut sql = match projection {
        Projection::Count => format!("SELECT COUNT(*) FROM {}", table),
        Projection::Rows => {
            let columns = selected_columns(entity, options)?
                .iter()
                .map(|c| quote_ident(c.name))
                .collect::<Vec<_>>()
                .join(", ");
            format!("SELECT {} FROM {}", columns, table)
        }
    };

    if let Some(clause) = where_clause(entity, &options.filter, &mut params)? {
        sql.push_str(" WHERE ");
        sql.push_str(&clause);
    }

    if projection == Projection::Rows {
        if !options.order.is_empty() {
            let order = options
                .order
                .iter()
                .map(|(name, dir)| Ok(format!("{} {}", quote_ident(column(entity, name)?.name), dir.as_sql())))
                .collect::<EngineResult<Vec<_>>>()?;
            sql.push_str(" ORDER BY ");
            sql.push_str(&order.join(", "));
        }

        match (options.take, options.skip) {
            (Some(take), Some(skip)) => sql.push_str(&format!(" LIMIT {} OFFSET {}", take, skip)),
            (Some(take), None) => sql.push_str(&format!(" LIMIT {}", take)),
            (None, Some(skip)) => sql.push_str(&format!(" LIMIT -1 OFFSET {}", skip)),
            (None, None) => {}
        }
    }

    Ok(Statement { sql, params })
}

/// Select one row by primary key, all columns.
pub fn select_by_key(entity: &EntitySchema, key: SqlValue) -> Statement {
    let columns = entity
        .column_names()
        .map(quote_ident)
        .collect::<Vec<_>>()
        .join(", ");
    Statement {
        sql: format!(
            "SELECT {} FROM {} WHERE {} = ?",
            columns,
            quote_ident(entity.table),
            quote_ident(entity.primary_key)
        ),
        params: vec![key],
    }
}

/// Insert or update on primary-key conflict.
pub fn upsert(entity: &EntitySchema, record: &Record) -> EngineResult<Statement> {
    let table = quote_ident(entity.table);
    if record.is_empty() {
        return Ok(Statement {
            sql: format!("INSERT INTO {} DEFAULT VALUES", table),
            params: Vec::new(),
        });
    }

    let mut names = Vec::with_capacity(record.len());
    let mut params = Vec::with_capacity(record.len());
    for (name, value) in record {
        let def = column(entity, name)?;
        names.push(quote_ident(def.name));
        params.push(column_value(entity, def, value)?);
    }

    let updates = record
        .keys()
        .filter(|name| name.as_str() != entity.primary_key)
        .map(|name| {
            let col = quote_ident(name);
            format!("{} = excluded.{}", col, col)
        })
        .collect::<Vec<_>>();

    let conflict = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };

    Ok(Statement {
        sql: format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) {}",
            table,
            names.join(", "),
            placeholders(names.len()),
            quote_ident(entity.primary_key),
            conflict
        ),
        params,
    })
}

pub fn update(entity: &EntitySchema, filter: &Filter, set: &Record) -> EngineResult<Statement> {
    let mut params = Vec::new();
    let mut assignments = Vec::with_capacity(set.len());
    for (name, value) in set {
        let def = column(entity, name)?;
        assignments.push(format!("{} = ?", quote_ident(def.name)));
        params.push(column_value(entity, def, value)?);
    }

    let mut sql = format!(
        "UPDATE {} SET {}",
        quote_ident(entity.table),
        assignments.join(", ")
    );
    if let Some(clause) = where_clause(entity, filter, &mut params)? {
        sql.push_str(" WHERE ");
        sql.push_str(&clause);
    }
    Ok(Statement { sql, params })
}

/// Update the non-key columns of `record` on the row with the given key.
///
/// Used by `save` for rows that already exist, so a partial entity does not
/// trip `NOT NULL` checks the way an `INSERT ... ON CONFLICT` would.
pub fn update_by_key(
    entity: &EntitySchema,
    key: SqlValue,
    record: &Record,
) -> EngineResult<Option<Statement>> {
    let mut params = Vec::new();
    let mut assignments = Vec::new();
    for (name, value) in record {
        if name == entity.primary_key {
            continue;
        }
        let def = column(entity, name)?;
        assignments.push(format!("{} = ?", quote_ident(def.name)));
        params.push(column_value(entity, def, value)?);
    }
    if assignments.is_empty() {
        return Ok(None);
    }

    params.push(key);
    Ok(Some(Statement {
        sql: format!(
            "UPDATE {} SET {} WHERE {} = ?",
            quote_ident(entity.table),
            assignments.join(", "),
            quote_ident(entity.primary_key)
        ),
        params,
    }))
}

pub fn delete(entity: &EntitySchema, filter: &Filter) -> EngineResult<Statement> {
    let mut params = Vec::new();
    let mut sql = format!("DELETE FROM {}", quote_ident(entity.table));
    if let Some(clause) = where_clause(entity, filter, &mut params)? {
        sql.push_str(" WHERE ");
        sql.push_str(&clause);
    }
    Ok(Statement { sql, params })
}

// ============================================================================
// DDL
// ============================================================================

fn column_ddl(entity: &EntitySchema, def: &ColumnDef, for_alter: bool) -> String {
    let mut ddl = format!("{} {}", quote_ident(def.name), def.ty.sql_type());
    if def.name == entity.primary_key {
        ddl.push_str(" PRIMARY KEY");
    }
    // ALTER TABLE ADD COLUMN only accepts constant defaults, and NOT NULL
    // only alongside one.
    let default = def
        .default
        .filter(|d| !for_alter || !d.starts_with('('));
    if !def.nullable && (!for_alter || default.is_some()) {
        ddl.push_str(" NOT NULL");
    }
    if let Some(default) = default {
        ddl.push_str(" DEFAULT ");
        ddl.push_str(default);
    }
    ddl
}

pub fn create_table(entity: &EntitySchema) -> String {
    let columns = entity
        .columns
        .iter()
        .map(|def| column_ddl(entity, def, false))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote_ident(entity.table),
        columns
    )
}

pub fn add_column(entity: &EntitySchema, def: &ColumnDef) -> String {
    format!(
        "ALTER TABLE {} ADD COLUMN {}",
        quote_ident(entity.table),
        column_ddl(entity, def, true)
    )
}
