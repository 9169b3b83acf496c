//! SQLite implementation of [`Engine`].

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::{Number, Value};

use super::error::{EngineError, EngineResult};
use super::options::{DeleteInput, FindOptions, SaveInput, UpdateInput};
use super::sql::{self, Projection, Statement};
use super::{Engine, RawResult, Row};
use crate::protocol::Scalar;
use crate::schema::{ColumnDef, ColumnType, EntitySchema};

/// Embedded SQLite database shared by all dispatcher tasks.
#[derive(Clone)]
pub struct SqliteEngine {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteEngine {
    /// Open or create a database file.
    pub fn open<P: AsRef<Path>>(path: P, busy_timeout: Duration) -> EngineResult<Self> {
        let path = path.as_ref();

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!(path = %path.display(), journal_mode = %mode, "opened database");
        Self::configure(conn)
    }

    /// Open a private in-memory database (for testing).
    pub fn open_in_memory() -> EngineResult<Self> {
        Self::configure(Connection::open_in_memory()?)
    }

    fn configure(conn: Connection) -> EngineResult<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection on the blocking pool.
    pub async fn with_connection<T, F>(&self, f: F) -> EngineResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> EngineResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            // A panic in an earlier call leaves the lock poisoned; any open
            // transaction was rolled back when it unwound.
            let mut guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut guard)
        })
        .await?
    }
}

// ============================================================================
// Row decoding
// ============================================================================

fn plain_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Number(i.into()),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Array(b.iter().map(|byte| Value::from(*byte)).collect()),
    }
}

fn typed_value(def: &ColumnDef, value: ValueRef<'_>) -> Value {
    match (def.ty, value) {
        (ColumnType::Boolean, ValueRef::Integer(i)) => Value::Bool(i != 0),
        (ColumnType::Json, ValueRef::Text(t)) => serde_json::from_slice(t)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(t).into_owned())),
        (_, v) => plain_value(v),
    }
}

fn read_rows(
    conn: &Connection,
    stmt: &Statement,
    columns: &[&ColumnDef],
) -> EngineResult<Vec<Row>> {
    let mut prepared = conn.prepare(&stmt.sql)?;
    let rows = prepared
        .query_map(params_from_iter(stmt.params.iter()), |row| {
            let mut out = Row::new();
            for (i, def) in columns.iter().enumerate() {
                out.insert(def.name.to_string(), typed_value(def, row.get_ref(i)?));
            }
            Ok(out)
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn find_rows(conn: &Connection, entity: &EntitySchema, options: &FindOptions) -> EngineResult<Vec<Row>> {
    let stmt = sql::select(entity, options, Projection::Rows)?;
    let columns = sql::selected_columns(entity, options)?;
    tracing::trace!(sql = %stmt.sql, "find");
    read_rows(conn, &stmt, &columns)
}

fn save_rows(conn: &mut Connection, entity: &EntitySchema, input: SaveInput) -> EngineResult<Vec<Row>> {
    let pk = entity
        .primary_column()
        .ok_or_else(|| EngineError::unknown_column(entity.name, entity.primary_key))?;
    let all_columns: Vec<&ColumnDef> = entity.columns.iter().collect();

    let tx = conn.transaction()?;
    let mut saved = Vec::with_capacity(input.records.len());

    for mut record in input.records {
        let has_key = record.get(pk.name).is_some_and(|v| !v.is_null());
        if !has_key && pk.ty == ColumnType::Text {
            record.insert(
                pk.name.to_string(),
                Value::String(uuid::Uuid::new_v4().to_string()),
            );
        } else if !has_key {
            record.remove(pk.name);
        }

        let existing = match record.get(pk.name) {
            Some(value) => {
                let key = sql::column_value(entity, pk, value)?;
                let lookup = sql::select_by_key(entity, key.clone());
                let found = tx
                    .query_row(&lookup.sql, params_from_iter(lookup.params.iter()), |_| Ok(()))
                    .optional()?
                    .is_some();
                found.then_some(key)
            }
            None => None,
        };

        let key = match existing {
            Some(key) => {
                if let Some(stmt) = sql::update_by_key(entity, key.clone(), &record)? {
                    tx.execute(&stmt.sql, params_from_iter(stmt.params.iter()))?;
                }
                key
            }
            None => {
                let stmt = sql::upsert(entity, &record)?;
                tx.execute(&stmt.sql, params_from_iter(stmt.params.iter()))?;
                match record.get(pk.name) {
                    Some(value) => sql::column_value(entity, pk, value)?,
                    None => SqlValue::Integer(tx.last_insert_rowid()),
                }
            }
        };

        let lookup = sql::select_by_key(entity, key);
        saved.extend(read_rows(&tx, &lookup, &all_columns)?);
    }

    tx.commit()?;
    Ok(saved)
}

fn raw_rows(conn: &Connection, text: &str, params: &[Option<Scalar>]) -> EngineResult<RawResult> {
    let mut prepared = conn.prepare(text)?;
    let binds: Vec<SqlValue> = params.iter().map(|p| sql::optional_param(p.as_ref())).collect();

    if prepared.column_count() == 0 {
        let affected = prepared.execute(params_from_iter(binds.iter()))?;
        return Ok(RawResult::Affected(affected as u64));
    }

    let names: Vec<String> = prepared
        .column_names()
        .into_iter()
        .map(str::to_string)
        .collect();
    let rows = prepared
        .query_map(params_from_iter(binds.iter()), |row| {
            let mut out = Row::new();
            for (i, name) in names.iter().enumerate() {
                out.insert(name.clone(), plain_value(row.get_ref(i)?));
            }
            Ok(out)
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(RawResult::Rows(rows))
}

#[async_trait]
impl Engine for SqliteEngine {
    async fn find(&self, entity: &'static EntitySchema, options: FindOptions) -> EngineResult<Vec<Row>> {
        self.with_connection(move |conn| find_rows(conn, entity, &options))
            .await
    }

    async fn find_one(
        &self,
        entity: &'static EntitySchema,
        mut options: FindOptions,
    ) -> EngineResult<Option<Row>> {
        options.take = Some(1);
        let rows = self.find(entity, options).await?;
        Ok(rows.into_iter().next())
    }

    async fn count(&self, entity: &'static EntitySchema, options: FindOptions) -> EngineResult<u64> {
        self.with_connection(move |conn| {
            let stmt = sql::select(entity, &options, Projection::Count)?;
            let n: i64 =
                conn.query_row(&stmt.sql, params_from_iter(stmt.params.iter()), |row| row.get(0))?;
            Ok(n.max(0) as u64)
        })
        .await
    }

    async fn save(&self, entity: &'static EntitySchema, input: SaveInput) -> EngineResult<Vec<Row>> {
        self.with_connection(move |conn| save_rows(conn, entity, input))
            .await
    }

    async fn update(&self, entity: &'static EntitySchema, input: UpdateInput) -> EngineResult<u64> {
        self.with_connection(move |conn| {
            let stmt = sql::update(entity, &input.filter, &input.set)?;
            let affected = conn.execute(&stmt.sql, params_from_iter(stmt.params.iter()))?;
            Ok(affected as u64)
        })
        .await
    }

    async fn delete(&self, entity: &'static EntitySchema, input: DeleteInput) -> EngineResult<u64> {
        self.with_connection(move |conn| {
            let stmt = sql::delete(entity, &input.filter)?;
            let affected = conn.execute(&stmt.sql, params_from_iter(stmt.params.iter()))?;
            Ok(affected as u64)
        })
        .await
    }

    async fn raw_query(&self, sql: String, params: Vec<Option<Scalar>>) -> EngineResult<RawResult> {
        self.with_connection(move |conn| raw_rows(conn, &sql, &params))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::bootstrap::sync_schema;
    use crate::engine::options::{Criteria, Filter};
    use crate::protocol::{Descriptor, FindOperator};
    use crate::schema::{Registry, SESSION, SETTING};
    use serde_json::json;

    async fn engine() -> SqliteEngine {
        let engine = SqliteEngine::open_in_memory().unwrap();
        engine
            .with_connection(|conn| sync_schema(conn, &Registry::default()))
            .await
            .unwrap();
        engine
    }

    fn save_input(value: Value) -> SaveInput {
        SaveInput::from_descriptor(&Descriptor::deserialize(&value).unwrap()).unwrap()
    }

    fn options(value: Value) -> FindOptions {
        FindOptions::from_descriptor(&Descriptor::deserialize(&value).unwrap()).unwrap()
    }

    async fn seed(engine: &SqliteEngine) {
        engine
            .save(
                &SESSION,
                save_input(json!([
                    {"id": "s1", "title": "first", "status": "started", "tags": ["rust", "db"], "createdAt": 1},
                    {"id": "s2", "title": "second", "status": "done", "tags": ["go"], "createdAt": 2},
                    {"id": "s3", "title": "third", "status": "failed", "archived": true, "createdAt": 3}
                ])),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_save_returns_stored_row() {
        let engine = engine().await;
        let saved = engine
            .save(&SESSION, save_input(json!({"title": "new", "status": "started"})))
            .await
            .unwrap();

        assert_eq!(saved.len(), 1);
        let row = &saved[0];
        assert!(row["id"].as_str().is_some_and(|id| !id.is_empty()));
        assert_eq!(row["archived"], json!(false));
        assert!(row["createdAt"].as_i64().is_some());
        assert_eq!(row["tags"], Value::Null);
    }

    #[tokio::test]
    async fn test_save_upserts() {
        let engine = engine().await;
        seed(&engine).await;
        engine
            .save(&SESSION, save_input(json!({"id": "s1", "title": "renamed"})))
            .await
            .unwrap();

        let row = engine
            .find_one(&SESSION, options(json!({"where": {"id": "s1"}})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row["title"], json!("renamed"));
        assert_eq!(row["status"], json!("started"));
        assert_eq!(engine.count(&SESSION, FindOptions::default()).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_find_with_operators() {
        let engine = engine().await;
        seed(&engine).await;

        let rows = engine
            .find(
                &SESSION,
                options(json!({
                    "where": {"status": {"$operator": "in", "value": ["started", "done"]}},
                    "order": {"createdAt": "ASC"}
                })),
            )
            .await
            .unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r["id"].clone()).collect();
        assert_eq!(ids, vec![json!("s1"), json!("s2")]);
        assert_eq!(rows[0]["tags"], json!(["rust", "db"]));

        let archived = engine
            .count(&SESSION, options(json!({"where": {"archived": true}})))
            .await
            .unwrap();
        assert_eq!(archived, 1);

        let ranged = engine
            .count(
                &SESSION,
                options(json!({"where": {"createdAt": {"$operator": "between", "value": [2, 3]}}})),
            )
            .await
            .unwrap();
        assert_eq!(ranged, 2);
    }

    #[tokio::test]
    async fn test_array_operators() {
        let engine = engine().await;
        seed(&engine).await;

        let with_tags = |op: FindOperator| FindOptions {
            filter: Filter {
                groups: vec![Criteria([("tags".to_string(), op)].into_iter().collect())],
            },
            ..Default::default()
        };

        let contains = engine
            .count(&SESSION, with_tags(FindOperator::array_contains(["rust", "db"])))
            .await
            .unwrap();
        assert_eq!(contains, 1);

        let contained = engine
            .count(&SESSION, with_tags(FindOperator::array_contained_by(["go", "rust"])))
            .await
            .unwrap();
        assert_eq!(contained, 1);

        let overlap = engine
            .count(&SESSION, with_tags(FindOperator::array_overlap(["db", "go"])))
            .await
            .unwrap();
        assert_eq!(overlap, 2);
    }

    #[tokio::test]
    async fn test_update_and_delete_counts() {
        let engine = engine().await;
        seed(&engine).await;

        let update = UpdateInput::from_descriptor(
            &Descriptor::deserialize(&json!({
                "where": {"status": {"$operator": "not", "value": "done"}},
                "set": {"archived": true}
            }))
            .unwrap(),
        )
        .unwrap();
        assert_eq!(engine.update(&SESSION, update).await.unwrap(), 2);

        let delete = DeleteInput::from_descriptor(
            &Descriptor::deserialize(&json!({"where": {"archived": true}})).unwrap(),
        )
        .unwrap();
        assert_eq!(engine.delete(&SESSION, delete).await.unwrap(), 2);
        assert_eq!(engine.count(&SESSION, FindOptions::default()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_json_setting_round_trip() {
        let engine = engine().await;
        engine
            .save(&SETTING, save_input(json!({"key": "editor", "value": {"fontSize": 14}})))
            .await
            .unwrap();
        let row = engine
            .find_one(&SETTING, options(json!({"where": {"key": "editor"}})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row["value"], json!({"fontSize": 14}));
    }

    #[tokio::test]
    async fn test_panicking_call_does_not_poison_later_calls() {
        let engine = engine().await;
        seed(&engine).await;

        let err = engine
            .with_connection(|conn| -> EngineResult<()> {
                let tx = conn.transaction()?;
                tx.execute("DELETE FROM sessions", [])?;
                panic!("boom");
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Task(_)));

        // The delete was rolled back and the connection is usable again
        assert_eq!(engine.count(&SESSION, FindOptions::default()).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_raw_query() {
        let engine = engine().await;
        seed(&engine).await;

        let result = engine
            .raw_query(
                "SELECT id, status FROM sessions WHERE createdAt > ? ORDER BY id".to_string(),
                vec![Some(Scalar::Integer(1))],
            )
            .await
            .unwrap();
        assert_eq!(
            result.into_json(),
            json!([{"id": "s2", "status": "done"}, {"id": "s3", "status": "failed"}])
        );

        let result = engine
            .raw_query("DELETE FROM sessions WHERE id = ?".to_string(), vec![Some("s1".into())])
            .await
            .unwrap();
        assert_eq!(result, RawResult::Affected(1));

        let err = engine
            .raw_query("SELECT nope FROM nowhere".to_string(), vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Sqlite(_)));
    }
}
