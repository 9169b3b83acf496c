//! Typed interpretation of decoded descriptors.
//!
//! The dispatcher runs these conversions before touching the engine, so a
//! descriptor with the wrong shape fails as `MalformedDescriptor` without any
//! engine call. Column names are not checked here; the SQL builder does that
//! against the entity schema.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::{BridgeError, BridgeResult};
use crate::protocol::{Descriptor, FindOperator, Scalar};

fn malformed(msg: impl Into<String>) -> BridgeError {
    BridgeError::MalformedDescriptor(msg.into())
}

/// Conditions on columns, all of which must hold.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Criteria(pub BTreeMap<String, FindOperator>);

impl Criteria {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FindOperator)> {
        self.0.iter()
    }

    fn from_map(map: &BTreeMap<String, Descriptor>) -> BridgeResult<Self> {
        let mut conditions = BTreeMap::new();
        for (column, value) in map {
            let op = match value {
                Descriptor::Null => FindOperator::IsNull,
                Descriptor::Scalar(s) => FindOperator::Equal(s.clone()),
                Descriptor::Operator(op) => op.clone(),
                Descriptor::List(_) | Descriptor::Map(_) => {
                    return Err(malformed(format!(
                        "nested conditions on `{}` are not supported",
                        column
                    )))
                }
            };
            conditions.insert(column.clone(), op);
        }
        Ok(Self(conditions))
    }
}

/// A `where` clause: any group may match. No groups means no filter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub groups: Vec<Criteria>,
}

impl Filter {
    pub fn is_empty(&self) -> bool {
        self.groups.iter().all(Criteria::is_empty)
    }

    /// Whether some row can match without meeting any condition: no groups,
    /// or an empty alternative among them.
    pub fn matches_everything(&self) -> bool {
        self.groups.is_empty() || self.groups.iter().any(Criteria::is_empty)
    }

    /// Parse a `where` value: a map (AND) or a list of maps (OR of ANDs).
    pub fn from_descriptor(where_: &Descriptor) -> BridgeResult<Self> {
        let groups = match where_ {
            Descriptor::Null => Vec::new(),
            Descriptor::Map(map) => vec![Criteria::from_map(map)?],
            Descriptor::List(items) => items
                .iter()
                .map(|item| match item {
                    Descriptor::Map(map) => Criteria::from_map(map),
                    _ => Err(malformed("each `where` alternative must be a map")),
                })
                .collect::<BridgeResult<_>>()?,
            _ => return Err(malformed("`where` must be a map or a list of maps")),
        };
        Ok(Self { groups })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDir {
    Asc,
    Desc,
}

impl SortDir {
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }

    fn from_descriptor(column: &str, value: &Descriptor) -> BridgeResult<Self> {
        match value {
            Descriptor::Scalar(Scalar::Text(s)) if s.eq_ignore_ascii_case("asc") => Ok(Self::Asc),
            Descriptor::Scalar(Scalar::Text(s)) if s.eq_ignore_ascii_case("desc") => Ok(Self::Desc),
            Descriptor::Scalar(Scalar::Integer(1)) => Ok(Self::Asc),
            Descriptor::Scalar(Scalar::Integer(-1)) => Ok(Self::Desc),
            _ => Err(malformed(format!(
                "order for `{}` must be \"ASC\" or \"DESC\"",
                column
            ))),
        }
    }
}

/// Options accepted by `find`, `findOne` and `count`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    pub filter: Filter,
    /// Columns to return; all columns when `None`.
    pub select: Option<Vec<String>>,
    pub order: Vec<(String, SortDir)>,
    pub skip: Option<u64>,
    pub take: Option<u64>,
}

impl FindOptions {
    const KEYS: [&'static str; 5] = ["where", "select", "order", "skip", "take"];

    /// Parse find options.
    ///
    /// `order` may be a map (`{"createdAt": "DESC"}`, applied in key order) or a
    /// list of `[column, direction]` pairs when the order of columns matters.
    pub fn from_descriptor(descriptor: &Descriptor) -> BridgeResult<Self> {
        let map = match descriptor {
            Descriptor::Null => return Ok(Self::default()),
            Descriptor::Map(map) => map,
            _ => return Err(malformed("find options must be a map")),
        };

        if let Some(unknown) = map.keys().find(|k| !Self::KEYS.contains(&k.as_str())) {
            return Err(malformed(format!("unsupported find option `{}`", unknown)));
        }

        let filter = match map.get("where") {
            Some(w) => Filter::from_descriptor(w)?,
            None => Filter::default(),
        };

        let select = match map.get("select") {
            None | Some(Descriptor::Null) => None,
            Some(Descriptor::List(items)) => Some(
                items
                    .iter()
                    .map(|item| match item {
                        Descriptor::Scalar(Scalar::Text(s)) => Ok(s.clone()),
                        _ => Err(malformed("`select` must list column names")),
                    })
                    .collect::<BridgeResult<_>>()?,
            ),
            Some(_) => return Err(malformed("`select` must be a list")),
        };

        let order = match map.get("order") {
            None | Some(Descriptor::Null) => Vec::new(),
            Some(Descriptor::Map(entries)) => entries
                .iter()
                .map(|(column, dir)| Ok((column.clone(), SortDir::from_descriptor(column, dir)?)))
                .collect::<BridgeResult<_>>()?,
            Some(Descriptor::List(pairs)) => pairs
                .iter()
                .map(|pair| match pair {
                    Descriptor::List(p) => match p.as_slice() {
                        [Descriptor::Scalar(Scalar::Text(column)), dir] => {
                            Ok((column.clone(), SortDir::from_descriptor(column, dir)?))
                        }
                        _ => Err(malformed("`order` pairs must be [column, direction]")),
                    },
                    _ => Err(malformed("`order` pairs must be [column, direction]")),
                })
                .collect::<BridgeResult<_>>()?,
            Some(_) => return Err(malformed("`order` must be a map or a list of pairs")),
        };

        Ok(Self {
            filter,
            select,
            order,
            skip: count_option(map, "skip")?,
            take: count_option(map, "take")?,
        })
    }
}

fn count_option(map: &BTreeMap<String, Descriptor>, key: &str) -> BridgeResult<Option<u64>> {
    match map.get(key) {
        None | Some(Descriptor::Null) => Ok(None),
        Some(Descriptor::Scalar(Scalar::Integer(n))) if *n >= 0 => Ok(Some(*n as u64)),
        Some(_) => Err(malformed(format!("`{}` must be a non-negative integer", key))),
    }
}

/// Column values of one entity being written.
pub type Record = BTreeMap<String, Value>;

/// Input of `save`: one entity or a list of them.
#[derive(Debug, Clone, PartialEq)]
pub struct SaveInput {
    pub records: Vec<Record>,
    /// Whether the caller passed a list (the result mirrors the input).
    pub many: bool,
}

impl SaveInput {
    pub fn from_descriptor(descriptor: &Descriptor) -> BridgeResult<Self> {
        match descriptor {
            Descriptor::Map(map) => Ok(Self {
                records: vec![record(map)?],
                many: false,
            }),
            Descriptor::List(items) => {
                let records = items
                    .iter()
                    .map(|item| match item {
                        Descriptor::Map(map) => record(map),
                        _ => Err(malformed("save expects entity maps")),
                    })
                    .collect::<BridgeResult<_>>()?;
                Ok(Self {
                    records,
                    many: true,
                })
            }
            _ => Err(malformed("save expects an entity map or a list of them")),
        }
    }
}

/// Input of `update`: `{ "where": ..., "set": {...} }`.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateInput {
    pub filter: Filter,
    pub set: Record,
}

impl UpdateInput {
    pub fn from_descriptor(descriptor: &Descriptor) -> BridgeResult<Self> {
        let filter = required_filter(descriptor, "update")?;
        let set = match descriptor.get("set") {
            Some(Descriptor::Map(map)) if !map.is_empty() => record(map)?,
            _ => return Err(malformed("update requires a non-empty `set` map")),
        };
        Ok(Self { filter, set })
    }
}

/// Input of `delete`: `{ "where": ... }`.
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteInput {
    pub filter: Filter,
}

impl DeleteInput {
    pub fn from_descriptor(descriptor: &Descriptor) -> BridgeResult<Self> {
        Ok(Self {
            filter: required_filter(descriptor, "delete")?,
        })
    }
}

/// Bulk writes refuse to run unless every alternative constrains the rows.
fn required_filter(descriptor: &Descriptor, operation: &str) -> BridgeResult<Filter> {
    let filter = match descriptor.get("where") {
        Some(w) => Filter::from_descriptor(w)?,
        None => Filter::default(),
    };
    if filter.matches_everything() {
        return Err(malformed(format!(
            "{} requires non-empty `where` criteria in every alternative",
            operation
        )));
    }
    Ok(filter)
}

fn record(map: &BTreeMap<String, Descriptor>) -> BridgeResult<Record> {
    map.iter()
        .map(|(column, value)| Ok((column.clone(), plain_value(column, value)?)))
        .collect()
}

/// Written values are plain data; operators only make sense in criteria.
fn plain_value(column: &str, value: &Descriptor) -> BridgeResult<Value> {
    match value {
        Descriptor::Operator(op) => Err(malformed(format!(
            "operator `{}` is not a value for column `{}`",
            op.kind(),
            column
        ))),
        Descriptor::List(items) => Ok(Value::Array(
            items
                .iter()
                .map(|item| plain_value(column, item))
                .collect::<BridgeResult<_>>()?,
        )),
        Descriptor::Map(map) => Ok(Value::Object(
            map.iter()
                .map(|(k, v)| Ok((k.clone(), plain_value(column, v)?)))
                .collect::<BridgeResult<_>>()?,
        )),
        other => Ok(other.serialize()),
    }
}

/// Raw query arguments: positional parameters as scalars or null.
pub fn raw_params(params: &[Value]) -> BridgeResult<Vec<Option<Scalar>>> {
    params
        .iter()
        .map(|p| match p {
            Value::Null => Ok(None),
            other => Scalar::from_json(other)
                .map(Some)
                .ok_or_else(|| malformed("raw query parameters must be scalars or null")),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: Value) -> BridgeResult<FindOptions> {
        FindOptions::from_descriptor(&Descriptor::deserialize(&value).unwrap())
    }

    #[test]
    fn test_find_options_full() {
        let options = parse(json!({
            "where": {"status": {"$operator": "in", "value": ["started", "done"]}, "title": null},
            "select": ["id", "title"],
            "order": {"createdAt": "desc"},
            "skip": 5,
            "take": 10
        }))
        .unwrap();

        assert_eq!(options.filter.groups.len(), 1);
        let group = &options.filter.groups[0];
        assert_eq!(
            group.0.get("status"),
            Some(&FindOperator::is_in(["started", "done"]))
        );
        assert_eq!(group.0.get("title"), Some(&FindOperator::IsNull));
        assert_eq!(options.select, Some(vec!["id".to_string(), "title".to_string()]));
        assert_eq!(options.order, vec![("createdAt".to_string(), SortDir::Desc)]);
        assert_eq!(options.skip, Some(5));
        assert_eq!(options.take, Some(10));
    }

    #[test]
    fn test_null_options_are_default() {
        assert_eq!(parse(json!(null)).unwrap(), FindOptions::default());
    }

    #[test]
    fn test_where_list_is_or() {
        let options = parse(json!({"where": [{"status": "a"}, {"status": "b"}]})).unwrap();
        assert_eq!(options.filter.groups.len(), 2);
    }

    #[test]
    fn test_order_pairs_keep_sequence() {
        let options = parse(json!({"order": [["title", "ASC"], ["createdAt", -1]]})).unwrap();
        assert_eq!(
            options.order,
            vec![
                ("title".to_string(), SortDir::Asc),
                ("createdAt".to_string(), SortDir::Desc)
            ]
        );
    }

    #[test]
    fn test_rejects_bad_shapes() {
        for bad in [
            json!({"where": 5}),
            json!({"where": {"session": {"id": 1}}}),
            json!({"take": -1}),
            json!({"order": {"title": "sideways"}}),
            json!({"relations": ["messages"]}),
            json!([1, 2]),
        ] {
            assert!(
                matches!(parse(bad.clone()), Err(BridgeError::MalformedDescriptor(_))),
                "accepted {}",
                bad
            );
        }
    }

    #[test]
    fn test_save_input_mirrors_shape() {
        let one = Descriptor::deserialize(&json!({"id": "s1", "tags": ["a"]})).unwrap();
        let input = SaveInput::from_descriptor(&one).unwrap();
        assert!(!input.many);
        assert_eq!(input.records[0].get("tags"), Some(&json!(["a"])));

        let many = Descriptor::deserialize(&json!([{"id": "s1"}, {"id": "s2"}])).unwrap();
        let input = SaveInput::from_descriptor(&many).unwrap();
        assert!(input.many);
        assert_eq!(input.records.len(), 2);
    }

    #[test]
    fn test_save_rejects_operator_values() {
        let descriptor = Descriptor::map([("status", FindOperator::equal("x"))]);
        assert!(matches!(
            SaveInput::from_descriptor(&descriptor),
            Err(BridgeError::MalformedDescriptor(_))
        ));
    }

    #[test]
    fn test_update_and_delete_need_criteria() {
        let no_where = Descriptor::deserialize(&json!({"set": {"status": "done"}})).unwrap();
        assert!(UpdateInput::from_descriptor(&no_where).is_err());

        let empty_where = Descriptor::deserialize(&json!({"where": {}})).unwrap();
        assert!(DeleteInput::from_descriptor(&empty_where).is_err());

        let partly_empty =
            Descriptor::deserialize(&json!({"where": [{}, {"key": "zzz"}]})).unwrap();
        assert!(matches!(
            DeleteInput::from_descriptor(&partly_empty),
            Err(BridgeError::MalformedDescriptor(_))
        ));

        let partly_empty = Descriptor::deserialize(&json!({
            "where": [{"id": "s1"}, {}],
            "set": {"status": "done"}
        }))
        .unwrap();
        assert!(UpdateInput::from_descriptor(&partly_empty).is_err());

        // find keeps the OR semantics: an empty alternative matches everything
        let find = FindOptions::from_descriptor(
            &Descriptor::deserialize(&json!({"where": [{}, {"key": "zzz"}]})).unwrap(),
        )
        .unwrap();
        assert!(find.filter.matches_everything());

        let ok = Descriptor::deserialize(&json!({"where": {"id": "s1"}, "set": {"status": "done"}}))
            .unwrap();
        let update = UpdateInput::from_descriptor(&ok).unwrap();
        assert_eq!(update.set.get("status"), Some(&json!("done")));
    }

    #[test]
    fn test_raw_params() {
        let params = raw_params(&[json!(1), json!(null), json!("x")]).unwrap();
        assert_eq!(
            params,
            vec![Some(Scalar::Integer(1)), None, Some(Scalar::Text("x".into()))]
        );
        assert!(raw_params(&[json!([1])]).is_err());
    }
}
