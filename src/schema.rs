//! Entity registry: the fixed collection name → table shape mapping.
//!
//! The registry is compiled in. The dispatcher consults it to reject unknown
//! collections, bootstrap uses it to create and sync tables, and the SQL
//! builder uses it to validate column names and convert values.

/// Storage type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Integer,
    Real,
    /// Stored as 0/1, returned as JSON booleans.
    Boolean,
    /// Stored as JSON text, returned parsed. Array operators apply to these.
    Json,
}

impl ColumnType {
    /// SQLite type affinity used in `CREATE TABLE`.
    pub fn sql_type(self) -> &'static str {
        match self {
            Self::Text | Self::Json => "TEXT",
            Self::Integer | Self::Boolean => "INTEGER",
            Self::Real => "REAL",
        }
    }
}

/// A column of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: &'static str,
    pub ty: ColumnType,
    pub nullable: bool,
    /// SQL default expression, if any.
    pub default: Option<&'static str>,
}

const fn column(name: &'static str, ty: ColumnType, nullable: bool) -> ColumnDef {
    ColumnDef {
        name,
        ty,
        nullable,
        default: None,
    }
}

const fn column_default(name: &'static str, ty: ColumnType, default: &'static str) -> ColumnDef {
    ColumnDef {
        name,
        ty,
        nullable: false,
        default: Some(default),
    }
}

/// Shape of one collection.
#[derive(Debug, PartialEq, Eq)]
pub struct EntitySchema {
    /// Collection name used by callers (e.g. `Session`).
    pub name: &'static str,
    /// Backing table.
    pub table: &'static str,
    /// Primary key column. Text keys are generated when missing on save.
    pub primary_key: &'static str,
    pub columns: &'static [ColumnDef],
}

impl EntitySchema {
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn primary_column(&self) -> Option<&ColumnDef> {
        self.column(self.primary_key)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.columns.iter().map(|c| c.name)
    }
}

const NOW: &str = "(CAST(strftime('%s','now') AS INTEGER))";

pub static SESSION: EntitySchema = EntitySchema {
    name: "Session",
    table: "sessions",
    primary_key: "id",
    columns: &[
        column("id", ColumnType::Text, false),
        column("title", ColumnType::Text, false),
        column("status", ColumnType::Text, false),
        column("tags", ColumnType::Json, true),
        column_default("archived", ColumnType::Boolean, "0"),
        column_default("createdAt", ColumnType::Integer, NOW),
        column("updatedAt", ColumnType::Integer, true),
    ],
};

pub static MESSAGE: EntitySchema = EntitySchema {
    name: "Message",
    table: "messages",
    primary_key: "id",
    columns: &[
        column("id", ColumnType::Text, false),
        column("sessionId", ColumnType::Text, false),
        column("role", ColumnType::Text, false),
        column("content", ColumnType::Text, false),
        column("tokens", ColumnType::Integer, true),
        column_default("createdAt", ColumnType::Integer, NOW),
    ],
};

pub static SETTING: EntitySchema = EntitySchema {
    name: "Setting",
    table: "settings",
    primary_key: "key",
    columns: &[
        column("key", ColumnType::Text, false),
        column("value", ColumnType::Json, true),
    ],
};

/// Collections known to this build.
pub static ENTITIES: &[&EntitySchema] = &[&SESSION, &MESSAGE, &SETTING];

/// Name → shape lookup over a fixed entity list.
#[derive(Debug, Clone, Copy)]
pub struct Registry {
    entities: &'static [&'static EntitySchema],
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(ENTITIES)
    }
}

impl Registry {
    pub const fn new(entities: &'static [&'static EntitySchema]) -> Self {
        Self { entities }
    }

    pub fn get(&self, name: &str) -> Option<&'static EntitySchema> {
        self.entities.iter().copied().find(|e| e.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &'static EntitySchema> + '_ {
        self.entities.iter().copied()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.iter().map(|e| e.name).collect()
    }
}
