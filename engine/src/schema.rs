//! Schema definition and validation.
//!
//! Every cached table mirrors a remote table. Its schema validates payloads
//! at the cache boundary, declares which parent tables it references, and
//! carries per-table sync defaults.

use crate::{error::Result, queue::Priority, Error, TableName};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Field types supported in schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    Timestamp,
    /// JSON array; membership queries compare elements exactly
    List,
    /// Arbitrary nested JSON
    Json,
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::String => write!(f, "String"),
            FieldType::Int => write!(f, "Int"),
            FieldType::Float => write!(f, "Float"),
            FieldType::Bool => write!(f, "Bool"),
            FieldType::Timestamp => write!(f, "Timestamp"),
            FieldType::List => write!(f, "List"),
            FieldType::Json => write!(f, "Json"),
        }
    }
}

/// Definition of a field in a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    /// Field name
    pub name: String,
    /// Field type
    pub field_type: FieldType,
    /// Whether this field is required
    pub required: bool,
}

impl FieldDef {
    /// Create a new required field definition.
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
        }
    }

    /// Create a new optional field definition.
    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
        }
    }

    /// Validate a JSON value against this field definition.
    pub fn validate(&self, value: Option<&serde_json::Value>) -> Result<()> {
        match value {
            None if self.required => Err(Error::MissingRequiredField(self.name.clone())),
            None => Ok(()),
            Some(serde_json::Value::Null) if self.required => {
                Err(Error::MissingRequiredField(self.name.clone()))
            }
            Some(serde_json::Value::Null) => Ok(()),
            Some(v) => self.validate_type(v),
        }
    }

    fn validate_type(&self, value: &serde_json::Value) -> Result<()> {
        let valid = match self.field_type {
            FieldType::String => value.is_string(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_f64() || value.is_i64() || value.is_u64(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Timestamp => value.is_u64() || value.is_i64(),
            FieldType::List => value.is_array(),
            FieldType::Json => true, // Any JSON is valid
        };

        if valid {
            Ok(())
        } else {
            Err(Error::TypeMismatch {
                field: self.name.clone(),
                expected: self.field_type.to_string(),
                got: json_type_name(value).to_string(),
            })
        }
    }
}

pub(crate) fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "Null",
        serde_json::Value::Bool(_) => "Bool",
        serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => "Int",
        serde_json::Value::Number(_) => "Float",
        serde_json::Value::String(_) => "String",
        serde_json::Value::Array(_) => "Array",
        serde_json::Value::Object(_) => "Object",
    }
}

/// A reference from a field of this table to the id of a parent table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForeignKey {
    /// Field holding the parent record id
    pub field: String,
    /// Parent table name
    pub references: TableName,
}

/// Schema for a cached table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSchema {
    /// Table name
    pub name: TableName,
    /// Field definitions
    pub fields: Vec<FieldDef>,
    /// Parent tables referenced by this table
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKey>,
    /// Queue priority for local mutations of this table
    #[serde(default)]
    pub priority: Priority,
    /// TTL override in seconds; `Some(0)` disables expiry for this table
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
}

impl TableSchema {
    /// Create a new table schema.
    pub fn new(name: impl Into<TableName>, fields: Vec<FieldDef>) -> Self {
        Self {
            name: name.into(),
            fields,
            foreign_keys: Vec::new(),
            priority: Priority::default(),
            ttl_seconds: None,
        }
    }

    /// Declare that `field` holds the id of a record in `parent`.
    pub fn with_foreign_key(mut self, field: impl Into<String>, parent: impl Into<TableName>) -> Self {
        self.foreign_keys.push(ForeignKey {
            field: field.into(),
            references: parent.into(),
        });
        self
    }

    /// Set the queue priority for this table.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Override the configured TTL for this table.
    pub fn with_ttl_seconds(mut self, ttl: u64) -> Self {
        self.ttl_seconds = Some(ttl);
        self
    }

    /// Get a field definition by name.
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Validate a payload against this schema.
    pub fn validate_payload(&self, payload: &serde_json::Value) -> Result<()> {
        let obj = payload
            .as_object()
            .ok_or_else(|| Error::InvalidPayload("payload must be an object".into()))?;

        for field in &self.fields {
            field.validate(obj.get(&field.name))?;
        }

        for fk in &self.foreign_keys {
            match obj.get(&fk.field) {
                None | Some(serde_json::Value::Null) | Some(serde_json::Value::String(_)) => {}
                Some(other) => {
                    return Err(Error::TypeMismatch {
                        field: fk.field.clone(),
                        expected: FieldType::String.to_string(),
                        got: json_type_name(other).to_string(),
                    })
                }
            }
        }

        Ok(())
    }
}

/// Schema for the entire cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    /// Schema version for migrations
    pub version: u32,
    /// Table schemas by name
    pub tables: BTreeMap<TableName, TableSchema>,
}

impl Schema {
    /// Create a new schema.
    pub fn new(version: u32) -> Self {
        Self {
            version,
            tables: BTreeMap::new(),
        }
    }

    /// Add a table to the schema.
    pub fn add_table(&mut self, table: TableSchema) -> &mut Self {
        self.tables.insert(table.name.clone(), table);
        self
    }

    /// Builder-style method to add a table.
    pub fn with_table(mut self, table: TableSchema) -> Self {
        self.add_table(table);
        self
    }

    /// Get a table schema by name.
    pub fn get_table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.get(name)
    }

    /// Get a table schema by name or fail with `TableNotFound`.
    pub fn require_table(&self, name: &str) -> Result<&TableSchema> {
        self.tables
            .get(name)
            .ok_or_else(|| Error::TableNotFound(name.to_string()))
    }

    /// Validate a payload for the given table.
    pub fn validate(&self, table: &str, payload: &serde_json::Value) -> Result<()> {
        self.require_table(table)?.validate_payload(payload)
    }

    /// Check table names, foreign-key targets and reference cycles.
    pub fn check(&self) -> Result<()> {
        for table in self.tables.values() {
            if !is_identifier(&table.name) {
                return Err(Error::InvalidSchema(format!(
                    "table name '{}' must match [A-Za-z_][A-Za-z0-9_]*",
                    table.name
                )));
            }
            for fk in &table.foreign_keys {
                if !self.tables.contains_key(&fk.references) {
                    return Err(Error::InvalidSchema(format!(
                        "table '{}' references unknown table '{}'",
                        table.name, fk.references
                    )));
                }
            }
        }
        self.eviction_order().map(|_| ())
    }

    /// Tables ordered children first: every table appears before any table
    /// it references. Ties are broken by name so the order is stable.
    pub fn eviction_order(&self) -> Result<Vec<&TableSchema>> {
        // Number of not-yet-emitted children referencing each table.
        let mut pending_children: BTreeMap<&str, usize> =
            self.tables.keys().map(|k| (k.as_str(), 0)).collect();
        for table in self.tables.values() {
            let parents: BTreeSet<&str> = table
                .foreign_keys
                .iter()
                .map(|fk| fk.references.as_str())
                .filter(|p| *p != table.name)
                .collect();
            for parent in parents {
                if let Some(count) = pending_children.get_mut(parent) {
                    *count += 1;
                }
            }
        }

        let mut ready: BTreeSet<&str> = pending_children
            .iter()
            .filter(|(_, c)| **c == 0)
            .map(|(name, _)| *name)
            .collect();
        let mut order = Vec::with_capacity(self.tables.len());

        while let Some(name) = ready.pop_first() {
            let table = &self.tables[name];
            order.push(table);
            let parents: BTreeSet<&str> = table
                .foreign_keys
                .iter()
                .map(|fk| fk.references.as_str())
                .filter(|p| *p != table.name)
                .collect();
            for parent in parents {
                if let Some(count) = pending_children.get_mut(parent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(parent);
                    }
                }
            }
        }

        if order.len() != self.tables.len() {
            return Err(Error::InvalidSchema(
                "foreign keys form a cycle between tables".into(),
            ));
        }
        Ok(order)
    }

    /// Tables that declare a foreign key into `parent`, with the field used.
    pub fn children_of<'a>(&'a self, parent: &'a str) -> impl Iterator<Item = (&'a TableSchema, &'a str)> {
        self.tables.values().flat_map(move |t| {
            t.foreign_keys
                .iter()
                .filter(move |fk| fk.references == parent && t.name != parent)
                .map(move |fk| (t, fk.field.as_str()))
        })
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_schema() -> Schema {
        Schema::new(1)
            .with_table(TableSchema::new(
                "users",
                vec![
                    FieldDef::required("name", FieldType::String),
                    FieldDef::required("age", FieldType::Int),
                    FieldDef::optional("email", FieldType::String),
                    FieldDef::optional("tags", FieldType::List),
                ],
            ))
            .with_table(
                TableSchema::new("posts", vec![FieldDef::required("title", FieldType::String)])
                    .with_foreign_key("userId", "users"),
            )
            .with_table(
                TableSchema::new("comments", vec![FieldDef::required("body", FieldType::String)])
                    .with_foreign_key("postId", "posts"),
            )
    }

    #[test]
    fn validate_valid_payload() {
        let schema = test_schema();
        let table = schema.get_table("users").unwrap();

        let payload = json!({"name": "Alice", "age": 30});
        assert!(table.validate_payload(&payload).is_ok());

        let payload_with_optional =
            json!({"name": "Bob", "age": 25, "email": "bob@example.com", "tags": ["a"]});
        assert!(table.validate_payload(&payload_with_optional).is_ok());
    }

    #[test]
    fn validate_missing_required_field() {
        let schema = test_schema();
        let result = schema.validate("users", &json!({"name": "Alice"}));
        assert!(matches!(result, Err(Error::MissingRequiredField(f)) if f == "age"));
    }

    #[test]
    fn validate_wrong_type() {
        let schema = test_schema();
        let result = schema.validate("users", &json!({"name": "Alice", "age": "thirty"}));
        assert!(matches!(result, Err(Error::TypeMismatch { field, .. }) if field == "age"));

        let result = schema.validate("users", &json!({"name": "Alice", "age": 3, "tags": "a,b"}));
        assert!(matches!(result, Err(Error::TypeMismatch { field, .. }) if field == "tags"));
    }

    #[test]
    fn validate_null_required_field() {
        let schema = test_schema();
        let result = schema.validate("users", &json!({"name": null, "age": 30}));
        assert!(matches!(result, Err(Error::MissingRequiredField(f)) if f == "name"));
    }

    #[test]
    fn validate_non_object_payload() {
        let schema = test_schema();
        let result = schema.validate("users", &json!(["Alice"]));
        assert!(matches!(result, Err(Error::InvalidPayload(_))));
    }

    #[test]
    fn validate_foreign_key_must_be_string() {
        let schema = test_schema();
        assert!(schema
            .validate("posts", &json!({"title": "Hi", "userId": "u1"}))
            .is_ok());
        let result = schema.validate("posts", &json!({"title": "Hi", "userId": 7}));
        assert!(matches!(result, Err(Error::TypeMismatch { field, .. }) if field == "userId"));
    }

    #[test]
    fn validate_table_not_found() {
        let schema = test_schema();
        let result = schema.validate("likes", &json!({}));
        assert!(matches!(result, Err(Error::TableNotFound(t)) if t == "likes"));
    }

    #[test]
    fn eviction_order_puts_children_first() {
        let schema = test_schema();
        let order: Vec<_> = schema
            .eviction_order()
            .unwrap()
            .into_iter()
            .map(|t| t.name.as_str())
            .collect();
        assert_eq!(order, vec!["comments", "posts", "users"]);
    }

    #[test]
    fn eviction_order_rejects_cycles() {
        let schema = Schema::new(1)
            .with_table(TableSchema::new("a", vec![]).with_foreign_key("bId", "b"))
            .with_table(TableSchema::new("b", vec![]).with_foreign_key("aId", "a"));
        assert!(matches!(schema.check(), Err(Error::InvalidSchema(_))));
    }

    #[test]
    fn self_reference_is_not_a_cycle() {
        let schema = Schema::new(1)
            .with_table(TableSchema::new("folders", vec![]).with_foreign_key("parentId", "folders"));
        assert!(schema.check().is_ok());
    }

    #[test]
    fn check_rejects_bad_names_and_dangling_references() {
        let schema = Schema::new(1).with_table(TableSchema::new("bad-name", vec![]));
        assert!(matches!(schema.check(), Err(Error::InvalidSchema(_))));

        let schema =
            Schema::new(1).with_table(TableSchema::new("posts", vec![]).with_foreign_key("u", "users"));
        assert!(matches!(schema.check(), Err(Error::InvalidSchema(_))));
    }

    #[test]
    fn children_of_lists_referencing_tables() {
        let schema = test_schema();
        let children: Vec<_> = schema
            .children_of("posts")
            .map(|(t, f)| (t.name.clone(), f.to_string()))
            .collect();
        assert_eq!(children, vec![("comments".to_string(), "postId".to_string())]);
    }

    #[test]
    fn field_type_display() {
        assert_eq!(FieldType::String.to_string(), "String");
        assert_eq!(FieldType::List.to_string(), "List");
        assert_eq!(FieldType::Json.to_string(), "Json");
    }

    #[test]
    fn schema_deserializes_with_defaults() {
        let schema: Schema = serde_json::from_value(json!({
            "version": 2,
            "tables": {
                "notes": {
                    "name": "notes",
                    "fields": [{"name": "body", "fieldType": "string", "required": true}]
                }
            }
        }))
        .unwrap();
        let notes = schema.get_table("notes").unwrap();
        assert_eq!(notes.priority, Priority::Medium);
        assert!(notes.foreign_keys.is_empty());
        assert_eq!(notes.ttl_seconds, None);
    }
}
