//! Cache schema loading.

use crate::error::Result;
use hoard_engine::{FieldDef, FieldType, Priority, Schema, TableSchema};
use std::path::Path;

/// Read a schema from a JSON file, or fall back to the demo schema.
pub fn load_schema(path: Option<&Path>) -> Result<Schema> {
    let schema = match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)?;
            serde_json::from_str(&raw)?
        }
        None => demo_schema(),
    };
    schema.check()?;
    Ok(schema)
}

/// Notes filed into folders, with free-form tags.
pub fn demo_schema() -> Schema {
    Schema::new(1)
        .with_table(
            TableSchema::new(
                "folders",
                vec![
                    FieldDef::required("name", FieldType::String),
                    FieldDef::optional("color", FieldType::String),
                ],
            )
            .with_ttl_seconds(0),
        )
        .with_table(
            TableSchema::new(
                "notes",
                vec![
                    FieldDef::required("title", FieldType::String),
                    FieldDef::optional("body", FieldType::String),
                    FieldDef::optional("tags", FieldType::List),
                    FieldDef::optional("pinned", FieldType::Bool),
                    FieldDef::optional("folder_id", FieldType::String),
                ],
            )
            .with_foreign_key("folder_id", "folders")
            .with_priority(Priority::High),
        )
}
