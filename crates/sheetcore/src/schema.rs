use crate::{NodeId, WorkflowRef};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Column data types understood by the schema registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    String,
    Number,
    Boolean,
    Date,
    Object,
    Array,
    Unknown,
}

impl DataType {
    /// Classify a single JSON cell. `None` for null.
    pub fn of(value: &Value) -> Option<DataType> {
        match value {
            Value::Null => None,
            Value::Bool(_) => Some(DataType::Boolean),
            Value::Number(_) => Some(DataType::Number),
            Value::String(s) if looks_like_date(s) => Some(DataType::Date),
            Value::String(_) => Some(DataType::String),
            Value::Array(_) => Some(DataType::Array),
            Value::Object(_) => Some(DataType::Object),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::String => "string",
            DataType::Number => "number",
            DataType::Boolean => "boolean",
            DataType::Date => "date",
            DataType::Object => "object",
            DataType::Array => "array",
            DataType::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

fn looks_like_date(s: &str) -> bool {
    DateTime::parse_from_rfc3339(s).is_ok() || NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: DataType,
    #[serde(default)]
    pub nullable: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: false,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
}

/// Committed schema for one (workflow, node, sheet) key.
///
/// Records are only ever replaced whole; readers always receive their own copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaRecord {
    pub workflow: WorkflowRef,
    pub node_id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sheet_name: Option<String>,
    pub columns: Vec<Column>,
    pub updated_at: DateTime<Utc>,
}

impl SchemaRecord {
    pub fn key(&self) -> SchemaKey {
        SchemaKey {
            workflow: self.workflow.clone(),
            node_id: self.node_id.clone(),
            sheet_name: self.sheet_name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SchemaKey {
    pub workflow: WorkflowRef,
    pub node_id: NodeId,
    pub sheet_name: Option<String>,
}

impl SchemaKey {
    pub fn new(workflow: &WorkflowRef, node_id: &str, sheet_name: Option<&str>) -> Self {
        Self {
            workflow: workflow.clone(),
            node_id: node_id.to_string(),
            sheet_name: sheet_name.map(str::to_string),
        }
    }
}

/// Derive a column list from row objects.
///
/// Columns keep first-seen order. A column missing from some rows, or holding
/// null, is nullable. Mixed types collapse to `Unknown`.
pub fn infer_columns(rows: &[Value]) -> Vec<Column> {
    let mut columns: Vec<(String, Option<DataType>, bool, usize)> = Vec::new();

    for row in rows {
        let Value::Object(map) = row else { continue };
        for (name, cell) in map {
            let observed = DataType::of(cell);
            match columns.iter_mut().find(|(n, ..)| n == name) {
                Some((_, ty, nullable, seen)) => {
                    *seen += 1;
                    match (observed, *ty) {
                        (None, _) => *nullable = true,
                        (Some(o), None) => *ty = Some(o),
                        (Some(o), Some(t)) if o != t => *ty = Some(DataType::Unknown),
                        _ => {}
                    }
                }
                None => columns.push((name.clone(), observed, observed.is_none(), 1)),
            }
        }
    }

    let object_rows = rows.iter().filter(|r| r.is_object()).count();
    columns
        .into_iter()
        .map(|(name, ty, nullable, seen)| Column {
            name,
            data_type: ty.unwrap_or(DataType::Unknown),
            nullable: nullable || seen < object_rows,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn infers_types_and_nullability() {
        let rows = vec![
            json!({"name": "a", "amount": 1.5, "when": "2024-01-02"}),
            json!({"name": "b", "amount": null}),
        ];
        let columns = infer_columns(&rows);
        assert_eq!(
            columns,
            vec![
                Column::new("name", DataType::String),
                Column::new("amount", DataType::Number).nullable(),
                Column::new("when", DataType::Date).nullable(),
            ]
        );
    }

    #[test]
    fn conflicting_types_widen_to_unknown() {
        let rows = vec![json!({"v": 1}), json!({"v": "x"})];
        assert_eq!(infer_columns(&rows)[0].data_type, DataType::Unknown);
    }

    #[test]
    fn column_serializes_with_type_key() {
        let col = Column::new("amount", DataType::Number);
        assert_eq!(
            serde_json::to_value(&col).unwrap(),
            json!({"name": "amount", "type": "number", "nullable": false})
        );
    }
}
