use async_trait::async_trait;
use serde_json::Value;
use sheetcore::services::FileStore;
use sheetcore::{type_name, Config, NodeContext, NodeError, NodeHandler, NodeOutput, NodeType};
use std::sync::Arc;

/// Loads a table from the file store, or from rows given inline.
///
/// Files hold JSON: either an array of row objects, or an object mapping
/// sheet names to row arrays. CSV files with a header line are also read.
pub struct FileInputHandler {
    files: Arc<dyn FileStore>,
}

impl FileInputHandler {
    pub fn new(files: Arc<dyn FileStore>) -> Self {
        Self { files }
    }
}

#[async_trait]
impl NodeHandler for FileInputHandler {
    fn node_type(&self) -> NodeType {
        NodeType::FileInput
    }

    fn description(&self) -> &str {
        "Read rows from an uploaded file"
    }

    fn validate_config(&self, config: &Config) -> Result<(), NodeError> {
        match (config.get("file_id"), config.get("rows")) {
            (Some(Value::String(_)), _) | (None, Some(Value::Array(_))) => Ok(()),
            (Some(other), _) => Err(NodeError::InvalidInputType {
                field: "file_id".into(),
                expected: "string".into(),
                actual: type_name(other).into(),
            }),
            _ => Err(NodeError::config("Missing config: file_id")),
        }
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let wanted = ctx
            .config
            .get("sheet_name")
            .and_then(Value::as_str)
            .map(str::to_string);

        let (rows, sheet_name, source) = match ctx.config.get("file_id").and_then(Value::as_str) {
            Some(file_id) => {
                ctx.events.progress(0.0, Some(format!("Downloading {}", file_id)));
                let bytes = self.files.download(file_id).await?;
                let (rows, sheet) = if file_id.to_ascii_lowercase().ends_with(".csv") {
                    (parse_csv(&bytes)?, None)
                } else {
                    pick_sheet(parse_json(&bytes)?, wanted.as_deref())?
                };
                (rows, sheet, file_id.to_string())
            }
            None => (inline_rows(&ctx)?, wanted, "inline rows".to_string()),
        };

        ctx.events
            .progress(100.0, Some(format!("Loaded {} rows", rows.len())));
        tracing::debug!(node_id = %ctx.node_id, rows = rows.len(), source = %source, "file loaded");

        Ok(NodeOutput::Table {
            explanation: Some(format!("Loaded {} rows from {}", rows.len(), source)),
            data: rows,
            sheet_name,
        })
    }
}

fn inline_rows(ctx: &NodeContext) -> Result<Vec<Value>, NodeError> {
    match ctx.require_config("rows")? {
        Value::Array(rows) => Ok(rows.clone()),
        other => Err(NodeError::InvalidInputType {
            field: "rows".into(),
            expected: "array".into(),
            actual: type_name(other).into(),
        }),
    }
}

fn parse_json(bytes: &[u8]) -> Result<Value, NodeError> {
    serde_json::from_slice(bytes)
        .map_err(|e| NodeError::config(format!("File is not valid JSON: {}", e)))
}

/// Rows of the requested sheet, or of the first sheet when none is named.
fn pick_sheet(
    content: Value,
    wanted: Option<&str>,
) -> Result<(Vec<Value>, Option<String>), NodeError> {
    match content {
        Value::Array(rows) => Ok((rows, wanted.map(str::to_string))),
        Value::Object(sheets) => {
            let (name, rows) = match wanted {
                Some(name) => sheets
                    .get(name)
                    .map(|rows| (name.to_string(), rows.clone()))
                    .ok_or_else(|| NodeError::config(format!("Sheet '{}' not found", name)))?,
                None => sheets
                    .iter()
                    .next()
                    .map(|(name, rows)| (name.clone(), rows.clone()))
                    .ok_or_else(|| NodeError::config("File contains no sheets"))?,
            };
            match rows {
                Value::Array(rows) => Ok((rows, Some(name))),
                other => Err(NodeError::InvalidInputType {
                    field: name,
                    expected: "array".into(),
                    actual: type_name(&other).into(),
                }),
            }
        }
        other => Err(NodeError::InvalidInputType {
            field: "file".into(),
            expected: "array or object".into(),
            actual: type_name(&other).into(),
        }),
    }
}

/// Minimal CSV reader: header record, comma separated, double-quote
/// escaping. Quoted cells may span line breaks.
fn parse_csv(bytes: &[u8]) -> Result<Vec<Value>, NodeError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| NodeError::config(format!("File is not UTF-8: {}", e)))?;
    let mut records = split_csv_records(text)?.into_iter();
    let header = match records.next() {
        Some(record) => record,
        None => return Ok(Vec::new()),
    };

    Ok(records
        .map(|cells| {
            let row = header
                .iter()
                .enumerate()
                .map(|(i, name)| {
                    let cell = cells.get(i).map(String::as_str).unwrap_or("");
                    (name.clone(), csv_cell(cell))
                })
                .collect();
            Value::Object(row)
        })
        .collect())
}

fn csv_cell(raw: &str) -> Value {
    if raw.is_empty() {
        return Value::Null;
    }
    if let Ok(n) = raw.parse::<i64>() {
        return Value::from(n);
    }
    if let Ok(f) = raw.parse::<f64>() {
        if f.is_finite() {
            return Value::from(f);
        }
    }
    match raw {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::String(raw.to_string()),
    }
}

/// Split CSV text into records of cells. Blank lines are dropped.
fn split_csv_records(text: &str) -> Result<Vec<Vec<String>>, NodeError> {
    let mut records = Vec::new();
    let mut record = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    // A record holding one empty unquoted cell is a blank line
    let mut touched = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => {
                quoted = !quoted;
                touched = true;
            }
            ',' if !quoted => {
                record.push(std::mem::take(&mut current));
                touched = true;
            }
            '\r' if !quoted && chars.peek() == Some(&'\n') => {}
            '\n' if !quoted => {
                if touched || !current.trim().is_empty() {
                    record.push(std::mem::take(&mut current));
                    records.push(std::mem::take(&mut record));
                }
                current.clear();
                touched = false;
            }
            _ => current.push(c),
        }
    }
    if quoted {
        return Err(NodeError::config("CSV has an unterminated quoted cell"));
    }
    if touched || !current.trim().is_empty() {
        record.push(current);
        records.push(record);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn csv_with_quotes() {
        let rows = parse_csv(b"name,amount\n\"Acme, Inc\",10\n\"say \"\"hi\"\"\",\n").unwrap();
        assert_eq!(
            rows,
            vec![
                json!({"name": "Acme, Inc", "amount": 10}),
                json!({"name": "say \"hi\"", "amount": null}),
            ]
        );
    }

    #[test]
    fn csv_quoted_cells_span_lines() {
        let rows = parse_csv(b"note,n\r\n\"two\nlines\",1\r\n\r\nplain,2").unwrap();
        assert_eq!(
            rows,
            vec![
                json!({"note": "two\nlines", "n": 1}),
                json!({"note": "plain", "n": 2}),
            ]
        );
        assert!(parse_csv(b"a\n\"open").is_err());
    }

    #[test]
    fn first_sheet_by_default() {
        let content = json!({"Q1": [{"a": 1}], "Q2": [{"a": 2}]});
        let (rows, sheet) = pick_sheet(content.clone(), None).unwrap();
        assert_eq!(rows, vec![json!({"a": 1})]);
        assert_eq!(sheet.as_deref(), Some("Q1"));

        let (rows, _) = pick_sheet(content.clone(), Some("Q2")).unwrap();
        assert_eq!(rows, vec![json!({"a": 2})]);
        assert!(pick_sheet(content, Some("Q3")).is_err());
    }
}
