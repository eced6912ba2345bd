use async_trait::async_trait;
use serde_json::Value;
use sheetcore::services::FileStore;
use sheetcore::{infer_columns, Config, NodeContext, NodeError, NodeHandler, NodeOutput, NodeType};
use std::sync::Arc;

/// Renders the rows on its `data` input as CSV and uploads the file
pub struct SpreadsheetGeneratorHandler {
    files: Arc<dyn FileStore>,
}

impl SpreadsheetGeneratorHandler {
    pub fn new(files: Arc<dyn FileStore>) -> Self {
        Self { files }
    }
}

#[async_trait]
impl NodeHandler for SpreadsheetGeneratorHandler {
    fn node_type(&self) -> NodeType {
        NodeType::SpreadsheetGenerator
    }

    fn description(&self) -> &str {
        "Write table rows to a spreadsheet file"
    }

    fn validate_config(&self, config: &Config) -> Result<(), NodeError> {
        if let Some(name) = config.get("filename") {
            let name = name
                .as_str()
                .ok_or_else(|| NodeError::config("filename must be a string"))?;
            if name.is_empty() || name.contains('/') || name.contains("..") {
                return Err(NodeError::config(format!("Invalid filename: {:?}", name)));
            }
        }
        Ok(())
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let rows = ctx.input_rows("data")?;
        let filename = ctx
            .get_config_or("filename", Value::String("output.csv".into()))
            .as_str()
            .unwrap_or("output.csv")
            .to_string();

        // Explicit column list, else the upstream schema, else the rows
        let columns: Vec<String> = match ctx.config.get("columns").and_then(Value::as_array) {
            Some(list) => list
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            None => match &ctx.input_schema {
                Some(schema) if !schema.is_empty() => schema.iter().map(|c| c.name.clone()).collect(),
                _ => infer_columns(&rows).into_iter().map(|c| c.name).collect(),
            },
        };

        let csv = render_csv(&columns, &rows);
        let size = csv.len() as u64;
        let file_id = format!("generated/{}/{}", ctx.execution_id, filename);

        ctx.events
            .progress(50.0, Some(format!("Writing {} rows to {}", rows.len(), filename)));
        self.files.upload(&file_id, csv.into_bytes()).await?;
        ctx.events.info(format!("Generated {} ({} bytes)", filename, size));

        Ok(NodeOutput::File {
            file_id,
            filename,
            size,
        })
    }
}

pub fn render_csv(columns: &[String], rows: &[Value]) -> String {
    let mut out = String::new();
    let header: Vec<String> = columns.iter().map(|c| escape(c)).collect();
    out.push_str(&header.join(","));
    out.push('\n');

    for row in rows {
        let cells: Vec<String> = columns
            .iter()
            .map(|c| match row.get(c) {
                None | Some(Value::Null) => String::new(),
                Some(Value::String(s)) => escape(s),
                Some(other) => escape(&other.to_string()),
            })
            .collect();
        out.push_str(&cells.join(","));
        out.push('\n');
    }
    out
}

fn escape(cell: &str) -> String {
    if cell.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", cell.replace('"', "\"\""))
    } else {
        cell.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn quotes_cells_that_need_it() {
        let columns = vec!["name".to_string(), "amount".to_string()];
        let rows = vec![
            json!({"name": "Acme, Inc", "amount": 10}),
            json!({"name": "say \"hi\""}),
        ];
        assert_eq!(
            render_csv(&columns, &rows),
            "name,amount\n\"Acme, Inc\",10\n\"say \"\"hi\"\"\",\n"
        );
    }
}
