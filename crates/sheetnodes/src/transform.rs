use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use sheetcore::{infer_columns, Config, NodeContext, NodeError, NodeHandler, NodeOutput, NodeType};
use std::cmp::Ordering;
use std::collections::HashSet;

/// Comparison applied to one column of a row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    IsEmpty,
    NotEmpty,
}

/// `column <operator> value`
#[derive(Debug, Clone, Deserialize)]
pub struct Condition {
    pub column: String,
    pub operator: Operator,
    #[serde(default)]
    pub value: Value,
}

impl Condition {
    pub fn from_config(config: &Config) -> Result<Self, NodeError> {
        serde_json::from_value(Value::Object(config.clone()))
            .map_err(|e| NodeError::config(format!("Invalid condition: {}", e)))
    }

    pub fn matches(&self, row: &Value) -> bool {
        let cell = row.get(&self.column).unwrap_or(&Value::Null);
        match self.operator {
            Operator::Eq => loose_eq(cell, &self.value),
            Operator::Ne => !loose_eq(cell, &self.value),
            Operator::Gt => compare(cell, &self.value) == Some(Ordering::Greater),
            Operator::Gte => matches!(
                compare(cell, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Operator::Lt => compare(cell, &self.value) == Some(Ordering::Less),
            Operator::Lte => matches!(
                compare(cell, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Operator::Contains => match (cell, &self.value) {
                (Value::String(s), Value::String(needle)) => {
                    s.to_lowercase().contains(&needle.to_lowercase())
                }
                (Value::Array(items), needle) => items.iter().any(|i| loose_eq(i, needle)),
                _ => false,
            },
            Operator::IsEmpty => is_empty(cell),
            Operator::NotEmpty => !is_empty(cell),
        }
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        _ => false,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Numbers compare numerically even when one side is a numeric string
fn loose_eq(a: &Value, b: &Value) -> bool {
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => x.partial_cmp(&y),
        _ => match (a, b) {
            (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
            (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
            _ => None,
        },
    }
}

/// Total order used for sorting: empty, then booleans, numbers (including
/// numeric strings), text, and finally arrays and objects.
fn sort_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        _ if as_number(value).is_some() => 2,
        Value::String(_) => 3,
        _ => 4,
    }
}

fn sort_cmp(a: &Value, b: &Value) -> Ordering {
    sort_rank(a).cmp(&sort_rank(b)).then_with(|| {
        if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
            return x.total_cmp(&y);
        }
        match (a, b) {
            (Value::String(x), Value::String(y)) => x.cmp(y),
            (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
            _ => a.to_string().cmp(&b.to_string()),
        }
    })
}

/// One step of a transform pipeline
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    Filter(Condition),
    Sort {
        column: String,
        #[serde(default)]
        descending: bool,
    },
    Select {
        columns: Vec<String>,
    },
    Limit {
        count: usize,
    },
}

impl Operation {
    fn columns(&self) -> Vec<&str> {
        match self {
            Operation::Filter(c) => vec![c.column.as_str()],
            Operation::Sort { column, .. } => vec![column.as_str()],
            Operation::Select { columns } => columns.iter().map(String::as_str).collect(),
            Operation::Limit { .. } => Vec::new(),
        }
    }

    fn apply(&self, rows: Vec<Value>) -> (Vec<Value>, String) {
        let before = rows.len();
        match self {
            Operation::Filter(condition) => {
                let kept: Vec<Value> = rows.into_iter().filter(|r| condition.matches(r)).collect();
                let note = format!(
                    "filtered on {} ({} of {} rows kept)",
                    condition.column,
                    kept.len(),
                    before
                );
                (kept, note)
            }
            Operation::Sort { column, descending } => {
                let mut rows = rows;
                rows.sort_by(|a, b| {
                    let a = a.get(column).unwrap_or(&Value::Null);
                    let b = b.get(column).unwrap_or(&Value::Null);
                    let ord = sort_cmp(a, b);
                    if *descending {
                        ord.reverse()
                    } else {
                        ord
                    }
                });
                let direction = if *descending { "descending" } else { "ascending" };
                (rows, format!("sorted by {} {}", column, direction))
            }
            Operation::Select { columns } => {
                let rows = rows
                    .into_iter()
                    .map(|row| {
                        let picked = columns
                            .iter()
                            .map(|c| (c.clone(), row.get(c).cloned().unwrap_or(Value::Null)))
                            .collect();
                        Value::Object(picked)
                    })
                    .collect();
                (rows, format!("selected {}", columns.join(", ")))
            }
            Operation::Limit { count } => {
                let mut rows = rows;
                rows.truncate(*count);
                (rows, format!("kept first {} of {} rows", (*count).min(before), before))
            }
        }
    }
}

fn parse_operations(config: &Config) -> Result<Vec<Operation>, NodeError> {
    let raw = config
        .get("operations")
        .cloned()
        .ok_or_else(|| NodeError::config("Missing config: operations"))?;
    serde_json::from_value(raw).map_err(|e| NodeError::config(format!("Invalid operations: {}", e)))
}

/// Filters, sorts, projects and truncates the rows on its `data` input
pub struct DataTransformHandler;

#[async_trait]
impl NodeHandler for DataTransformHandler {
    fn node_type(&self) -> NodeType {
        NodeType::DataTransform
    }

    fn description(&self) -> &str {
        "Filter, sort, select and limit table rows"
    }

    fn validate_config(&self, config: &Config) -> Result<(), NodeError> {
        parse_operations(config).map(|_| ())
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let operations = parse_operations(&ctx.config)?;
        let mut rows = ctx.input_rows("data")?;

        // Columns seen in the rows plus whatever the upstream schema declares
        let mut known: HashSet<String> = infer_columns(&rows).into_iter().map(|c| c.name).collect();
        if let Some(columns) = &ctx.input_schema {
            known.extend(columns.iter().map(|c| c.name.clone()));
        }
        if !rows.is_empty() || !known.is_empty() {
            for op in &operations {
                if let Some(missing) = op.columns().into_iter().find(|c| !known.contains(*c)) {
                    return Err(NodeError::config(format!(
                        "Column '{}' does not exist in the input",
                        missing
                    )));
                }
            }
        }

        let mut notes = Vec::with_capacity(operations.len());
        for op in &operations {
            let (next, note) = op.apply(rows);
            rows = next;
            notes.push(note);
        }

        let explanation = if notes.is_empty() {
            format!("Passed {} rows through unchanged", rows.len())
        } else {
            let mut text = notes.join("; ");
            if let Some(first) = text.get_mut(0..1) {
                first.make_ascii_uppercase();
            }
            text
        };
        ctx.events.info(explanation.clone());
        Ok(NodeOutput::explained(rows, explanation))
    }
}
