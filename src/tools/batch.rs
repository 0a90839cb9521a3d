//! Batch mode: read questions from a file and ask them one by one.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, error, info};

use crate::core::error::ChatError;
use crate::core::types::QaRecord;
use crate::features::portal::PortalClient;

/// Header cells that name the question column by substring.
const HEADER_CONTAINS: &[&str] = &["问题", "question"];
/// Header cells that name the question column when equal.
const HEADER_EXACT: &[&str] = &["prompt", "query", "text", "content", "q"];

const JSON_ITEM_KEYS: &[&str] = &["question", "prompt", "text", "content", "q"];
const JSON_WRAPPER_KEYS: &[&str] = &["questions", "prompts", "items", "data"];

/// Anything that answers one question at a time.
#[async_trait]
pub trait Asker: Send {
    async fn ask(&mut self, question: &str) -> Result<String, ChatError>;
}

#[async_trait]
impl Asker for PortalClient {
    async fn ask(&mut self, question: &str) -> Result<String, ChatError> {
        self.chat(question).await
    }
}

/// Read questions from `path`, dispatching on the extension.
pub fn read_questions(path: &Path) -> Result<Vec<String>, ChatError> {
    let content = std::fs::read_to_string(path)?;
    let content = content.trim_start_matches('\u{feff}');
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    let questions = match ext.as_str() {
        "csv" => read_csv_questions(content)?,
        "json" => read_json_questions(content)?,
        _ => read_text_questions(content),
    };
    info!("📄 {} questions read from {}", questions.len(), path.display());
    Ok(questions)
}

/// One question per non-blank line.
pub fn read_text_questions(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

fn is_question_header(cell: &str) -> bool {
    let cell = cell.trim().to_lowercase();
    HEADER_CONTAINS.iter().any(|k| cell.contains(k)) || HEADER_EXACT.contains(&cell.as_str())
}

/// Pick the question column of a CSV document.
///
/// A recognised header selects its column and is skipped. Otherwise the
/// first column whose first cell is not a number is used, and that first row
/// counts as a question too.
pub fn read_csv_questions(content: &str) -> Result<Vec<String>, ChatError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(content.as_bytes());
    let rows = reader
        .records()
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ChatError::Config(format!("csv: {}", e)))?;
    let Some(first) = rows.first() else {
        return Ok(Vec::new());
    };

    let (column, skip) = match first.iter().position(is_question_header) {
        Some(col) => (col, 1),
        None => {
            let col = first
                .iter()
                .position(|cell| {
                    let cell = cell.trim();
                    !cell.is_empty() && cell.parse::<f64>().is_err()
                })
                .unwrap_or(0);
            (col, 0)
        }
    };
    debug!("csv: question column {} (header skipped: {})", column, skip == 1);

    Ok(rows
        .iter()
        .skip(skip)
        .filter_map(|row| row.get(column))
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .map(str::to_string)
        .collect())
}

/// Strings, objects with a known key, or an object wrapping such an array.
pub fn read_json_questions(content: &str) -> Result<Vec<String>, ChatError> {
    let value: Value =
        serde_json::from_str(content).map_err(|e| ChatError::Config(format!("json: {}", e)))?;
    let items = match &value {
        Value::Array(items) => items.as_slice(),
        Value::Object(map) => JSON_WRAPPER_KEYS
            .iter()
            .find_map(|k| map.get(*k).and_then(|v| v.as_array()))
            .map(|v| v.as_slice())
            .ok_or_else(|| {
                ChatError::Config(format!(
                    "json: expected an array or one of {:?}",
                    JSON_WRAPPER_KEYS
                ))
            })?,
        _ => return Err(ChatError::Config("json: expected an array or object".into())),
    };

    Ok(items
        .iter()
        .filter_map(|item| match item {
            Value::String(s) => Some(s.as_str()),
            Value::Object(obj) => JSON_ITEM_KEYS
                .iter()
                .find_map(|k| obj.get(*k).and_then(|v| v.as_str())),
            _ => None,
        })
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .map(str::to_string)
        .collect())
}

/// Ask every question in order. A failed question becomes an `error: …`
/// record and the batch carries on.
pub async fn run_batch<A: Asker + ?Sized>(
    asker: &mut A,
    questions: &[String],
    delay: Duration,
) -> Vec<QaRecord> {
    let total = questions.len();
    let mut records = Vec::with_capacity(total);
    for (i, question) in questions.iter().enumerate() {
        info!("❓ [{}/{}] {}", i + 1, total, question);
        let record = match asker.ask(question).await {
            Ok(answer) => QaRecord::answered(question.as_str(), answer),
            Err(e) => {
                error!("❌ [{}/{}] failed: {}", i + 1, total, e);
                QaRecord::failed(question.as_str(), &e)
            }
        };
        records.push(record);
        if i + 1 < total && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
    let ok = records.iter().filter(|r| r.success).count();
    info!("📊 batch done: {}/{} answered", ok, total);
    records
}
