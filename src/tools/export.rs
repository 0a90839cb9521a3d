//! Result writers for the CLI modes.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::core::error::ChatError;
use crate::core::types::{OutputFormat, QaRecord};

const RULE_WIDTH: usize = 50;

/// `output_YYYYmmdd_HHMMSS.<ext>` in the working directory.
pub fn default_output_path(format: OutputFormat) -> PathBuf {
    PathBuf::from(format!(
        "output_{}.{}",
        chrono::Local::now().format("%Y%m%d_%H%M%S"),
        format.extension()
    ))
}

pub fn render_txt(records: &[QaRecord]) -> String {
    let rule = "-".repeat(RULE_WIDTH);
    let mut out = String::new();
    for (i, r) in records.iter().enumerate() {
        out.push_str(&format!("[{}] Question: {}\n", i + 1, r.question));
        out.push_str(&format!("Answer: {}\n", r.answer));
        out.push_str(&format!("Time: {}\n", r.timestamp));
        out.push_str(&rule);
        out.push_str("\n\n");
    }
    out
}

pub fn render_csv(records: &[QaRecord]) -> Result<String, ChatError> {
    let mut wtr = csv::Writer::from_writer(Vec::new());
    wtr.write_record(["question", "answer", "timestamp"])
        .map_err(|e| ChatError::Persist(format!("csv: {}", e)))?;
    for r in records {
        wtr.write_record([&r.question, &r.answer, &r.timestamp])
            .map_err(|e| ChatError::Persist(format!("csv: {}", e)))?;
    }
    let bytes = wtr
        .into_inner()
        .map_err(|e| ChatError::Persist(format!("csv: {}", e)))?;
    String::from_utf8(bytes).map_err(|e| ChatError::Persist(format!("csv: {}", e)))
}

pub fn render_json(records: &[QaRecord]) -> Result<String, ChatError> {
    serde_json::to_string_pretty(records).map_err(|e| ChatError::Persist(format!("json: {}", e)))
}

/// Write `records` in `format`. Returns the path written.
pub fn save_results(
    records: &[QaRecord],
    path: Option<&Path>,
    format: OutputFormat,
) -> Result<PathBuf, ChatError> {
    let path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| default_output_path(format));
    let body = match format {
        OutputFormat::Txt => render_txt(records),
        OutputFormat::Csv => render_csv(records)?,
        OutputFormat::Json => render_json(records)?,
    };
    if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(&path, body)?;
    info!("💾 {} results saved to {}", records.len(), path.display());
    Ok(path)
}
