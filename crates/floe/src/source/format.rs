//! Row format parsers.
//!
//! The format factory is an interface boundary: the engine only needs a name
//! check at create time and a parser per worker. NDJSON ships as the
//! reference implementation.

use std::sync::Arc;

use snafu::prelude::*;

use crate::error::QueueError;

/// A parsed row: column name to JSON value.
pub type ParsedRow = serde_json::Map<String, serde_json::Value>;

/// Errors raised while decoding object bytes into rows.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum FormatError {
    /// A line failed to decode.
    #[snafu(display("Failed to parse {format} in {path} at line {line}: {message}"))]
    Decode {
        format: &'static str,
        path: String,
        line: usize,
        message: String,
    },
}

/// Decodes object bytes into rows, in the order they appear.
pub trait FormatParser: Send + Sync {
    fn name(&self) -> &'static str;

    fn parse(&self, path: &str, data: &[u8]) -> Result<Vec<ParsedRow>, FormatError>;
}

/// Newline-delimited JSON, one object per line. Blank lines are skipped.
pub struct NdjsonFormat;

impl FormatParser for NdjsonFormat {
    fn name(&self) -> &'static str {
        "ndjson"
    }

    fn parse(&self, path: &str, data: &[u8]) -> Result<Vec<ParsedRow>, FormatError> {
        let text = std::str::from_utf8(data).map_err(|e| FormatError::Decode {
            format: self.name(),
            path: path.to_string(),
            line: 0,
            message: e.to_string(),
        })?;

        let mut rows = Vec::new();
        for (index, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let value: serde_json::Value =
                serde_json::from_str(line).map_err(|e| FormatError::Decode {
                    format: self.name(),
                    path: path.to_string(),
                    line: index + 1,
                    message: e.to_string(),
                })?;
            match value {
                serde_json::Value::Object(map) => rows.push(map),
                other => {
                    return Err(FormatError::Decode {
                        format: self.name(),
                        path: path.to_string(),
                        line: index + 1,
                        message: format!("expected a JSON object, got {other}"),
                    })
                }
            }
        }
        Ok(rows)
    }
}

/// Look up a parser by format name (case-insensitive).
pub fn format_for_name(name: &str) -> Result<Arc<dyn FormatParser>, QueueError> {
    match name.to_ascii_lowercase().as_str() {
        "ndjson" | "jsoneachrow" => Ok(Arc::new(NdjsonFormat)),
        other => Err(QueueError::BadArguments {
            message: format!("Unknown format: {other}"),
        }),
    }
}

/// Validate a format name without constructing a parser.
pub fn check_format_name(name: &str) -> Result<(), QueueError> {
    format_for_name(name).map(|_| ())
}
