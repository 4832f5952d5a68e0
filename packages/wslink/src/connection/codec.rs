//! Structured message decoding
//!
//! Turns raw text frames into `serde_json::Value`s. Frames that cannot be
//! decoded yield `None`; there is no error path.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::LazyLock;

static BARE_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([{,]\s*)([A-Za-z0-9_]+)\s*:").expect("bare key pattern is valid")
});

static TRAILING_COMMA: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r",\s*([}\]])").expect("trailing comma pattern is valid")
});

/// Fields converted from digit-only strings to numbers
const NUMERIC_FIELDS: [&str; 2] = ["code", "totalMatch"];

/// How inbound text is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecodeMode {
    /// Plain JSON only
    Strict,
    /// Repair loosely written JSON and normalize well-known fields
    #[default]
    Lenient,
}

/// Decode a raw frame according to `mode`
pub fn decode(text: &str, mode: DecodeMode) -> Option<Value> {
    match mode {
        DecodeMode::Strict => serde_json::from_str(text).ok(),
        DecodeMode::Lenient => {
            let mut value = serde_json::from_str(text)
                .or_else(|_| serde_json::from_str(&repair(text)))
                .ok()?;
            if let Value::Object(fields) = &mut value {
                normalize(fields);
            }
            Some(value)
        }
    }
}

/// Rewrite loosely written JSON (`{ code : '200', }`) into valid JSON.
///
/// Quotes inside string values are rewritten too.
fn repair(text: &str) -> String {
    let text = text.trim().replace('\'', "\"");
    let text = BARE_KEY.replace_all(&text, "${1}\"${2}\":");
    TRAILING_COMMA.replace_all(&text, "${1}").into_owned()
}

fn normalize(fields: &mut Map<String, Value>) {
    for name in NUMERIC_FIELDS {
        let number = match fields.get(name) {
            Some(Value::String(s)) if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) => {
                s.parse::<u64>().ok().map(Value::from).or_else(|| {
                    s.parse::<f64>()
                        .ok()
                        .and_then(serde_json::Number::from_f64)
                        .map(Value::Number)
                })
            }
            _ => None,
        };
        if let Some(number) = number {
            fields.insert(name.to_string(), number);
        }
    }

    let has_batch_id = fields.get("idBatch").is_some_and(|v| !v.is_null());
    if !has_batch_id {
        if let Some(alias) = fields.get("idbatch").filter(|v| !v.is_null()).cloned() {
            fields.insert("idBatch".to_string(), alias);
        }
    }
}
