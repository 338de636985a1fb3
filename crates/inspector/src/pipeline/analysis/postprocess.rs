//! Normalisation of engine output before it is returned

use serde_json::{Map, Value};

/// Column at which the engine's text report aligns its `:` separators
const TEXT_LABEL_WIDTH: usize = 41;

const FILENAME_FIELDS: &[&str] = &["CompleteName", "Complete_name", "File_Name"];

/// Names known for the analysed resource
#[derive(Debug, Clone, Default)]
pub struct DisplayNames {
    /// Name to show: the archive entry name when one was found
    pub display: Option<String>,
    /// Name the origin gave the resource itself
    pub outer: Option<String>,
    /// The display name came from an archive envelope
    pub from_archive: bool,
}

/// Replace every `{"#value": x}` object with `x`, recursively
pub fn unwrap_values(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            if map.len() == 1 && map.contains_key("#value") {
                let inner = map.into_iter().next().map(|(_, v)| v).unwrap_or(Value::Null);
                return unwrap_values(inner);
            }
            Value::Object(map.into_iter().map(|(k, v)| (k, unwrap_values(v))).collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(unwrap_values).collect()),
        other => other,
    }
}

/// Non-empty, free of control characters and replacement characters
pub fn is_usable_filename(name: &str) -> bool {
    !name.is_empty() && !name.chars().any(|c| c.is_control() || c == '\u{FFFD}')
}

/// Unwrap values and fix up the General track's filename fields
pub fn normalize_object(value: Value, names: &DisplayNames) -> Value {
    let mut value = unwrap_values(value);

    let general = value
        .get_mut("media")
        .and_then(|media| media.get_mut("track"))
        .and_then(Value::as_array_mut)
        .and_then(|tracks| {
            tracks
                .iter_mut()
                .find(|track| track.get("@type").and_then(Value::as_str) == Some("General"))
        })
        .and_then(Value::as_object_mut);

    if let Some(general) = general {
        apply_names(general, names);
    }

    value
}

fn apply_names(general: &mut Map<String, Value>, names: &DisplayNames) {
    let existing = FILENAME_FIELDS.iter().find_map(|field| {
        general
            .get(*field)
            .and_then(Value::as_str)
            .filter(|name| is_usable_filename(name))
    });

    if let Some(display) = &names.display {
        if existing.is_none() || names.from_archive {
            general.insert("CompleteName".to_string(), Value::String(display.clone()));
        }
    }

    if let (Some(display), Some(outer)) = (&names.display, &names.outer) {
        if display != outer {
            general.insert("Archive_Name".to_string(), Value::String(outer.clone()));
        }
    }
}

/// Insert a `Complete name` line into the General section of a text report
///
/// The line goes directly after the `General` header, or after its
/// `Unique ID` line when the section has one. Reports that already mention
/// a complete name, or have no General section, are returned unchanged.
pub fn inject_complete_name(text: &str, display: &str) -> String {
    if text.contains("Complete name") {
        return text.to_string();
    }

    let entry = format!("{:<width$}: {}", "Complete name", display, width = TEXT_LABEL_WIDTH);
    let mut lines: Vec<&str> = text.split('\n').collect();
    let Some(general) = lines.iter().position(|line| line.trim().starts_with("General")) else {
        return text.to_string();
    };

    let mut insert_at = general + 1;
    for (index, line) in lines.iter().enumerate().skip(general + 1) {
        let trimmed = line.trim();
        if trimmed.starts_with("Unique ID") {
            insert_at = index + 1;
            break;
        }
        if trimmed.is_empty() {
            break;
        }
    }

    lines.insert(insert_at, &entry);
    lines.join("\n")
}
