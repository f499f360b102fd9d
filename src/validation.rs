//! Input validation against tool descriptors and their option schemas
//!
//! Options arrive either as a JSON object or as multipart text fields, so
//! scalar values are coerced from strings to the schema type before the
//! constraints are checked.

use serde_json::{Map, Number, Value};
use tracing::debug;

use crate::artifact::{extension_of, UploadArtifact};
use crate::error::{PipelineError, Result};
use crate::registry::ToolDescriptor;

/// Coerce, constrain and default `options` against a JSON schema.
///
/// Supported keywords: `type`, `enum`, `minimum`, `maximum`, `minLength`,
/// `maxLength`, `default` and `required`. Keys the schema does not declare are
/// dropped.
pub fn normalize_options(options: &Map<String, Value>, schema: &Value) -> Result<Map<String, Value>> {
    let properties = schema
        .get("properties")
        .and_then(|p| p.as_object())
        .cloned()
        .unwrap_or_default();

    let mut normalized = Map::new();

    for (key, value) in options {
        let Some(prop_schema) = properties.get(key) else {
            debug!(option = %key, "dropping undeclared option");
            continue;
        };
        let expected = prop_schema.get("type").and_then(|t| t.as_str()).unwrap_or("string");

        // Blank form fields mean "not provided" for anything but strings
        if expected != "string" && value.as_str().is_some_and(|s| s.trim().is_empty()) {
            continue;
        }
        if value.is_null() {
            continue;
        }

        let coerced = coerce(key, value, expected)?;
        check_constraints(key, &coerced, prop_schema)?;
        normalized.insert(key.clone(), coerced);
    }

    for (key, prop_schema) in &properties {
        if normalized.contains_key(key) {
            continue;
        }
        if let Some(default) = prop_schema.get("default") {
            normalized.insert(key.clone(), default.clone());
        }
    }

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for field in required {
            let field = field.as_str().ok_or_else(|| {
                PipelineError::Config("Invalid schema: required field not a string".to_string())
            })?;
            if !normalized.contains_key(field) {
                return Err(PipelineError::invalid(format!("Missing required option: {}", field)));
            }
        }
    }

    Ok(normalized)
}

fn coerce(key: &str, value: &Value, expected: &str) -> Result<Value> {
    let mismatch = || PipelineError::invalid(format!("Option '{}' must be of type {}", key, expected));

    let coerced = match (expected, value) {
        ("string", Value::String(_)) => value.clone(),
        ("string", Value::Number(n)) => Value::String(n.to_string()),
        ("string", Value::Bool(b)) => Value::String(b.to_string()),

        ("integer", Value::Number(n)) => {
            if n.is_i64() || n.is_u64() {
                value.clone()
            } else {
                match n.as_f64() {
                    Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Value::from(f as i64),
                    _ => return Err(mismatch()),
                }
            }
        }
        ("integer", Value::String(s)) => s.trim().parse::<i64>().map(Value::from).map_err(|_| mismatch())?,

        ("number", Value::Number(_)) => value.clone(),
        ("number", Value::String(s)) => {
            let f = s.trim().parse::<f64>().map_err(|_| mismatch())?;
            Number::from_f64(f).map(Value::Number).ok_or_else(mismatch)?
        }

        ("boolean", Value::Bool(_)) => value.clone(),
        ("boolean", Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Value::Bool(true),
            "false" | "0" | "no" | "off" => Value::Bool(false),
            _ => return Err(mismatch()),
        },

        ("array", Value::Array(_)) => value.clone(),
        ("array", Value::String(s)) => {
            let s = s.trim();
            if s.starts_with('[') {
                serde_json::from_str::<Value>(s)
                    .ok()
                    .filter(Value::is_array)
                    .ok_or_else(mismatch)?
            } else {
                Value::Array(
                    s.split(',')
                        .map(str::trim)
                        .filter(|part| !part.is_empty())
                        .map(|part| Value::String(part.to_string()))
                        .collect(),
                )
            }
        }

        ("object", Value::Object(_)) => value.clone(),
        ("object", Value::String(s)) => serde_json::from_str::<Value>(s)
            .ok()
            .filter(Value::is_object)
            .ok_or_else(mismatch)?,

        _ => return Err(mismatch()),
    };

    Ok(coerced)
}

fn check_constraints(key: &str, value: &Value, schema: &Value) -> Result<()> {
    if let Some(allowed) = schema.get("enum").and_then(|e| e.as_array()) {
        if !allowed.iter().any(|candidate| values_equal(candidate, value)) {
            let choices: Vec<String> = allowed
                .iter()
                .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                .collect();
            return Err(PipelineError::invalid(format!(
                "Option '{}' must be one of: {}",
                key,
                choices.join(", ")
            )));
        }
    }

    if let Some(n) = value.as_f64() {
        if let Some(min) = schema.get("minimum").and_then(|m| m.as_f64()) {
            if n < min {
                return Err(PipelineError::invalid(format!("Option '{}' must be at least {}", key, min)));
            }
        }
        if let Some(max) = schema.get("maximum").and_then(|m| m.as_f64()) {
            if n > max {
                return Err(PipelineError::invalid(format!("Option '{}' must be at most {}", key, max)));
            }
        }
    }

    if let Some(items) = value.as_array() {
        if let Some(max) = schema.get("maxItems").and_then(|m| m.as_u64()) {
            if items.len() as u64 > max {
                return Err(PipelineError::invalid(format!("Option '{}' takes at most {} items", key, max)));
            }
        }
    }

    if let Some(s) = value.as_str() {
        let len = s.chars().count() as u64;
        if let Some(min) = schema.get("minLength").and_then(|m| m.as_u64()) {
            if len < min {
                return Err(PipelineError::invalid(format!("Option '{}' must not be empty", key)));
            }
        }
        if let Some(max) = schema.get("maxLength").and_then(|m| m.as_u64()) {
            if len > max {
                return Err(PipelineError::invalid(format!(
                    "Option '{}' must be at most {} characters",
                    key, max
                )));
            }
        }
    }

    Ok(())
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Admission check for one incoming file, run before anything touches disk.
///
/// Returns the normalized extension.
pub fn check_incoming(tool: &ToolDescriptor, already_received: usize, filename: &str) -> Result<String> {
    if !tool.accepts_files() {
        return Err(PipelineError::invalid(format!("{} does not accept file uploads", tool.display_name)));
    }
    if already_received >= tool.max_files {
        return Err(PipelineError::invalid(format!(
            "{} accepts at most {} file(s)",
            tool.display_name, tool.max_files
        )));
    }

    let ext = extension_of(filename)
        .ok_or_else(|| PipelineError::invalid(format!("File '{}' has no extension", filename)))?;
    if !tool.accepts_extension(&ext) {
        return Err(PipelineError::invalid(format!(
            "File type .{} is not supported by {}. Allowed: {}",
            ext,
            tool.display_name,
            tool.extensions.join(", ")
        )));
    }
    Ok(ext)
}

pub fn check_file_size(tool: &ToolDescriptor, size: u64) -> Result<()> {
    if size > tool.max_file_size {
        return Err(PipelineError::invalid(format!(
            "File exceeds the {} MB limit for {}",
            tool.max_file_size.div_ceil(1024 * 1024),
            tool.display_name
        )));
    }
    Ok(())
}

/// Full check of a request's files against its descriptor.
pub fn validate_files(tool: &ToolDescriptor, files: &[UploadArtifact], max_request_size: u64) -> Result<()> {
    if files.len() < tool.min_files || files.len() > tool.max_files {
        let expected = if tool.min_files == tool.max_files {
            format!("exactly {}", tool.min_files)
        } else {
            format!("between {} and {}", tool.min_files, tool.max_files)
        };
        return Err(PipelineError::invalid(format!(
            "{} requires {} file(s), got {}",
            tool.display_name,
            expected,
            files.len()
        )));
    }

    let mut total = 0u64;
    for file in files {
        let ext = extension_of(&file.original_filename).unwrap_or_default();
        if !tool.accepts_extension(&ext) {
            return Err(PipelineError::invalid(format!(
                "File type .{} is not supported by {}",
                ext, tool.display_name
            )));
        }
        if file.size == 0 {
            return Err(PipelineError::invalid(format!("File '{}' is empty", file.original_filename)));
        }
        check_file_size(tool, file.size)?;
        total += file.size;
    }

    if total > max_request_size {
        return Err(PipelineError::invalid("Combined upload size exceeds the request limit"));
    }
    Ok(())
}
