use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

use crate::state::models::{marker_dir, DirectoryEntry, DirectoryList, MARKER_DIR};

/// Scratch file written and removed to prove the current user can write
const WRITE_TEST_FILE: &str = ".dupliwatch_write_test";

/// One problem with a submitted form. `field: None` is a form-level error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub message: String,
}

impl FieldError {
    pub fn field(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: Some(field.to_string()),
            message: message.into(),
        }
    }

    pub fn form(message: impl Into<String>) -> Self {
        Self {
            field: None,
            message: message.into(),
        }
    }
}

/// Structured validation failure returned to the caller instead of an error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormError {
    pub form_errors: Vec<FieldError>,
}

impl FormError {
    pub fn for_field(&self, field: &str) -> impl Iterator<Item = &FieldError> {
        self.form_errors.iter().filter(move |e| e.field.as_deref() == Some(field))
    }
}

/// `[A-Za-z0-9_]+`
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Check a new registry entry against the current registry.
///
/// Every check runs so the caller gets the complete list; `None` means valid.
pub async fn validate_directory_entry(
    entry: &DirectoryEntry,
    registry: &DirectoryList,
) -> Option<FormError> {
    let mut errors = Vec::new();

    debug!("Validating directory entry: {} -> {}", entry.name, entry.path.display());

    // 1. Name format and uniqueness
    if !is_valid_name(&entry.name) {
        errors.push(FieldError::field("name", "Name may only contain alphanumeric characters."));
    } else if registry.contains(&entry.name) {
        errors.push(FieldError::field("name", "A directory with this name already exists."));
    }

    // 2. Absolute path
    if !entry.path.is_absolute() {
        errors.push(FieldError::field("path", "Path should be absolute."));
    }

    // 3. Readable, writable directory
    if let Some(message) = check_path_access(&entry.path).await {
        errors.push(FieldError::field("path", message));
    }

    // 4. Initialized for the backup tool
    match tokio::fs::metadata(marker_dir(&entry.path)).await {
        Ok(meta) if meta.is_dir() => debug!("Marker directory present"),
        Ok(_) => errors.push(FieldError::field(
            "path",
            format!("Expected to find {} directory inside.", MARKER_DIR),
        )),
        Err(_) => errors.push(FieldError::field(
            "path",
            format!("Directory is not set up for duplicacy: missing {} directory.", MARKER_DIR),
        )),
    }

    if errors.is_empty() {
        None
    } else {
        Some(FormError { form_errors: errors })
    }
}

async fn check_path_access(path: &Path) -> Option<&'static str> {
    let resolved = match dunce::canonicalize(path) {
        Ok(p) => p,
        Err(e) => {
            debug!("Cannot resolve {}: {}", path.display(), e);
            return Some("Path is not accessible.");
        }
    };

    let metadata = match tokio::fs::metadata(&resolved).await {
        Ok(m) => m,
        Err(_) => return Some("Path is not accessible."),
    };

    if !metadata.is_dir() {
        return Some("Path is not a directory.");
    }

    if tokio::fs::read_dir(&resolved).await.is_err() {
        return Some("Path is not accessible.");
    }

    let test_file = resolved.join(WRITE_TEST_FILE);
    match tokio::fs::write(&test_file, b"test").await {
        Ok(()) => {
            let _ = tokio::fs::remove_file(&test_file).await;
        }
        Err(e) => {
            debug!("Cannot write to {}: {}", resolved.display(), e);
            return Some("Path is not accessible.");
        }
    }

    None
}
