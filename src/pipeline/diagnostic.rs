//! Run diagnostic dump: writes intermediate artifacts to disk.
//!
//! Disabled unless a dump directory is configured (`ICD10_REVIEW_DUMP_DIR`).
//! Artifacts contain note text and prompts, so they are only ever written
//! here, never logged.
//!
//! **Output structure**:
//! ```text
//! {dump_dir}/{run_id}/
//!   01-entities.json
//!   02-first-prompt.txt
//!   03-first-response.txt
//!   04-retrieval.json
//!   05-second-prompt.txt
//!   06-second-response.txt
//!   07-outcome.json
//! ```

use std::path::{Path, PathBuf};

use uuid::Uuid;

pub const ENTITIES_FILE: &str = "01-entities.json";
pub const FIRST_PROMPT_FILE: &str = "02-first-prompt.txt";
pub const FIRST_RESPONSE_FILE: &str = "03-first-response.txt";
pub const RETRIEVAL_FILE: &str = "04-retrieval.json";
pub const SECOND_PROMPT_FILE: &str = "05-second-prompt.txt";
pub const SECOND_RESPONSE_FILE: &str = "06-second-response.txt";
pub const OUTCOME_FILE: &str = "07-outcome.json";

// ──────────────────────────────────────────────
// Dump directory resolution
// ──────────────────────────────────────────────

/// Returns the dump directory for a run, or `None` if diagnostics are disabled.
///
/// Creates the directory tree on first call. Returns `None` (with a warning) if
/// directory creation fails. Never blocks the pipeline.
pub fn dump_dir_for(base: Option<&Path>, run_id: &Uuid) -> Option<PathBuf> {
    let dir = base?.join(run_id.to_string());

    if let Err(e) = std::fs::create_dir_all(&dir) {
        tracing::warn!(
            path = %dir.display(),
            error = %e,
            "Diagnostic dump: failed to create directory"
        );
        return None;
    }

    Some(dir)
}

// ──────────────────────────────────────────────
// Dump writers
// ──────────────────────────────────────────────

/// Pretty-printed JSON. Nothing is written if `value` does not serialize.
pub fn dump_json<T: serde::Serialize>(dir: &Path, filename: &str, value: &T) {
    match serde_json::to_vec_pretty(value) {
        Ok(json) => write_artifact(dir, filename, &json),
        Err(e) => tracing::warn!(artifact = filename, error = %e, "Dump skipped: not serializable"),
    }
}

pub fn dump_text(dir: &Path, filename: &str, text: &str) {
    write_artifact(dir, filename, text.as_bytes());
}

// Failures are logged and dropped; a dump never fails the run.
fn write_artifact(dir: &Path, filename: &str, bytes: &[u8]) {
    let path = dir.join(filename);
    if let Err(e) = std::fs::write(&path, bytes) {
        tracing::warn!(path = %path.display(), error = %e, "Dump write failed");
        return;
    }
    tracing::debug!(artifact = filename, bytes = bytes.len(), "Dump written");
}

// ──────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────
