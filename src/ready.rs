// ABOUTME: Readiness marker file checked by the pod's readiness check
// ABOUTME: Written once the reconcilers are constructed, removed on graceful shutdown

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Create the marker file, including missing parent directories.
pub fn mark_ready(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }
    }

    fs::write(path, std::process::id().to_string())
        .with_context(|| format!("Failed to write ready file: {:?}", path))?;

    tracing::debug!("Wrote ready file {:?}", path);
    Ok(())
}

/// Remove the marker file. A missing file is not an error.
pub fn clear_ready(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_file(path)
            .with_context(|| format!("Failed to remove ready file: {:?}", path))?;
    }

    Ok(())
}

pub fn is_ready(path: &Path) -> bool {
    path.is_file()
}
