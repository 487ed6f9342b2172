//! Picking up the producer container's output from the shared volume.
//!
//! The producer signals completion by writing the path of its result file
//! into `done` inside the results directory. Relative paths are resolved
//! against that directory.

use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use sonde_core::Submission;
use sonde_model::routes::DEFAULT_MIME_TYPE;
use tracing::{debug, info};

/// Marker file the producer writes once its result is in place.
pub const DONE_FILE: &str = "done";

/// Block until `results_dir/done` names a result file, and return its path.
pub async fn wait_for_result(
    results_dir: &Path,
    poll: Duration,
) -> io::Result<PathBuf> {
    let marker = results_dir.join(DONE_FILE);
    info!(marker = %marker.display(), "waiting for plugin results");

    loop {
        match tokio::fs::read_to_string(&marker).await {
            Ok(contents) if !contents.trim().is_empty() => {
                let named = Path::new(contents.trim());
                let path = if named.is_absolute() {
                    named.to_path_buf()
                } else {
                    results_dir.join(named)
                };
                info!(result = %path.display(), "plugin reported done");
                return Ok(path);
            }
            // Written but not yet flushed.
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        debug!("results not ready");
        tokio::time::sleep(poll).await;
    }
}

/// Read the result file into a submission, typed by its extension.
pub async fn read_result(path: &Path) -> io::Result<Submission> {
    let payload = tokio::fs::read(path).await?;
    let mime_type = mime_for(path);
    debug!(
        result = %path.display(),
        bytes = payload.len(),
        mime_type,
        "read plugin result"
    );
    Ok(Submission::new(payload, mime_type))
}

pub fn mime_for(path: &Path) -> &'static str {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();

    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        "application/gzip"
    } else if name.ends_with(".json") {
        "application/json"
    } else {
        DEFAULT_MIME_TYPE
    }
}
