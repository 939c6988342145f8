use std::path::Path;
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::download::constants::TEMP_SUFFIX;

/// Removes `*.tmp` files under `root` not modified for at least `max_age`.
/// Returns the number of files removed.
pub(super) fn sweep_stale_temp_files(root: &Path, max_age: Duration) -> usize {
    sweep_stale_temp_files_at(root, max_age, SystemTime::now())
}

fn sweep_stale_temp_files_at(root: &Path, max_age: Duration, now: SystemTime) -> usize {
    let mut removed = 0;
    for entry in WalkDir::new(root).into_iter().filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let is_temp = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.ends_with(TEMP_SUFFIX));
        if !is_temp {
            continue;
        }

        let age = entry
            .metadata()
            .ok()
            .and_then(|meta| meta.modified().ok())
            .and_then(|modified| now.duration_since(modified).ok());
        let Some(age) = age else {
            continue;
        };
        if age < max_age {
            continue;
        }

        match std::fs::remove_file(entry.path()) {
            Ok(()) => {
                debug!(
                    path = %entry.path().display(),
                    age_secs = age.as_secs(),
                    "removed stale temp file"
                );
                removed += 1;
            }
            Err(error) => {
                warn!(path = %entry.path().display(), %error, "could not remove stale temp file");
            }
        }
    }
    removed
}
