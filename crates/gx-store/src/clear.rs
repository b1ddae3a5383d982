//! Clear-cache-files policy for the local cache directory.

use std::fs;
use std::io;
use std::path::Path;

use crate::{
    Result, DB_API_CACHE, DB_DEPS_CACHE, DB_GRAPH, DB_INSTALLED, DB_META, DB_REQUIREMENTS,
    DB_RESOLVED, DB_ROOTS, DB_VERSIONS, LOCK_FILE, PROJECTS_FILE,
};

/// Removes artifact blobs, staging files, the lock file, and the cache-only
/// bucket databases. Durable buckets and the project registry survive.
pub fn clear_cache_files(cache_dir: &Path) -> Result<()> {
    let entries = match fs::read_dir(cache_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };

    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !should_delete(&name) {
            continue;
        }
        match fs::remove_file(entry.path()) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn should_delete(name: &str) -> bool {
    const DELETE: &[&str] = &[DB_API_CACHE, DB_DEPS_CACHE, DB_VERSIONS, LOCK_FILE];
    const KEEP: &[&str] = &[
        DB_META,
        DB_INSTALLED,
        DB_GRAPH,
        DB_REQUIREMENTS,
        DB_ROOTS,
        DB_RESOLVED,
        PROJECTS_FILE,
    ];

    if DELETE.contains(&name) {
        return true;
    }
    if KEEP.contains(&name) {
        return false;
    }
    name.ends_with(".tar.gz") || name.starts_with(".download-") || name.ends_with(".tmp")
}
