//! Registry of projects that have installed collections with this cache.
//!
//! Cleanup seeds its reachability scan from these records.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{Result, PROJECTS_FILE};

/// A project and its last-run metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub requirements_file: String,
    #[serde(default)]
    pub collections_path: String,
    #[serde(with = "time::serde::rfc3339")]
    pub last_run: OffsetDateTime,
}

/// Known projects keyed by absolute project directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectRegistry {
    #[serde(default)]
    pub projects: BTreeMap<String, ProjectRecord>,
}

/// Upserts a project entry, stamping the current time.
pub fn record_project(cache_dir: &Path, requirements_file: &Path, download_path: &str) -> Result<()> {
    if cache_dir.as_os_str().is_empty() {
        return Ok(());
    }
    let abs_req = absolutize(requirements_file);
    let project_path = abs_req
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("/"));
    let collections_path = resolve_collections_path(&project_path, download_path);

    let mut registry = load_project_registry(cache_dir)?;
    registry.projects.insert(
        project_path.display().to_string(),
        ProjectRecord {
            requirements_file: abs_req.display().to_string(),
            collections_path,
            last_run: OffsetDateTime::now_utc(),
        },
    );
    save_project_registry(cache_dir, &registry)
}

/// Loads the registry; a missing or unparseable file is an empty registry.
pub fn load_project_registry(cache_dir: &Path) -> Result<ProjectRegistry> {
    let path = registry_path(cache_dir);
    let data = match fs::read(&path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(ProjectRegistry::default())
        }
        Err(err) => return Err(err.into()),
    };
    Ok(serde_json::from_slice(&data).unwrap_or_default())
}

fn save_project_registry(cache_dir: &Path, registry: &ProjectRegistry) -> Result<()> {
    let path = registry_path(cache_dir);
    fs::create_dir_all(cache_dir)?;
    let payload = serde_json::to_vec_pretty(registry)?;
    let mut tmp = tempfile::Builder::new()
        .prefix(".projects-")
        .tempfile_in(cache_dir)?;
    tmp.write_all(&payload)?;
    tmp.persist(&path).map_err(|err| err.error)?;
    Ok(())
}

fn registry_path(cache_dir: &Path) -> PathBuf {
    cache_dir.join(PROJECTS_FILE)
}

/// Returns an absolute collections path for a project directory.
pub fn resolve_collections_path(project_path: &Path, download_path: &str) -> String {
    if download_path.is_empty() {
        return String::new();
    }
    let download = Path::new(download_path);
    if download.is_absolute() {
        return download_path.to_string();
    }
    project_path.join(download).display().to_string()
}

fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_loads_projects() {
        let temp = tempfile::tempdir().unwrap();
        let project = temp.path().join("project");
        fs::create_dir_all(&project).unwrap();
        let requirements = project.join("requirements.yml");
        fs::write(&requirements, "collections: []\n").unwrap();

        record_project(temp.path(), &requirements, ".collections").unwrap();

        let registry = load_project_registry(temp.path()).unwrap();
        let record = registry
            .projects
            .get(&project.display().to_string())
            .expect("project recorded");
        assert_eq!(record.requirements_file, requirements.display().to_string());
        assert_eq!(
            record.collections_path,
            project.join(".collections").display().to_string()
        );
    }

    #[test]
    fn missing_registry_is_empty() {
        let temp = tempfile::tempdir().unwrap();
        let registry = load_project_registry(temp.path()).unwrap();
        assert!(registry.projects.is_empty());
    }

    #[test]
    fn malformed_registry_is_empty() {
        let temp = tempfile::tempdir().unwrap();
        fs::write(registry_path(temp.path()), b"{broken").unwrap();
        let registry = load_project_registry(temp.path()).unwrap();
        assert!(registry.projects.is_empty());
    }

    #[test]
    fn absolute_download_paths_pass_through() {
        assert_eq!(
            resolve_collections_path(Path::new("/work/project"), "/srv/collections"),
            "/srv/collections"
        );
        assert_eq!(
            resolve_collections_path(Path::new("/work/project"), ""),
            ""
        );
    }
}
