//! Safe extraction of gzipped collection tarballs.
//!
//! Galaxy artifacts come from remote servers, so every tar entry is treated
//! as hostile: paths are sanitized lexically, symlink/hardlink targets must
//! stay inside the destination, and per-entry and per-archive size caps
//! bound what a decompression bomb can write.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use tar::{Archive, Entry, EntryType};
use thiserror::Error;

/// Maximum size of a single regular-file entry (512 MiB).
pub const MAX_ENTRY_SIZE: u64 = 512 << 20;
/// Maximum total bytes extracted from one archive (4 GiB).
pub const MAX_ARCHIVE_SIZE: u64 = 4 << 30;

pub type Result<T> = std::result::Result<T, ArchiveError>;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("file is empty: {0}")]
    EmptyFile(PathBuf),
    #[error("archive entry has empty name")]
    EmptyEntryName,
    #[error("archive entry is absolute path: {0}")]
    EntryIsAbsolutePath(String),
    #[error("archive entry escapes destination: {0}")]
    EntryEscapesDestination(String),
    #[error("archive path contains symlink component: {0}")]
    PathContainsSymlinkComponent(PathBuf),
    #[error("archive entry is too large: {name} ({size} bytes)")]
    EntryIsTooLarge { name: String, size: u64 },
    #[error("archive exceeds maximum total size: {0} bytes")]
    ExceedsMaxSize(u64),
    #[error("symlink target is empty for {0}")]
    SymlinkTargetIsEmpty(String),
    #[error("symlink target is absolute: {0}")]
    SymlinkTargetIsAbsolute(String),
    #[error("symlink target is invalid: {0}")]
    SymlinkTargetIsInvalid(String),
    #[error("symlink target resolves to root: {0}")]
    SymlinkTargetResolvesToRoot(String),
    #[error("symlink target escapes destination: {0}")]
    SymlinkTargetEscapesDestination(String),
    #[error("symlink target resolves to self: {0}")]
    SymlinkTargetResolvesToSelf(String),
    #[error("hardlink target is empty for {0}")]
    HardlinkTargetIsEmpty(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Extracts a tar.gz archive into `dst_dir` with safety checks.
pub fn extract_tar_gz(tar_gz_path: &Path, dst_dir: &Path) -> Result<()> {
    let info = fs::metadata(tar_gz_path)?;
    if info.len() == 0 {
        return Err(ArchiveError::EmptyFile(tar_gz_path.to_path_buf()));
    }

    let file = File::open(tar_gz_path)?;
    let mut archive = Archive::new(GzDecoder::new(file));

    let mut extracted: u64 = 0;
    for entry in archive.entries()? {
        let entry = entry?;
        handle_entry(entry, dst_dir, &mut extracted)?;
    }
    Ok(())
}

/// Calculates the hex SHA-256 hash of a file on disk.
pub fn file_hash_sha256(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 32 * 1024];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn handle_entry<R: Read>(mut entry: Entry<'_, R>, dst_dir: &Path, extracted: &mut u64) -> Result<()> {
    let raw_name = entry.path()?.into_owned();
    let Some(rel_path) = sanitize_entry_path(&raw_name)? else {
        return Ok(());
    };
    let target_path = dst_dir.join(&rel_path);
    ensure_no_symlink_parents(dst_dir, &rel_path)?;

    let entry_type = entry.header().entry_type();
    match entry_type {
        EntryType::Directory => extract_dir(&target_path),
        EntryType::Regular => extract_regular_file(&mut entry, &target_path, extracted),
        EntryType::Symlink => extract_symlink(&entry, &rel_path, &target_path),
        EntryType::Link => extract_hardlink(&entry, dst_dir, &target_path),
        _ => Ok(()),
    }
}

fn extract_dir(target_path: &Path) -> Result<()> {
    fs::create_dir_all(target_path)?;
    set_mode(target_path, 0o755)
}

fn extract_regular_file<R: Read>(
    entry: &mut Entry<'_, R>,
    target_path: &Path,
    extracted: &mut u64,
) -> Result<()> {
    let name = entry.path()?.display().to_string();
    let size = entry.header().size()?;
    if size > MAX_ENTRY_SIZE {
        return Err(ArchiveError::EntryIsTooLarge { name, size });
    }
    if *extracted + size > MAX_ARCHIVE_SIZE {
        return Err(ArchiveError::ExceedsMaxSize(MAX_ARCHIVE_SIZE));
    }
    if let Some(parent) = target_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mode = entry.header().mode().unwrap_or(0o644) & 0o777;
    let mut file = File::create(target_path)?;
    let written = io::copy(&mut entry.by_ref().take(size), &mut file)?;
    *extracted += written;
    drop(file);
    set_mode(target_path, mode)
}

fn extract_symlink<R: Read>(entry: &Entry<'_, R>, rel_path: &Path, target_path: &Path) -> Result<()> {
    let name = rel_path.display().to_string();
    let link_name = entry
        .link_name()?
        .ok_or_else(|| ArchiveError::SymlinkTargetIsEmpty(name.clone()))?
        .into_owned();
    let link_target = safe_symlink_target(rel_path, &link_name)?;
    if let Some(parent) = target_path.parent() {
        fs::create_dir_all(parent)?;
    }
    make_symlink(&link_target, target_path)
}

fn extract_hardlink<R: Read>(entry: &Entry<'_, R>, dst_dir: &Path, target_path: &Path) -> Result<()> {
    let name = entry.path()?.display().to_string();
    let link_name = entry
        .link_name()?
        .ok_or_else(|| ArchiveError::HardlinkTargetIsEmpty(name.clone()))?
        .into_owned();
    let link_rel = sanitize_entry_path(&link_name)?
        .ok_or_else(|| ArchiveError::HardlinkTargetIsEmpty(name.clone()))?;
    ensure_no_symlink_parents(dst_dir, &link_rel)?;
    let target = dst_dir.join(link_rel);
    if let Some(parent) = target_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::hard_link(target, target_path)?;
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn make_symlink(link_target: &Path, target_path: &Path) -> Result<()> {
    std::os::unix::fs::symlink(link_target, target_path)?;
    Ok(())
}

#[cfg(not(unix))]
fn make_symlink(_link_target: &Path, _target_path: &Path) -> Result<()> {
    Ok(())
}

/// Validates and lexically normalizes a tar entry path.
///
/// Returns `None` for entries that normalize to the archive root (`.`).
fn sanitize_entry_path(name: &Path) -> Result<Option<PathBuf>> {
    if name.as_os_str().is_empty() {
        return Err(ArchiveError::EmptyEntryName);
    }
    let mut parts: Vec<std::ffi::OsString> = Vec::new();
    for component in name.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => {
                return Err(ArchiveError::EntryIsAbsolutePath(name.display().to_string()));
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(ArchiveError::EntryEscapesDestination(
                        name.display().to_string(),
                    ));
                }
            }
            Component::Normal(part) => parts.push(part.to_os_string()),
        }
    }
    if parts.is_empty() {
        return Ok(None);
    }
    Ok(Some(parts.iter().collect()))
}

/// Rejects entry paths that traverse an on-disk symlink component.
fn ensure_no_symlink_parents(base_dir: &Path, rel_path: &Path) -> Result<()> {
    let mut current = base_dir.to_path_buf();
    for part in rel_path.components() {
        let Component::Normal(part) = part else {
            continue;
        };
        current.push(part);
        match fs::symlink_metadata(&current) {
            Ok(info) => {
                if info.file_type().is_symlink() {
                    return Err(ArchiveError::PathContainsSymlinkComponent(current));
                }
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

/// Validates a symlink target and returns it relative to the entry's parent.
fn safe_symlink_target(rel_path: &Path, link_name: &Path) -> Result<PathBuf> {
    let display = link_name.display().to_string();
    if link_name.as_os_str().is_empty() {
        return Err(ArchiveError::SymlinkTargetIsEmpty(
            rel_path.display().to_string(),
        ));
    }
    if link_name.has_root() || has_volume_prefix(link_name) {
        return Err(ArchiveError::SymlinkTargetIsAbsolute(display));
    }
    let cleaned = clean_relative(link_name);
    if cleaned == CleanPath::Root {
        return Err(ArchiveError::SymlinkTargetIsInvalid(display));
    }

    let base_dir = rel_path.parent().unwrap_or_else(|| Path::new(""));
    let mut joined = base_dir.to_path_buf();
    joined.push(cleaned.as_path());
    match clean_relative(&joined) {
        CleanPath::Root => Err(ArchiveError::SymlinkTargetResolvesToRoot(display)),
        CleanPath::Escaping(_) => Err(ArchiveError::SymlinkTargetEscapesDestination(display)),
        CleanPath::Inside(resolved) => {
            let rel_target = relative_to(base_dir, &resolved);
            if rel_target.as_os_str().is_empty() || rel_target == Path::new(".") {
                return Err(ArchiveError::SymlinkTargetResolvesToSelf(display));
            }
            Ok(rel_target)
        }
    }
}

#[derive(Debug, PartialEq)]
enum CleanPath {
    /// Normalizes to `.`.
    Root,
    /// Keeps one or more leading `..` components.
    Escaping(PathBuf),
    Inside(PathBuf),
}

impl CleanPath {
    fn as_path(&self) -> &Path {
        match self {
            CleanPath::Root => Path::new("."),
            CleanPath::Escaping(path) | CleanPath::Inside(path) => path,
        }
    }
}

/// Lexically cleans a relative path, preserving leading `..` components.
fn clean_relative(path: &Path) -> CleanPath {
    let mut ups = 0usize;
    let mut parts: Vec<std::ffi::OsString> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir | Component::Prefix(_) | Component::RootDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    ups += 1;
                }
            }
            Component::Normal(part) => parts.push(part.to_os_string()),
        }
    }
    if ups == 0 && parts.is_empty() {
        return CleanPath::Root;
    }
    let mut out = PathBuf::new();
    for _ in 0..ups {
        out.push("..");
    }
    for part in &parts {
        out.push(part);
    }
    if ups > 0 {
        CleanPath::Escaping(out)
    } else {
        CleanPath::Inside(out)
    }
}

/// Computes `target` relative to `base` for two cleaned relative paths.
fn relative_to(base: &Path, target: &Path) -> PathBuf {
    let base_parts: Vec<_> = base.components().collect();
    let target_parts: Vec<_> = target.components().collect();
    let common = base_parts
        .iter()
        .zip(target_parts.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let mut out = PathBuf::new();
    for _ in common..base_parts.len() {
        out.push("..");
    }
    for part in &target_parts[common..] {
        out.push(part);
    }
    out
}

fn has_volume_prefix(path: &Path) -> bool {
    matches!(path.components().next(), Some(Component::Prefix(_)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn build_tar_gz(build: impl FnOnce(&mut tar::Builder<Vec<u8>>)) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        build(&mut builder);
        let tar_bytes = builder.into_inner().expect("finish tar");
        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(&tar_bytes).expect("gzip write");
        encoder.finish().expect("gzip finish")
    }

    fn write_archive(dir: &Path, payload: &[u8]) -> PathBuf {
        let path = dir.join("archive.tar.gz");
        fs::write(&path, payload).expect("write archive");
        path
    }

    // Entry names are written straight into the raw header bytes rather than
    // via `append_data`/`append_link`, since those validate the path (and
    // reject the `..`-escaping names these tests intentionally construct).
    fn set_raw_name(header: &mut tar::Header, name: &str) {
        let bytes = name.as_bytes();
        let field = &mut header.as_old_mut().name;
        assert!(bytes.len() < field.len(), "test entry name too long");
        field[..bytes.len()].copy_from_slice(bytes);
        field[bytes.len()..].fill(0);
    }

    fn add_file(builder: &mut tar::Builder<Vec<u8>>, name: &str, body: &[u8], mode: u32) {
        let mut header = tar::Header::new_gnu();
        set_raw_name(&mut header, name);
        header.set_size(body.len() as u64);
        header.set_mode(mode);
        header.set_cksum();
        builder.append(&header, body).expect("append file");
    }

    fn add_symlink(builder: &mut tar::Builder<Vec<u8>>, name: &str, target: &str) {
        let mut header = tar::Header::new_gnu();
        set_raw_name(&mut header, name);
        header.set_entry_type(EntryType::Symlink);
        header.set_size(0);
        header.set_link_name_literal(target).expect("set link name");
        header.set_cksum();
        builder.append(&header, io::empty()).expect("append symlink");
    }

    #[test]
    fn sanitize_entry_paths() {
        let ok = sanitize_entry_path(Path::new("a/b/./c")).unwrap();
        assert_eq!(ok, Some(PathBuf::from("a/b/c")));

        let collapsed = sanitize_entry_path(Path::new("a/../b")).unwrap();
        assert_eq!(collapsed, Some(PathBuf::from("b")));

        assert_eq!(sanitize_entry_path(Path::new("./")).unwrap(), None);

        assert!(matches!(
            sanitize_entry_path(Path::new("/etc/passwd")),
            Err(ArchiveError::EntryIsAbsolutePath(_))
        ));
        assert!(matches!(
            sanitize_entry_path(Path::new("../outside")),
            Err(ArchiveError::EntryEscapesDestination(_))
        ));
        assert!(matches!(
            sanitize_entry_path(Path::new("a/../../outside")),
            Err(ArchiveError::EntryEscapesDestination(_))
        ));
        assert!(matches!(
            sanitize_entry_path(Path::new("")),
            Err(ArchiveError::EmptyEntryName)
        ));
    }

    #[test]
    fn extracts_files_dirs_and_symlinks() {
        let temp = tempfile::tempdir().unwrap();
        let payload = build_tar_gz(|builder| {
            add_file(builder, "col/MANIFEST.json", b"{}", 0o644);
            add_file(builder, "col/plugins/run.sh", b"#!/bin/sh\n", 0o755);
            add_symlink(builder, "col/plugins/alias.sh", "run.sh");
        });
        let archive = write_archive(temp.path(), &payload);
        let dst = temp.path().join("out");
        fs::create_dir_all(&dst).unwrap();

        extract_tar_gz(&archive, &dst).expect("extract");

        assert_eq!(fs::read(dst.join("col/MANIFEST.json")).unwrap(), b"{}");
        assert_eq!(
            fs::read(dst.join("col/plugins/run.sh")).unwrap(),
            b"#!/bin/sh\n"
        );
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(dst.join("col/plugins/run.sh"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o755);
            let link = fs::read_link(dst.join("col/plugins/alias.sh")).unwrap();
            assert_eq!(link, PathBuf::from("run.sh"));
        }
    }

    #[test]
    fn extraction_is_repeatable() {
        let temp = tempfile::tempdir().unwrap();
        let payload = build_tar_gz(|builder| {
            add_file(builder, "col/galaxy.yml", b"namespace: demo\n", 0o644);
            add_file(builder, "col/roles/main.yml", b"---\n", 0o600);
        });
        let archive = write_archive(temp.path(), &payload);
        let first = temp.path().join("d1");
        let second = temp.path().join("d2");
        fs::create_dir_all(&first).unwrap();
        fs::create_dir_all(&second).unwrap();

        extract_tar_gz(&archive, &first).expect("first extract");
        extract_tar_gz(&archive, &second).expect("second extract");

        for rel in ["col/galaxy.yml", "col/roles/main.yml"] {
            assert_eq!(
                fs::read(first.join(rel)).unwrap(),
                fs::read(second.join(rel)).unwrap()
            );
        }
    }

    #[test]
    fn rejects_escaping_entries() {
        let temp = tempfile::tempdir().unwrap();
        let payload = build_tar_gz(|builder| {
            add_file(builder, "../evil.txt", b"gotcha", 0o644);
        });
        let archive = write_archive(temp.path(), &payload);
        let dst = temp.path().join("out");
        fs::create_dir_all(&dst).unwrap();

        let err = extract_tar_gz(&archive, &dst).unwrap_err();
        assert!(matches!(err, ArchiveError::EntryEscapesDestination(_)));
        assert!(!temp.path().join("evil.txt").exists());
    }

    #[test]
    fn rejects_escaping_symlink_targets() {
        let temp = tempfile::tempdir().unwrap();
        let payload = build_tar_gz(|builder| {
            add_symlink(builder, "col/escape", "../../outside");
        });
        let archive = write_archive(temp.path(), &payload);
        let dst = temp.path().join("out");
        fs::create_dir_all(&dst).unwrap();

        let err = extract_tar_gz(&archive, &dst).unwrap_err();
        assert!(matches!(
            err,
            ArchiveError::SymlinkTargetEscapesDestination(_)
        ));
    }

    #[test]
    fn rejects_absolute_symlink_targets() {
        let temp = tempfile::tempdir().unwrap();
        let payload = build_tar_gz(|builder| {
            add_symlink(builder, "col/abs", "/etc/passwd");
        });
        let archive = write_archive(temp.path(), &payload);
        let dst = temp.path().join("out");
        fs::create_dir_all(&dst).unwrap();

        let err = extract_tar_gz(&archive, &dst).unwrap_err();
        assert!(matches!(err, ArchiveError::SymlinkTargetIsAbsolute(_)));
    }

    #[test]
    fn rejects_self_symlink_targets() {
        let temp = tempfile::tempdir().unwrap();
        let payload = build_tar_gz(|builder| {
            add_symlink(builder, "col/loop", "./");
        });
        let archive = write_archive(temp.path(), &payload);
        let dst = temp.path().join("out");
        fs::create_dir_all(&dst).unwrap();

        let err = extract_tar_gz(&archive, &dst).unwrap_err();
        assert!(matches!(err, ArchiveError::SymlinkTargetIsInvalid(_)));
    }

    #[test]
    fn rejects_oversized_declared_entries() {
        let temp = tempfile::tempdir().unwrap();
        // Declared size over the cap; the guard trips before any bytes are
        // read, so the archive only needs the header to be present.
        let mut header = tar::Header::new_gnu();
        header.set_path("col/huge.bin").unwrap();
        header.set_entry_type(EntryType::Regular);
        header.set_size(MAX_ENTRY_SIZE + 1);
        header.set_mode(0o644);
        header.set_cksum();

        let mut tar_bytes = Vec::new();
        tar_bytes.extend_from_slice(header.as_bytes());
        tar_bytes.extend_from_slice(&[0u8; 1024]);

        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(&tar_bytes).unwrap();
        let payload = encoder.finish().unwrap();
        let archive = write_archive(temp.path(), &payload);
        let dst = temp.path().join("out");
        fs::create_dir_all(&dst).unwrap();

        let err = extract_tar_gz(&archive, &dst).unwrap_err();
        assert!(matches!(err, ArchiveError::EntryIsTooLarge { .. }));
    }

    #[test]
    fn rejects_empty_archives() {
        let temp = tempfile::tempdir().unwrap();
        let archive = temp.path().join("empty.tar.gz");
        fs::write(&archive, b"").unwrap();
        let err = extract_tar_gz(&archive, temp.path()).unwrap_err();
        assert!(matches!(err, ArchiveError::EmptyFile(_)));
    }

    #[test]
    fn hashes_files() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("blob");
        fs::write(&path, b"hello").unwrap();
        let expected = hex::encode(Sha256::digest(b"hello"));
        assert_eq!(file_hash_sha256(&path).unwrap(), expected);
    }
}
