//! S3-backed artifact store.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::cache::{ArtifactFile, ArtifactStore};
use crate::errors::{Error, Result};

use super::client::{meta_from_headers, PutBody, S3Client};

pub struct S3Artifacts {
    client: Arc<S3Client>,
    prefix: String,
    tmp_base: PathBuf,
}

impl S3Artifacts {
    pub fn new(client: Arc<S3Client>, prefix: String, tmp_base: PathBuf) -> Self {
        Self {
            client,
            prefix,
            tmp_base,
        }
    }

    fn object_key(&self, key: &str) -> String {
        let trimmed = key.trim_start_matches('/');
        if self.prefix.is_empty() {
            trimmed.to_string()
        } else {
            format!("{}/{trimmed}", self.prefix)
        }
    }
}

impl ArtifactStore for S3Artifacts {
    fn has(&self, key: &str) -> Result<bool> {
        match self.client.head_object(&self.object_key(key)) {
            Ok(_) => Ok(true),
            Err(Error::S3NotFound) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Downloads the artifact into a temp file, verifying the stored
    /// `sha256` metadata while streaming.
    fn fetch(&self, key: &str) -> Result<ArtifactFile> {
        let mut tmp = self.temp_file(".artifact-")?;
        let mut response = self.client.get_object(&self.object_key(key))?;
        let meta = meta_from_headers(response.headers());

        let mut hasher = Sha256::new();
        let mut writer = HashingWriter {
            inner: tmp.as_file_mut(),
            hasher: &mut hasher,
        };
        response.copy_to(&mut writer)?;
        tmp.as_file_mut().flush()?;

        let actual = hex::encode(hasher.finalize());
        if let Some(expected) = meta.get("sha256").map(String::as_str).filter(|s| !s.is_empty()) {
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(Error::S3ArtifactSha256Mismatch {
                    expected: expected.to_string(),
                    actual,
                });
            }
        }
        Ok(ArtifactFile::staged(tmp, meta))
    }

    fn temp_file(&self, prefix: &str) -> Result<NamedTempFile> {
        let base = if self.tmp_base.as_os_str().is_empty() {
            std::env::temp_dir()
        } else {
            self.tmp_base.clone()
        };
        Ok(tempfile::Builder::new().prefix(prefix).tempfile_in(base)?)
    }

    /// Uploads the staged file with its SHA-256 in user metadata. The temp
    /// file stays alive inside the returned artifact for local use.
    fn commit(
        &self,
        key: &str,
        tmp: NamedTempFile,
        mut meta: BTreeMap<String, String>,
    ) -> Result<ArtifactFile> {
        let size = tmp.as_file().metadata()?.len();
        let payload_hash = match meta.get("sha256").map(String::as_str).filter(|s| !s.is_empty()) {
            Some(hash) => hash.to_string(),
            None => {
                let hash = gx_archive::file_hash_sha256(tmp.path())?;
                meta.insert("sha256".to_string(), hash.clone());
                hash
            }
        };
        self.client.put_object(
            &self.object_key(key),
            PutBody::File(tmp.path().to_path_buf(), size),
            "application/gzip",
            "",
            &meta,
            false,
            &payload_hash,
        )?;
        Ok(ArtifactFile::staged(tmp, meta))
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.client.delete_object(&self.object_key(key))
    }
}

struct HashingWriter<'a> {
    inner: &'a mut std::fs::File,
    hasher: &'a mut Sha256,
}

impl Write for HashingWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.hasher.update(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}
