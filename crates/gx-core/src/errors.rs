//! Error taxonomy for gx-core.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    // Requirements input.
    #[error("invalid collection entry: {0}")]
    InvalidCollectionEntry(String),
    #[error("invalid collection name: {0:?}")]
    InvalidCollectionName(String),
    #[error("invalid collection key: {0:?}")]
    InvalidCollectionKey(String),
    #[error("empty collection name")]
    EmptyCollectionName,
    #[error("unsupported collection source {0:?} (only Galaxy API sources are supported)")]
    UnsupportedCollectionSource(String),
    #[error("unsupported collection type {0:?} (only galaxy is supported)")]
    UnsupportedCollectionType(String),
    #[error("unsupported requirements file format")]
    UnsupportedRequirementsFormat,
    #[error("invalid collections list")]
    InvalidCollectionsList,
    #[error("unsupported collection format: {0}")]
    UnsupportedCollectionFormat(String),
    #[error("duplicate collection requirement for {0}")]
    DuplicateCollectionRequirement(String),
    #[error("duplicate collection entry: {0}")]
    DuplicateCollectionKey(String),

    // Resolution.
    #[error("conflicting root constraints for {fqdn}: {existing:?} vs {incoming:?}")]
    ConflictingRootConstraints {
        fqdn: String,
        existing: String,
        incoming: String,
    },
    #[error("conflicting exact versions: {0} vs {1}")]
    ConflictingExactVersions(String, String),
    #[error("no version satisfies constraints: {0:?}")]
    NoVersionSatisfiesConstraints(Vec<String>),
    #[error("no semver candidates available")]
    NoSemverCandidates,
    #[error("dependency graph has a cycle")]
    DependencyGraphHasACycle,
    #[error("versions payload is empty")]
    VersionsPayloadEmpty,
    #[error("unsupported versions payload")]
    VersionsPayloadUnsupported,
    #[error("invalid version {value:?}: {source}")]
    InvalidVersion {
        value: String,
        #[source]
        source: semver::Error,
    },
    #[error("invalid constraint {value:?}: {source}")]
    InvalidConstraint {
        value: String,
        #[source]
        source: semver::Error,
    },
    #[error("missing resolved parent: {0}")]
    MissingResolvedParent(String),
    #[error("missing resolved dependency: {0}")]
    MissingResolvedDependency(String),
    #[error("missing resolved root: {0}")]
    MissingResolvedRoot(String),
    #[error("missing collection for: {0}")]
    MissingCollection(String),
    #[error("invalid dependency key {0:?}")]
    InvalidDependencyKey(String),

    // Download and integrity.
    #[error("download failed: {url} ({status})")]
    DownloadFailed { url: String, status: String },
    #[error("sha256 mismatch: {expected} != {actual}")]
    Sha256Mismatch { expected: String, actual: String },
    #[error("missing download url")]
    MissingDownloadUrl,
    #[error("metadata unavailable")]
    MetadataUnavailable,
    #[error("failed to load collection metadata")]
    LoadMetadataFailed,
    #[error("artifact cache is not configured")]
    ArtifactCacheNotConfigured,
    #[error("installation failed for {0} collections")]
    InstallationFailed(u32),

    // HTTP.
    #[error("failed to fetch metadata: {status} ({url})")]
    HttpStatus {
        url: String,
        status: String,
        code: u16,
    },

    // S3 backend.
    #[error("s3 cache requires access/secret keys when the bucket is set")]
    S3EmptyCreds,
    #[error("s3 invalid endpoint: {0}")]
    S3InvalidEndpoint(String),
    #[error("s3 object not found")]
    S3NotFound,
    #[error("s3 bucket not found")]
    S3BucketNotFound,
    #[error("s3 precondition failed")]
    S3PreconditionFailed,
    #[error("s3 lock already exists: {0}")]
    S3LockExists(String),
    #[error("s3 lock timestamp is missing")]
    S3LockTimestampMissing,
    #[error("s3 bucket head failed: {0}")]
    S3BucketHeadFailed(String),
    #[error("s3 create bucket failed: {0}")]
    S3CreateBucketFailed(String),
    #[error("s3 get object failed: {0}")]
    S3GetFailed(String),
    #[error("s3 head object failed: {0}")]
    S3HeadFailed(String),
    #[error("s3 put object failed: {0}")]
    S3PutFailed(String),
    #[error("s3 delete object failed: {0}")]
    S3DeleteFailed(String),
    #[error("s3 artifact sha256 mismatch: {actual} != {expected}")]
    S3ArtifactSha256Mismatch { expected: String, actual: String },

    // Config.
    #[error("failed to parse ansible config: {0}")]
    AnsibleConfig(String),

    // Wrapped lower layers.
    #[error(transparent)]
    Archive(#[from] gx_archive::ArchiveError),
    #[error(transparent)]
    Store(#[from] gx_store::StoreError),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Reports whether this is an HTTP status error with the given code.
    pub fn is_http_status(&self, want: u16) -> bool {
        matches!(self, Error::HttpStatus { code, .. } if *code == want)
    }
}
