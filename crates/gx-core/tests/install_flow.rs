//! End-to-end install and cleanup flows against a Galaxy-like mock server.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;
use httpmock::prelude::*;
use serde_json::json;
use sha2::{Digest, Sha256};

use gx_core::{run_cleanup, run_install, Config, Error, Infra, MemoryPrinter};

struct TestEnv {
    _root: tempfile::TempDir,
    cache_dir: PathBuf,
    download_path: PathBuf,
    project_dir: PathBuf,
    requirements_file: PathBuf,
}

impl TestEnv {
    fn new() -> Self {
        let root = tempfile::tempdir().expect("tempdir");
        let cache_dir = root.path().join("cache");
        let project_dir = root.path().join("project");
        let download_path = project_dir.join(".collections");
        fs::create_dir_all(&project_dir).unwrap();
        let requirements_file = project_dir.join("requirements.yml");
        Self {
            _root: root,
            cache_dir,
            download_path,
            project_dir,
            requirements_file,
        }
    }

    fn write_requirements(&self, body: &str) {
        fs::write(&self.requirements_file, body).unwrap();
    }

    fn config(&self, server: &str) -> Config {
        Config {
            verbose: false,
            quiet: false,
            requirements_file: self.requirements_file.clone(),
            cache_dir: self.cache_dir.clone(),
            download_path: self.download_path.clone(),
            server: server.to_string(),
            s3: Default::default(),
            clear_cache: false,
            no_cache: false,
            refresh: false,
            no_deps: false,
            dry_run: false,
            timeout: Duration::from_secs(30),
            workers: 2,
            ansible_config_path: None,
            ansible_collections_path_used: false,
            ansible_cache_dir_used: false,
            ansible_server_used: false,
        }
    }

    fn install_path(&self, namespace: &str, name: &str) -> PathBuf {
        self.download_path
            .join("ansible_collections")
            .join(namespace)
            .join(name)
    }

    fn info_dir(&self, namespace: &str, name: &str, version: &str) -> PathBuf {
        self.download_path
            .join("ansible_collections")
            .join(format!("{namespace}.{name}-{version}.info"))
    }
}

fn test_infra() -> (Infra, Arc<MemoryPrinter>) {
    let printer = Arc::new(MemoryPrinter::new());
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap();
    (Infra::new(printer.clone(), client), printer)
}

fn install(env: &TestEnv, server: &str) -> gx_core::Result<()> {
    let (infra, _printer) = test_infra();
    run_install(&Arc::new(env.config(server)), &infra)
}

/// A collection fixture: tarball bytes plus the metadata the mock serves.
struct Fixture {
    namespace: String,
    name: String,
    version: String,
    tarball: Vec<u8>,
    sha256: String,
    deps: BTreeMap<String, String>,
}

impl Fixture {
    fn new(namespace: &str, name: &str, version: &str, deps: &[(&str, &str)]) -> Self {
        let deps: BTreeMap<String, String> = deps
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let tarball = build_tarball(namespace, name, version, &deps);
        let sha256 = hex::encode(Sha256::digest(&tarball));
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            version: version.to_string(),
            tarball,
            sha256,
            deps,
        }
    }

    fn filename(&self) -> String {
        format!("{}-{}-{}.tar.gz", self.namespace, self.name, self.version)
    }

    fn key(&self) -> String {
        format!("{}.{}@{}", self.namespace, self.name, self.version)
    }
}

fn build_tarball(
    namespace: &str,
    name: &str,
    version: &str,
    deps: &BTreeMap<String, String>,
) -> Vec<u8> {
    let manifest = json!({
        "collection_info": {
            "namespace": namespace,
            "name": name,
            "version": version,
            "dependencies": deps,
        }
    });
    let manifest_bytes = serde_json::to_vec_pretty(&manifest).unwrap();
    let readme = format!("# {namespace}.{name} {version}\n");

    let mut builder = tar::Builder::new(Vec::new());
    append_file(&mut builder, "MANIFEST.json", &manifest_bytes);
    append_file(&mut builder, "README.md", readme.as_bytes());
    append_file(&mut builder, "plugins/modules/ping.py", b"# module\n");
    let tar_bytes = builder.into_inner().unwrap();

    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(&tar_bytes).unwrap();
    encoder.finish().unwrap()
}

fn append_file(builder: &mut tar::Builder<Vec<u8>>, name: &str, body: &[u8]) {
    let mut header = tar::Header::new_gnu();
    header.set_size(body.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, name, body).unwrap();
}

/// Mounts root metadata, a versions list, per-version details, and artifact
/// downloads for one collection. Returns (root, detail-per-version,
/// artifact-per-version) mocks for hit assertions.
struct CollectionMocks<'a> {
    root: httpmock::Mock<'a>,
    versions: httpmock::Mock<'a>,
    details: Vec<(String, httpmock::Mock<'a>)>,
    artifacts: Vec<(String, httpmock::Mock<'a>)>,
}

impl CollectionMocks<'_> {
    fn detail_hits(&self, version: &str) -> usize {
        self.details
            .iter()
            .find(|(v, _)| v == version)
            .map(|(_, mock)| mock.hits())
            .expect("detail mock exists")
    }

    fn artifact_hits(&self, version: &str) -> usize {
        self.artifacts
            .iter()
            .find(|(v, _)| v == version)
            .map(|(_, mock)| mock.hits())
            .expect("artifact mock exists")
    }
}

fn mount_collection<'a>(
    server: &'a MockServer,
    namespace: &str,
    name: &str,
    fixtures: &[&Fixture],
) -> CollectionMocks<'a> {
    let base = server.base_url();
    let versions_path = format!("/api/v3/collections/{namespace}/{name}/versions/");
    let highest = fixtures
        .iter()
        .map(|f| f.version.clone())
        .max_by(|a, b| {
            semver::Version::parse(a)
                .unwrap()
                .cmp(&semver::Version::parse(b).unwrap())
        })
        .expect("at least one fixture");

    let root = server.mock(|when, then| {
        when.method(GET)
            .path(format!("/api/v3/collections/{namespace}/{name}/"));
        then.status(200)
            .header("content-type", "application/json")
            .json_body(json!({
                "href": format!("{base}/api/v3/collections/{namespace}/{name}/"),
                "versions_url": format!("{base}{versions_path}"),
                "highest_version": {
                    "href": format!("{base}{versions_path}{highest}/"),
                    "version": highest,
                },
            }));
    });

    let data: Vec<_> = fixtures
        .iter()
        .map(|f| json!({"version": f.version}))
        .collect();
    let versions = server.mock(|when, then| {
        when.method(GET).path(versions_path.clone());
        then.status(200)
            .header("content-type", "application/json")
            .json_body(json!({
                "data": data,
                "meta": {"count": fixtures.len()},
            }));
    });

    let mut details = Vec::new();
    let mut artifacts = Vec::new();
    for fixture in fixtures {
        let detail = server.mock(|when, then| {
            when.method(GET)
                .path(format!("{versions_path}{}/", fixture.version));
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({
                    "version": fixture.version.clone(),
                    "href": format!("{base}{versions_path}{}/", fixture.version),
                    "download_url": format!("{base}/artifacts/{}", fixture.filename()),
                    "name": fixture.name.clone(),
                    "namespace": {"name": fixture.namespace.clone()},
                    "artifact": {
                        "filename": fixture.filename(),
                        "sha256": fixture.sha256.clone(),
                        "size": fixture.tarball.len(),
                    },
                    "metadata": {"dependencies": fixture.deps.clone()},
                }));
        });
        details.push((fixture.version.clone(), detail));

        let artifact = server.mock(|when, then| {
            when.method(GET).path(format!("/artifacts/{}", fixture.filename()));
            then.status(200)
                .header("content-type", "application/gzip")
                .body(fixture.tarball.clone());
        });
        artifacts.push((fixture.version.clone(), artifact));
    }

    CollectionMocks {
        root,
        versions,
        details,
        artifacts,
    }
}

fn load_local_store(cache_dir: &Path) -> gx_store::Store {
    gx_store::open_dbs(cache_dir).unwrap().load().unwrap()
}

#[test]
fn install_with_empty_cache() {
    let env = TestEnv::new();
    let server = MockServer::start();
    let general = Fixture::new("community", "general", "11.1.0", &[]);
    let mocks = mount_collection(&server, "community", "general", &[&general]);

    env.write_requirements("collections:\n  - name: community.general\n    version: \"11.1.0\"\n");
    install(&env, &server.base_url()).expect("install succeeds");

    assert_eq!(mocks.root.hits(), 1);
    assert_eq!(mocks.detail_hits("11.1.0"), 1);
    assert_eq!(mocks.artifact_hits("11.1.0"), 1);
    assert_eq!(mocks.versions.hits(), 0);

    let install_path = env.install_path("community", "general");
    assert!(install_path.join("MANIFEST.json").exists());
    assert!(env.info_dir("community", "general", "11.1.0").join("GALAXY.yml").exists());

    let store = load_local_store(&env.cache_dir);
    let installed = store.get_installed(&general.key()).expect("installed entry");
    assert!(!installed.artifact_sha256.is_empty());
    assert_eq!(installed.artifact_sha256, general.sha256);
    assert!(install_path
        .join(format!(".extract-done.{}", installed.artifact_sha256))
        .exists());

    let graph = store.graph_snapshot();
    assert_eq!(graph.get(&general.key()), Some(&vec![]));
    assert!(!store.meta_snapshot().requirements_hash.is_empty());
}

#[test]
fn rerun_with_unchanged_requirements_reuses_snapshot() {
    let env = TestEnv::new();
    let server = MockServer::start();
    let general = Fixture::new("community", "general", "11.1.0", &[]);
    let mocks = mount_collection(&server, "community", "general", &[&general]);

    env.write_requirements("collections:\n  - name: community.general\n    version: \"11.1.0\"\n");
    install(&env, &server.base_url()).expect("first install");

    let root_hits = mocks.root.hits();
    let detail_hits = mocks.detail_hits("11.1.0");
    let artifact_hits = mocks.artifact_hits("11.1.0");

    let (infra, printer) = test_infra();
    run_install(&Arc::new(env.config(&server.base_url())), &infra).expect("second install");

    assert_eq!(mocks.root.hits(), root_hits, "no new root metadata fetches");
    assert_eq!(mocks.detail_hits("11.1.0"), detail_hits, "no new detail fetches");
    assert_eq!(
        mocks.artifact_hits("11.1.0"),
        artifact_hits,
        "no new tarball downloads"
    );
    assert!(printer.contains("All done"));

    let store = load_local_store(&env.cache_dir);
    assert!(store.get_installed(&general.key()).is_some());
}

#[test]
fn incremental_change_resolves_only_new_root() {
    let env = TestEnv::new();
    let server = MockServer::start();
    let general = Fixture::new("community", "general", "11.1.0", &[]);
    let posix = Fixture::new("ansible", "posix", "2.0.0", &[]);
    let general_mocks = mount_collection(&server, "community", "general", &[&general]);
    let posix_mocks = mount_collection(&server, "ansible", "posix", &[&posix]);

    env.write_requirements("collections:\n  - name: community.general\n    version: \"11.1.0\"\n");
    install(&env, &server.base_url()).expect("first install");
    let general_artifact_hits = general_mocks.artifact_hits("11.1.0");

    env.write_requirements(
        "collections:\n  - name: community.general\n    version: \"11.1.0\"\n  - name: ansible.posix\n    version: \"2.0.0\"\n",
    );
    install(&env, &server.base_url()).expect("second install");

    assert_eq!(
        general_mocks.artifact_hits("11.1.0"),
        general_artifact_hits,
        "unchanged root keeps its cached artifact"
    );
    assert_eq!(posix_mocks.artifact_hits("2.0.0"), 1);

    assert!(env.install_path("community", "general").join("MANIFEST.json").exists());
    assert!(env.install_path("ansible", "posix").join("MANIFEST.json").exists());

    let store = load_local_store(&env.cache_dir);
    assert!(store.get_installed(&general.key()).is_some());
    assert!(store.get_installed(&posix.key()).is_some());
    let graph = store.graph_snapshot();
    assert!(graph.contains_key(&general.key()));
    assert!(graph.contains_key(&posix.key()));
}

#[test]
fn range_constraint_selects_highest_satisfying_version() {
    let env = TestEnv::new();
    let server = MockServer::start();
    let fixtures: Vec<Fixture> = ["10.9.0", "11.1.0", "11.2.0", "12.0.0"]
        .iter()
        .map(|v| Fixture::new("community", "general", v, &[]))
        .collect();
    let refs: Vec<&Fixture> = fixtures.iter().collect();
    let mocks = mount_collection(&server, "community", "general", &refs);

    env.write_requirements(
        "collections:\n  - name: community.general\n    version: \">=11.0.0, <12.0.0\"\n",
    );
    install(&env, &server.base_url()).expect("install succeeds");

    assert_eq!(mocks.versions.hits(), 1, "versions list consulted once");
    assert_eq!(mocks.detail_hits("11.2.0"), 1);
    assert_eq!(mocks.detail_hits("12.0.0"), 0, "unsatisfying version untouched");
    assert_eq!(mocks.artifact_hits("11.2.0"), 1);
    assert_eq!(mocks.artifact_hits("12.0.0"), 0);

    let store = load_local_store(&env.cache_dir);
    assert!(store.get_installed("community.general@11.2.0").is_some());
}

#[test]
fn dependency_cycle_fails_install_ordering() {
    let env = TestEnv::new();
    let server = MockServer::start();
    let a = Fixture::new("a", "b", "1.0.0", &[("c.d", ">=1")]);
    let c = Fixture::new("c", "d", "1.0.0", &[("a.b", ">=1")]);
    mount_collection(&server, "a", "b", &[&a]);
    mount_collection(&server, "c", "d", &[&c]);

    env.write_requirements("collections:\n  - name: a.b\n");
    let err = install(&env, &server.base_url()).expect_err("cycle must fail");
    assert!(matches!(err, Error::DependencyGraphHasACycle));
}

#[test]
fn sha_mismatch_rejects_artifact() {
    let env = TestEnv::new();
    let server = MockServer::start();
    let general = Fixture::new("community", "general", "11.1.0", &[]);
    let base = server.base_url();
    let versions_path = "/api/v3/collections/community/general/versions/";

    server.mock(|when, then| {
        when.method(GET).path("/api/v3/collections/community/general/");
        then.status(200).json_body(json!({
            "versions_url": format!("{base}{versions_path}"),
            "highest_version": {
                "href": format!("{base}{versions_path}11.1.0/"),
                "version": "11.1.0",
            },
        }));
    });
    server.mock(|when, then| {
        when.method(GET).path(format!("{versions_path}11.1.0/"));
        then.status(200).json_body(json!({
            "version": "11.1.0",
            "href": format!("{base}{versions_path}11.1.0/"),
            "download_url": format!("{base}/artifacts/{}", general.filename()),
            "name": "general",
            "namespace": {"name": "community"},
            "artifact": {
                "filename": general.filename(),
                // Deliberately wrong declared hash.
                "sha256": "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
                "size": general.tarball.len(),
            },
            "metadata": {"dependencies": {}},
        }));
    });
    server.mock(|when, then| {
        when.method(GET).path(format!("/artifacts/{}", general.filename()));
        then.status(200).body(general.tarball.clone());
    });

    env.write_requirements("collections:\n  - name: community.general\n    version: \"11.1.0\"\n");
    let (infra, printer) = test_infra();
    let err = run_install(&Arc::new(env.config(&base)), &infra).expect_err("must fail");
    assert!(matches!(err, Error::InstallationFailed(1)));
    assert!(printer.contains("sha256 mismatch"));

    let store = load_local_store(&env.cache_dir);
    assert!(store.get_installed(&general.key()).is_none());
    assert!(!env.install_path("community", "general").exists());

    // Staging downloads are cleaned up with their temp files.
    let leftovers: Vec<_> = fs::read_dir(&env.cache_dir)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().to_string())
        .filter(|name| name.starts_with(".download-") || name.ends_with(".tar.gz"))
        .collect();
    assert!(leftovers.is_empty(), "unexpected leftovers: {leftovers:?}");
}

#[test]
fn cleanup_removes_unreachable_collections() {
    let env = TestEnv::new();
    let server = MockServer::start();
    let general = Fixture::new("community", "general", "11.1.0", &[]);
    let posix = Fixture::new("ansible", "posix", "2.0.0", &[]);
    mount_collection(&server, "community", "general", &[&general]);
    mount_collection(&server, "ansible", "posix", &[&posix]);

    env.write_requirements(
        "collections:\n  - name: community.general\n    version: \"11.1.0\"\n  - name: ansible.posix\n    version: \"2.0.0\"\n",
    );
    install(&env, &server.base_url()).expect("install both");

    let posix_artifact = env
        .cache_dir
        .join(urlencoding::encode("ansible-posix-2.0.0.tar.gz").into_owned());
    assert!(posix_artifact.exists());

    env.write_requirements("collections:\n  - name: community.general\n    version: \"11.1.0\"\n");
    let (infra, printer) = test_infra();
    run_cleanup(&env.config(&server.base_url()), &infra).expect("cleanup succeeds");

    assert!(!env.install_path("ansible", "posix").exists());
    assert!(!env.info_dir("ansible", "posix", "2.0.0").exists());
    assert!(!posix_artifact.exists());
    assert!(env.install_path("community", "general").join("MANIFEST.json").exists());
    assert!(printer.contains("Cleanup complete"));

    let store = load_local_store(&env.cache_dir);
    assert!(store.get_installed(&posix.key()).is_none());
    assert!(!store.graph_snapshot().contains_key(&posix.key()));
    assert!(store.get_deps_cache(&posix.key()).is_none());
    assert!(store.get_installed(&general.key()).is_some());
}

#[test]
fn install_then_cleanup_then_install_is_idempotent() {
    let env = TestEnv::new();
    let server = MockServer::start();
    let general = Fixture::new("community", "general", "11.1.0", &[]);
    mount_collection(&server, "community", "general", &[&general]);

    env.write_requirements("collections:\n  - name: community.general\n    version: \"11.1.0\"\n");
    install(&env, &server.base_url()).expect("first install");

    let (infra, _) = test_infra();
    run_cleanup(&env.config(&server.base_url()), &infra).expect("cleanup");
    assert!(env.install_path("community", "general").join("MANIFEST.json").exists());

    install(&env, &server.base_url()).expect("reinstall");
    let store = load_local_store(&env.cache_dir);
    assert!(store.get_installed(&general.key()).is_some());
}

#[test]
fn roles_only_requirements_install_nothing() {
    let env = TestEnv::new();
    let server = MockServer::start();

    env.write_requirements("roles:\n  - name: geerlingguy.java\n");
    let (infra, printer) = test_infra();
    run_install(&Arc::new(env.config(&server.base_url())), &infra).expect("no work succeeds");

    assert!(printer.contains("roles are not supported"));
    assert!(!env.download_path.join("ansible_collections").exists());
}

#[test]
fn transitive_dependencies_install_in_levels() {
    let env = TestEnv::new();
    let server = MockServer::start();
    let util = Fixture::new("ansible", "utils", "3.0.0", &[]);
    let netcommon = Fixture::new("ansible", "netcommon", "6.1.0", &[("ansible.utils", ">=3.0.0")]);
    mount_collection(&server, "ansible", "utils", &[&util]);
    mount_collection(&server, "ansible", "netcommon", &[&netcommon]);

    env.write_requirements("collections:\n  - name: ansible.netcommon\n    version: \"6.1.0\"\n");
    install(&env, &server.base_url()).expect("install with deps");

    assert!(env.install_path("ansible", "netcommon").join("MANIFEST.json").exists());
    assert!(env.install_path("ansible", "utils").join("MANIFEST.json").exists());

    let store = load_local_store(&env.cache_dir);
    let graph = store.graph_snapshot();
    assert_eq!(
        graph.get(&netcommon.key()),
        Some(&vec![util.key()])
    );
    assert_eq!(graph.get(&util.key()), Some(&vec![]));

    let roots = store.roots_snapshot();
    assert_eq!(roots.get("last_run"), Some(&vec![netcommon.key()]));
}
