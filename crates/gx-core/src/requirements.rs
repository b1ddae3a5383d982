//! requirements.yml parsing.
//!
//! The file is either a bare list of collection entries or a mapping with
//! `collections:` and/or `roles:`. Roles are detected so the caller can warn
//! about them, but they are never processed.

use std::fs;
use std::path::Path;

use serde_yaml::Value;

use crate::collections::split_fqdn;
use crate::errors::{Error, Result};

/// A single collection requirement entry, normalized.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectionRequirement {
    pub namespace: String,
    pub name: String,
    pub version: String,
    pub source: String,
    pub kind: String,
    pub signatures: Vec<String>,
}

/// Reads and parses requirements from a file. The boolean reports whether a
/// `roles:` section was present.
pub fn load_collections(
    path: &Path,
    default_source: &str,
) -> Result<(Vec<CollectionRequirement>, bool)> {
    let data = fs::read_to_string(path)?;
    parse_collections(&data, default_source)
}

/// Parses requirements data and returns collections plus the roles flag.
pub fn parse_collections(
    data: &str,
    default_source: &str,
) -> Result<(Vec<CollectionRequirement>, bool)> {
    let raw: Value = serde_yaml::from_str(data)?;
    match raw {
        Value::Mapping(mapping) => {
            let roles_found = mapping.contains_key(&Value::from("roles"));
            if let Some(collections) = mapping.get(&Value::from("collections")) {
                let items = parse_collection_list(collections, default_source)?;
                return Ok((items, roles_found));
            }
            if roles_found {
                return Ok((Vec::new(), true));
            }
            Err(Error::UnsupportedRequirementsFormat)
        }
        Value::Sequence(_) => {
            let items = parse_collection_list(&raw, default_source)?;
            Ok((items, false))
        }
        _ => Err(Error::UnsupportedRequirementsFormat),
    }
}

fn parse_collection_list(raw: &Value, default_source: &str) -> Result<Vec<CollectionRequirement>> {
    let Value::Sequence(list) = raw else {
        return Err(Error::InvalidCollectionsList);
    };
    list.iter()
        .map(|item| parse_collection_item(item, default_source))
        .collect()
}

fn parse_collection_item(item: &Value, default_source: &str) -> Result<CollectionRequirement> {
    match item {
        Value::String(value) => parse_string_item(value, default_source),
        Value::Mapping(_) => parse_map_item(item, default_source),
        other => Err(Error::UnsupportedCollectionFormat(format!("{other:?}"))),
    }
}

fn parse_string_item(value: &str, default_source: &str) -> Result<CollectionRequirement> {
    let name = value.trim();
    if name.is_empty() {
        return Err(Error::EmptyCollectionName);
    }
    if looks_like_source_name(name) {
        return Err(Error::UnsupportedCollectionSource(name.to_string()));
    }
    let (namespace, collection) =
        split_fqdn(name).ok_or_else(|| Error::InvalidCollectionName(name.to_string()))?;
    Ok(CollectionRequirement {
        namespace,
        name: collection,
        version: "*".to_string(),
        source: default_source.to_string(),
        ..CollectionRequirement::default()
    })
}

fn parse_map_item(item: &Value, default_source: &str) -> Result<CollectionRequirement> {
    let mut req = parse_map_fields(item);
    req = normalize_collection_name(req);
    validate_requirement(&req, item)?;
    req = apply_requirement_defaults(req, default_source);
    normalize_requirement_namespace(req)
}

fn parse_map_fields(item: &Value) -> CollectionRequirement {
    let mut req = CollectionRequirement::default();
    if let Some(raw) = item.get("namespace").and_then(Value::as_str) {
        req.namespace = raw.trim().to_string();
    }
    if let Some(raw) = item.get("name") {
        req.name = scalar_to_string(raw).trim().to_string();
    }
    if let Some(raw) = item.get("source").and_then(Value::as_str) {
        req.source = raw.trim().to_string();
    }
    if let Some(raw) = item.get("type").and_then(Value::as_str) {
        req.kind = raw.trim().to_lowercase();
    }
    if let Some(raw) = item.get("signatures") {
        req.signatures = parse_string_list(raw);
    }
    if let Some(raw) = item.get("version") {
        req.version = scalar_to_string(raw).trim().to_string();
    }
    req
}

fn normalize_collection_name(mut req: CollectionRequirement) -> CollectionRequirement {
    if req.name.is_empty()
        || !req.name.contains('.')
        || !req.kind.is_empty()
        || looks_like_source_name(&req.name)
    {
        return req;
    }
    let Some((namespace, collection)) = split_fqdn(&req.name) else {
        return req;
    };
    if req.namespace.is_empty() {
        req.namespace = namespace;
    }
    req.name = collection;
    req
}

fn validate_requirement(req: &CollectionRequirement, raw: &Value) -> Result<()> {
    if req.name.is_empty() {
        return Err(Error::InvalidCollectionEntry(format!("{raw:?}")));
    }
    if req.kind == "git" || req.kind == "url" {
        return Err(Error::UnsupportedCollectionType(req.kind.clone()));
    }
    if !req.kind.is_empty() && req.kind != "galaxy" {
        return Err(Error::UnsupportedCollectionType(req.kind.clone()));
    }
    if req.kind.is_empty() && looks_like_source_name(&req.name) {
        return Err(Error::UnsupportedCollectionSource(req.name.clone()));
    }
    Ok(())
}

fn apply_requirement_defaults(
    mut req: CollectionRequirement,
    default_source: &str,
) -> CollectionRequirement {
    if req.version.is_empty() {
        req.version = "*".to_string();
    }
    if req.source.is_empty()
        && (req.kind == "galaxy" || (req.kind.is_empty() && !looks_like_source_name(&req.name)))
    {
        req.source = default_source.to_string();
    }
    req
}

fn normalize_requirement_namespace(req: CollectionRequirement) -> Result<CollectionRequirement> {
    if !req.namespace.is_empty() || !req.kind.is_empty() || looks_like_source_name(&req.name) {
        return Ok(req);
    }
    let Some((namespace, collection)) = split_fqdn(&req.name) else {
        return Err(Error::InvalidCollectionName(req.name));
    };
    Ok(CollectionRequirement {
        namespace,
        name: collection,
        ..req
    })
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => String::new(),
    }
}

fn parse_string_list(value: &Value) -> Vec<String> {
    match value {
        Value::Null => Vec::new(),
        Value::String(s) => {
            let item = s.trim();
            if item.is_empty() {
                Vec::new()
            } else {
                vec![item.to_string()]
            }
        }
        Value::Sequence(seq) => seq
            .iter()
            .map(|item| scalar_to_string(item).trim().to_string())
            .filter(|item| !item.is_empty())
            .collect(),
        other => {
            let item = scalar_to_string(other).trim().to_string();
            if item.is_empty() {
                Vec::new()
            } else {
                vec![item]
            }
        }
    }
}

/// Reports whether the value looks like a URL or a filesystem path.
fn looks_like_source_name(value: &str) -> bool {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return false;
    }
    let lower = trimmed.to_lowercase();
    lower.contains("://")
        || lower.starts_with("git+")
        || lower.starts_with("git@")
        || lower.starts_with("./")
        || lower.starts_with("../")
        || lower.starts_with('/')
        || lower.starts_with('~')
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVER: &str = "https://galaxy.ansible.com";

    #[test]
    fn parses_string_entries() {
        let (items, roles) = parse_collections("- community.general\n", SERVER).unwrap();
        assert!(!roles);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].namespace, "community");
        assert_eq!(items[0].name, "general");
        assert_eq!(items[0].version, "*");
        assert_eq!(items[0].source, SERVER);
    }

    #[test]
    fn parses_mapping_entries() {
        let data = "collections:\n  - name: community.general\n    version: \"11.1.0\"\n  - namespace: ansible\n    name: posix\n    version: 2.0.0\n    type: galaxy\n";
        let (items, roles) = parse_collections(data, SERVER).unwrap();
        assert!(!roles);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].namespace, "community");
        assert_eq!(items[0].name, "general");
        assert_eq!(items[0].version, "11.1.0");
        assert_eq!(items[1].namespace, "ansible");
        assert_eq!(items[1].name, "posix");
        assert_eq!(items[1].kind, "galaxy");
    }

    #[test]
    fn roles_only_yields_no_work() {
        let (items, roles) = parse_collections("roles:\n  - name: geerlingguy.java\n", SERVER).unwrap();
        assert!(roles);
        assert!(items.is_empty());
    }

    #[test]
    fn rejects_git_and_url_types() {
        let data = "collections:\n  - name: community.general\n    type: git\n";
        assert!(matches!(
            parse_collections(data, SERVER),
            Err(Error::UnsupportedCollectionType(_))
        ));
    }

    #[test]
    fn rejects_url_like_names() {
        for name in [
            "https://example.com/repo.tar.gz",
            "git+https://example.com/repo.git",
            "git@example.com:ns/repo.git",
            "./local/dir",
            "../local/dir",
            "/abs/dir",
            "~user/dir",
        ] {
            let data = format!("- \"{name}\"\n");
            assert!(
                matches!(
                    parse_collections(&data, SERVER),
                    Err(Error::UnsupportedCollectionSource(_))
                ),
                "{name} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_unknown_document_shapes() {
        assert!(matches!(
            parse_collections("just a string", SERVER),
            Err(Error::UnsupportedRequirementsFormat)
        ));
        assert!(matches!(
            parse_collections("foo: bar\n", SERVER),
            Err(Error::UnsupportedRequirementsFormat)
        ));
    }

    #[test]
    fn numeric_versions_are_stringified() {
        let data = "collections:\n  - name: ansible.posix\n    version: 2.0\n";
        let (items, _) = parse_collections(data, SERVER).unwrap();
        assert_eq!(items[0].version, "2.0");
    }

    #[test]
    fn signatures_accept_string_or_list() {
        let data = "collections:\n  - name: a.b\n    signatures: sig1\n  - name: c.d\n    signatures:\n      - sig2\n      - sig3\n";
        let (items, _) = parse_collections(data, SERVER).unwrap();
        assert_eq!(items[0].signatures, vec!["sig1"]);
        assert_eq!(items[1].signatures, vec!["sig2", "sig3"]);
    }
}
