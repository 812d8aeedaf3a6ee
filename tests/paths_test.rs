use std::path::Path;

use mmdex::paths::{is_within, normalize_path, resolve_sandboxed};
use mmdex::vcache::cache_key;

#[test]
fn containment_holds_for_normalized_children() {
    let root = Path::new("/data/documents");
    let cases = [
        "folder/a.json",
        "folder/nested/b.json",
        "./folder/c.json",
        "folder//d.json",
    ];
    for case in cases {
        let normalized = normalize_path(case).unwrap();
        assert!(
            is_within(root, &root.join(&normalized)),
            "expected {case:?} to stay within root"
        );
    }
}

#[test]
fn containment_fails_for_escaping_paths() {
    let root = Path::new("/data/documents");
    let cases = [
        "../outside.json",
        "folder/../../outside.json",
        "a/b/../../../c",
    ];
    for case in cases {
        assert!(
            resolve_sandboxed(root, case).is_err(),
            "expected {case:?} to be rejected"
        );
    }
}

#[test]
fn equal_paths_are_not_within_each_other() {
    let root = Path::new("/data/documents");
    assert!(!is_within(root, root));
    assert!(!is_within(root, Path::new("/data/documents/folder/..")));
}

#[test]
fn degenerate_names_are_rejected() {
    for bad in ["", ".", "..", "/"] {
        assert!(normalize_path(bad).is_err(), "expected {bad:?} rejected");
    }
}

#[test]
fn cache_keys_are_stable_uuids() {
    let a = cache_key("/data/documents/folder/a.json");
    let b = cache_key("/data/documents/folder/a.json");
    assert_eq!(a, b);
    // uuid v5 marker
    assert_eq!(a.get_version_num(), 5);
    // Different path, different key.
    assert_ne!(a, cache_key("/data/documents/folder/b.json"));
}
