//! Property-based tests for patchline-updater.
//!
//! These tests use proptest to verify correctness properties across
//! randomly generated inputs.
//!
//! # Properties Tested
//!
//! - Property 1: Fail-closed manifest parsing
//! - Property 2: Archive round-trip
//! - Property 3: Archive corruption is detected and cleaned up
//! - Property 4: Modification-time tolerance

#![cfg(test)]

use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{TimeZone, Utc};
use filetime::FileTime;
use proptest::prelude::*;
use semver::Version;
use tempfile::TempDir;
use url::Url;

use crate::archive::{extract_archive, write_archive};
use crate::descriptor::FileDescriptor;
use crate::manifest::{render, UpdateManifest, VersionEntry};
use crate::progress::NoProgress;
use crate::testutil;

const MANIFEST_URL: &str = "https://updates.example.com/Ledger.xml";

// =============================================================================
// Generators
// =============================================================================

/// Generate a path segment.
fn arb_segment() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_]{0,7}"
}

/// Generate a relative path one to three segments deep.
fn arb_relative_path() -> impl Strategy<Value = String> {
    prop::collection::vec(arb_segment(), 1..=3).prop_map(|segments| segments.join("/"))
}

/// Generate file content, empty files included.
fn arb_content() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        Just(Vec::new()),
        prop::collection::vec(any::<u8>(), 1..4096),
    ]
}

/// Generate a set of files whose paths never collide with each other's
/// directories.
fn arb_tree() -> impl Strategy<Value = Vec<(String, Vec<u8>)>> {
    prop::collection::vec((arb_relative_path(), arb_content()), 1..6).prop_map(|entries| {
        let mut accepted: Vec<(String, Vec<u8>)> = Vec::new();
        for (path, content) in entries {
            let conflicts = accepted.iter().any(|(other, _)| {
                other == &path
                    || other.starts_with(&format!("{}/", path))
                    || path.starts_with(&format!("{}/", other))
            });
            if !conflicts {
                accepted.push((path, content));
            }
        }
        accepted
    })
}

// =============================================================================
// Helper Functions
// =============================================================================

fn materialize(root: &Path, tree: &[(String, Vec<u8>)]) {
    for (rel, content) in tree {
        let path = crate::relpath::to_native(root, rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }
}

fn manifest_xml(root: &Path, tree: &[(String, Vec<u8>)]) -> String {
    let base = Url::parse(MANIFEST_URL).unwrap();
    let files: Vec<FileDescriptor> = tree
        .iter()
        .map(|(rel, _)| {
            FileDescriptor::create(root, rel, base.join(rel).unwrap(), &testutil::signing_key())
                .unwrap()
        })
        .collect();
    let versions = [VersionEntry::new(
        Version::new(1, 0, 0),
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        "Initial",
    )];
    render("Ledger", &versions, &files, None).unwrap()
}

/// Flip `mask` into byte `byte` of the `index`-th `<element>` value.
fn tamper(xml: &str, element: &str, index: usize, byte: usize, mask: u8) -> String {
    let open = format!("<{}>", element);
    let close = format!("</{}>", element);

    let mut search_from = 0;
    let mut start = 0;
    for _ in 0..=index {
        start = search_from + xml[search_from..].find(&open).unwrap() + open.len();
        search_from = start;
    }
    let end = start + xml[start..].find(&close).unwrap();

    let mut bytes = STANDARD.decode(&xml[start..end]).unwrap();
    let position = byte % bytes.len();
    bytes[position] ^= mask;
    format!("{}{}{}", &xml[..start], STANDARD.encode(bytes), &xml[end..])
}

fn parse(xml: &str, staging: &Path) -> Result<UpdateManifest, crate::UpdateError> {
    UpdateManifest::parse(xml, &Url::parse(MANIFEST_URL).unwrap(), testutil::client(staging))
}

fn archive_of(root: &Path) -> Vec<u8> {
    let mut bytes = Vec::new();
    write_archive(root, &mut bytes, &NoProgress).unwrap();
    bytes
}

// =============================================================================
// Property 1: Fail-closed manifest parsing
//
// A manifest parses iff every file signature verifies; flipping one byte of
// any Hash or Signature rejects the whole document.
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_untampered_manifest_parses(tree in arb_tree()) {
        let dir = TempDir::new().unwrap();
        materialize(dir.path(), &tree);
        let xml = manifest_xml(dir.path(), &tree);

        let manifest = parse(&xml, dir.path());
        prop_assert!(manifest.is_ok(), "rejected: {:?}", manifest.err());
        prop_assert_eq!(manifest.unwrap().files().len(), tree.len());
    }

    #[test]
    fn prop_flipped_hash_or_signature_rejects_manifest(
        tree in arb_tree(),
        pick in any::<prop::sample::Index>(),
        byte in 0usize..64,
        mask in 1u8..=255,
        in_signature in any::<bool>(),
    ) {
        let dir = TempDir::new().unwrap();
        materialize(dir.path(), &tree);
        let xml = manifest_xml(dir.path(), &tree);

        let element = if in_signature { "Signature" } else { "Hash" };
        let tampered = tamper(&xml, element, pick.index(tree.len()), byte, mask);

        prop_assert!(parse(&tampered, dir.path()).is_err());
    }
}

// =============================================================================
// Property 2: Archive round-trip
//
// extract(write(dir)) reproduces byte-identical files at identical relative
// paths, for sets including empty files and nested directories.
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_archive_roundtrip(tree in arb_tree()) {
        let source = TempDir::new().unwrap();
        materialize(source.path(), &tree);
        let bytes = archive_of(source.path());

        let dest = TempDir::new().unwrap();
        let target = dest.path().join("out");
        let summary = extract_archive(&bytes[..], &target, &NoProgress)
            .unwrap()
            .completed()
            .unwrap();

        prop_assert_eq!(summary.file_count as usize, tree.len());
        for (rel, content) in &tree {
            let extracted = fs::read(crate::relpath::to_native(&target, rel)).unwrap();
            prop_assert_eq!(&extracted, content);
        }
    }
}

// =============================================================================
// Property 3: Archive corruption
//
// Corrupting one byte anywhere in the archive fails extraction and leaves
// the destination exactly as found.
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_corrupted_archive_rejected_and_cleaned(
        tree in arb_tree(),
        pick in any::<prop::sample::Index>(),
        mask in 1u8..=255,
        pre_created in any::<bool>(),
    ) {
        let source = TempDir::new().unwrap();
        materialize(source.path(), &tree);
        let mut bytes = archive_of(source.path());
        let position = pick.index(bytes.len());
        bytes[position] ^= mask;

        let dest = TempDir::new().unwrap();
        let target = dest.path().join("out");
        if pre_created {
            fs::create_dir(&target).unwrap();
        }

        let result = extract_archive(&bytes[..], &target, &NoProgress);
        prop_assert!(result.is_err(), "corruption at {} went unnoticed", position);

        if pre_created {
            prop_assert_eq!(fs::read_dir(&target).unwrap().count(), 0);
        } else {
            prop_assert!(!target.exists());
        }
    }
}

// =============================================================================
// Property 4: Modification-time tolerance
//
// Timestamps within two seconds match; anything further apart does not.
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_mtime_tolerance(offset_secs in -10i64..=10) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.bin");
        fs::write(&path, b"content").unwrap();

        let base = SystemTime::UNIX_EPOCH + Duration::from_secs(1_600_000_000);
        filetime::set_file_mtime(&path, FileTime::from_system_time(base)).unwrap();
        let descriptor = FileDescriptor::create(
            dir.path(),
            "a.bin",
            Url::parse(MANIFEST_URL).unwrap(),
            &testutil::signing_key(),
        )
        .unwrap();

        let shifted = if offset_secs >= 0 {
            base + Duration::from_secs(offset_secs as u64)
        } else {
            base - Duration::from_secs(offset_secs.unsigned_abs())
        };
        filetime::set_file_mtime(&path, FileTime::from_system_time(shifted)).unwrap();

        prop_assert_eq!(descriptor.matches(dir.path()), offset_secs.abs() <= 2);
    }
}
