//! Blob storage.
//!
//! The [`backend::StorageBackend`] trait abstracts over where object bytes
//! physically live; [`local::LocalBackend`] keeps them on local disk.

pub mod backend;
pub mod local;

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};

/// Directory holding bodies of versioned writes, outside any volume.
pub const VERSIONS_DIR: &str = ".versions";

/// Escaped in key segments.  Escaping `%` keeps the encoding injective.
const SEGMENT_ESCAPES: &AsciiSet = &CONTROLS.add(b'%');

/// Longest directory name produced for one piece of a key segment.
const MAX_SEGMENT_LEN: usize = 200;

/// Blob path of one null-version write of `key`.
///
/// Key segments become directories.  Each one is prefixed with `s`, so
/// empty, `.` and `..` segments stay ordinary names, and long segments
/// continue in `c`-prefixed subdirectories.  The body itself is the leaf
/// `@{write_id}`: one key's blob never sits where another key needs a
/// directory, and every write lands on a fresh path.
pub fn object_blob_path(volume: &str, key: &str, write_id: &str) -> String {
    let mut path = String::from(volume);
    for segment in key.split('/') {
        // Non-ASCII is always percent-encoded, so byte slicing is safe.
        let encoded = utf8_percent_encode(segment, SEGMENT_ESCAPES).to_string();
        let mut rest = encoded.as_str();
        let mut marker = 's';
        loop {
            let take = rest.len().min(MAX_SEGMENT_LEN);
            path.push('/');
            path.push(marker);
            path.push_str(&rest[..take]);
            rest = &rest[take..];
            if rest.is_empty() {
                break;
            }
            marker = 'c';
        }
    }
    path.push_str("/@");
    path.push_str(write_id);
    path
}

/// Blob path of a specific object version.
pub fn version_blob_path(volume: &str, version_id: &str) -> String {
    format!("{VERSIONS_DIR}/{volume}/{version_id}")
}

/// Fresh id for one null-version write.
pub fn new_write_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_paths() {
        assert_eq!(object_blob_path("v1", "a/b.txt", "w1"), "v1/sa/sb.txt/@w1");
        assert_eq!(version_blob_path("v1", "abc"), ".versions/v1/abc");
    }

    #[test]
    fn test_object_paths_never_have_empty_segments() {
        assert_eq!(object_blob_path("v1", "photos/", "w"), "v1/sphotos/s/@w");
        assert_eq!(object_blob_path("v1", "a//b", "w"), "v1/sa/s/sb/@w");
        assert_eq!(object_blob_path("v1", "/", "w"), "v1/s/s/@w");
        assert_eq!(object_blob_path("v1", "../x", "w"), "v1/s../sx/@w");
        for key in ["photos/", "a//b", "/", "../x", "./."] {
            let path = object_blob_path("v1", key, "w");
            assert!(
                path.split('/').all(|seg| !seg.is_empty() && seg != "." && seg != ".."),
                "{key} -> {path}"
            );
        }
    }

    #[test]
    fn test_object_paths_are_distinct() {
        let keys = ["a", "a/", "a/b", "a//b", "a%2Fb", "a/b/", "s", "@w", "%"];
        let paths: std::collections::HashSet<String> = keys
            .iter()
            .map(|k| object_blob_path("v1", k, "w"))
            .collect();
        assert_eq!(paths.len(), keys.len());
        assert_eq!(object_blob_path("v1", "100%", "w"), "v1/s100%25/@w");
        assert_eq!(object_blob_path("v1", "\u{e9}", "w"), "v1/s%C3%A9/@w");
    }

    #[test]
    fn test_long_segments_are_split() {
        let key = "x".repeat(450);
        let path = object_blob_path("v1", &key, "w");
        let dirs: Vec<&str> = path.split('/').collect();
        assert_eq!(dirs.len(), 5);
        assert_eq!(dirs[1].len(), 201);
        assert!(dirs[1].starts_with('s'));
        assert!(dirs[2].starts_with('c') && dirs[2].len() == 201);
        assert!(dirs[3].starts_with('c') && dirs[3].len() == 51);
        assert_eq!(dirs[4], "@w");
    }
}
