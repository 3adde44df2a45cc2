//! Canonical hashing of an upload's file manifest.
//!
//! Used both to key the `upload_id` reuse index and to recognise a staging
//! directory left behind by a prior session as matching a new `init_upload`.

use capydeploy_protocol::messages::FileEntry;

use crate::chunked::checksum_bytes;

/// Computes a stable SHA-256 hash over `(install_path, total_size, files)`.
///
/// Files are hashed in the order given — callers that want a hash
/// independent of manifest ordering should sort `files` by `relative_path`
/// first.
pub fn manifest_hash(install_path: &str, total_size: i64, files: &[FileEntry]) -> String {
    let mut buf = Vec::new();
    buf.extend_from_slice(install_path.as_bytes());
    buf.push(0);
    buf.extend_from_slice(total_size.to_string().as_bytes());
    buf.push(0);
    for file in files {
        buf.extend_from_slice(file.relative_path.as_bytes());
        buf.push(0);
        buf.extend_from_slice(file.size.to_string().as_bytes());
        buf.push(0);
    }
    checksum_bytes(&buf)
}
