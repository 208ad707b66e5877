//! Patch codec: test-file extraction from git diffs and archive payloads
//! for container delivery.
//!
//! The diff-header scan is intentionally a narrow line parser, not a general
//! diff parser: it only needs the `b/` path of each `diff --git` header.
use anyhow::{Context, Result};
use std::time::{SystemTime, UNIX_EPOCH};

/// Extension a path must carry to count as a test source file.
pub const TEST_FILE_EXTENSION: &str = ".py";

/// Extract test file paths from a test patch in git diff format.
///
/// A path qualifies when it contains "test" (case-insensitive) and ends with
/// the test-source extension. Encounter order and duplicates are preserved;
/// the downstream pytest invocation tolerates repeated paths.
pub fn extract_test_files(test_patch: &str) -> Vec<String> {
    let mut test_files = Vec::new();
    for line in test_patch.lines() {
        if !line.starts_with("diff --git") {
            continue;
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 3 {
            continue;
        }
        let Some(file_path) = parts[2].strip_prefix("a/") else {
            continue;
        };
        if file_path.to_lowercase().contains("test") && file_path.ends_with(TEST_FILE_EXTENSION) {
            test_files.push(file_path.to_string());
        }
    }
    test_files
}

/// Build a single-entry tar archive holding `contents` under `entry_name`.
///
/// The archive is uploaded straight into the container's filesystem, which
/// keeps multi-megabyte patches off the host-to-container command line where
/// they would trip argument-length limits.
pub fn archive_bytes(entry_name: &str, contents: &str) -> Result<Vec<u8>> {
    let payload = contents.as_bytes();
    let mtime = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("compute archive mtime")?
        .as_secs();

    let mut buf = Vec::new();
    {
        let mut builder = tar::Builder::new(&mut buf);
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(payload.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(mtime);
        header.set_uid(0);
        header.set_gid(0);
        header.set_cksum();
        builder
            .append_data(&mut header, entry_name, std::io::Cursor::new(payload))
            .with_context(|| format!("append tar entry {entry_name}"))?;
        builder.finish().context("finish tar archive")?;
    }
    Ok(buf)
}
