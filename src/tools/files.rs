//! File-system tools, confined to the configured sandbox roots.
//!
//! Every path parameter is canonicalized and checked against the sandbox
//! before any read. A path resolving outside all roots fails the step with
//! `OutOfSandbox` and is never retried.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use super::{ParamSpec, Tool, ToolContext, ToolError, ToolSpec};

/// Tool name for duplicate discovery.
pub const FOLDER_FIND_DUPLICATES: &str = "folder_find_duplicates";

/// Finds files with identical content inside a sandboxed folder.
///
/// Candidates are grouped by size first; only same-size files are compared
/// byte-for-byte, so unique sizes are never read.
pub struct FolderDuplicatesTool {
    sandbox_roots: Vec<PathBuf>,
}

impl FolderDuplicatesTool {
    /// Create the handler over the configured sandbox roots.
    pub fn new(sandbox_roots: Vec<PathBuf>) -> Self {
        Self { sandbox_roots }
    }

    /// Registration spec. Read-only, hence pure.
    pub fn spec() -> ToolSpec {
        ToolSpec {
            name: FOLDER_FIND_DUPLICATES.to_owned(),
            description: "Find duplicate files (identical content) in a folder".to_owned(),
            parameters: vec![ParamSpec::new("folder_path", "string", false)],
            delivery_terminal: false,
            pure: true,
            default_deadline_ms: Some(60_000),
        }
    }

    /// Resolve the requested folder against the sandbox.
    ///
    /// A `null` or missing `folder_path` falls back to the first sandbox
    /// root.
    fn resolve_folder(&self, params: &serde_json::Value) -> Result<PathBuf, ToolError> {
        let requested = params
            .get("folder_path")
            .and_then(serde_json::Value::as_str);

        let candidate = match requested {
            Some(path) => PathBuf::from(path),
            None => self
                .sandbox_roots
                .first()
                .cloned()
                .ok_or_else(|| ToolError::InvalidInput("no sandbox roots configured".to_owned()))?,
        };

        let canonical = candidate
            .canonicalize()
            .map_err(|e| ToolError::InvalidInput(format!("folder not accessible: {e}")))?;

        let inside = self.sandbox_roots.iter().any(|root| {
            root.canonicalize()
                .map(|canonical_root| canonical.starts_with(&canonical_root))
                .unwrap_or(false)
        });
        if !inside {
            return Err(ToolError::OutOfSandbox(canonical.display().to_string()));
        }

        Ok(canonical)
    }
}

#[async_trait]
impl Tool for FolderDuplicatesTool {
    fn name(&self) -> &str {
        FOLDER_FIND_DUPLICATES
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        let folder = self.resolve_folder(&params)?;
        debug!(folder = %folder.display(), "scanning for duplicates");

        let mut files = Vec::new();
        collect_files(&folder, &mut files, ctx)?;

        // Group by size; only same-size files can be duplicates.
        files.sort_by_key(|(_, size)| *size);

        let mut groups: Vec<(Vec<PathBuf>, u64)> = Vec::new();
        let mut index = 0usize;
        while index < files.len() {
            if ctx.cancel.is_cancelled() {
                return Err(ToolError::Cancelled);
            }
            let size = files.get(index).map(|(_, s)| *s).unwrap_or(0);
            let same_size: Vec<PathBuf> = files
                .iter()
                .skip(index)
                .take_while(|(_, s)| *s == size)
                .map(|(p, _)| p.clone())
                .collect();
            index = index.saturating_add(same_size.len().max(1));

            if same_size.len() > 1 {
                for bucket in group_by_content(&same_size)? {
                    if bucket.len() > 1 {
                        groups.push((bucket, size));
                    }
                }
            }
        }

        let total_duplicate_groups = groups.len();
        let total_duplicate_files: usize = groups.iter().map(|(b, _)| b.len()).sum();
        let wasted_bytes: u64 = groups
            .iter()
            .map(|(bucket, size)| {
                let extra_copies =
                    u64::try_from(bucket.len().saturating_sub(1)).unwrap_or(u64::MAX);
                size.saturating_mul(extra_copies)
            })
            .sum();

        let duplicates: Vec<serde_json::Value> = groups
            .iter()
            .map(|(bucket, size)| {
                let file_entries: Vec<serde_json::Value> = bucket
                    .iter()
                    .map(|path| {
                        json!({
                            "name": path.file_name().and_then(|n| n.to_str()).unwrap_or("(unnamed)"),
                            "path": path.display().to_string(),
                        })
                    })
                    .collect();
                json!({
                    "files": file_entries,
                    "size": size,
                    "count": bucket.len(),
                })
            })
            .collect();

        Ok(json!({
            "total_duplicate_groups": total_duplicate_groups,
            "total_duplicate_files": total_duplicate_files,
            "wasted_space_mb": bytes_to_mb(wasted_bytes),
            "duplicates": duplicates,
        }))
    }
}

/// Recursively collect regular files with their sizes.
fn collect_files(
    dir: &Path,
    out: &mut Vec<(PathBuf, u64)>,
    ctx: &ToolContext,
) -> Result<(), ToolError> {
    let entries = std::fs::read_dir(dir).map_err(|e| ToolError::Failed {
        message: format!("failed to read {}: {e}", dir.display()),
        retry_possible: false,
    })?;

    for entry in entries.flatten() {
        if ctx.cancel.is_cancelled() {
            return Err(ToolError::Cancelled);
        }
        let path = entry.path();
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if metadata.is_dir() {
            collect_files(&path, out, ctx)?;
        } else if metadata.is_file() {
            out.push((path, metadata.len()));
        }
    }
    Ok(())
}

/// Partition same-size files into buckets of identical content.
fn group_by_content(paths: &[PathBuf]) -> Result<Vec<Vec<PathBuf>>, ToolError> {
    let mut buckets: Vec<(Vec<u8>, Vec<PathBuf>)> = Vec::new();

    for path in paths {
        let contents = std::fs::read(path).map_err(|e| ToolError::Failed {
            message: format!("failed to read {}: {e}", path.display()),
            retry_possible: true,
        })?;

        match buckets.iter_mut().find(|(c, _)| *c == contents) {
            Some((_, bucket)) => bucket.push(path.clone()),
            None => buckets.push((contents, vec![path.clone()])),
        }
    }

    Ok(buckets.into_iter().map(|(_, bucket)| bucket).collect())
}

/// Bytes per megabyte (binary prefix).
const BYTES_PER_MB: u64 = 1024 * 1024;

/// Bytes to megabytes with two-decimal precision, without lossy casts.
fn bytes_to_mb(bytes: u64) -> f64 {
    let hundredths = bytes
        .saturating_mul(100)
        .checked_div(BYTES_PER_MB)
        .unwrap_or(0);
    f64::from(u32::try_from(hundredths).unwrap_or(u32::MAX)) / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::cancel_pair;
    use std::time::Duration;
    use uuid::Uuid;

    fn ctx() -> ToolContext {
        let (_handle, token) = cancel_pair();
        ToolContext {
            session_id: "s1".to_owned(),
            interaction_id: Uuid::nil(),
            cancel: token,
            deadline: Duration::from_secs(5),
        }
    }

    fn write(dir: &Path, name: &str, contents: &str) {
        std::fs::write(dir.join(name), contents).expect("write test file");
    }

    #[tokio::test]
    async fn test_finds_duplicate_groups() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        write(dir.path(), "a.pdf", "same content here");
        write(dir.path(), "b.pdf", "same content here");
        write(dir.path(), "c.txt", "different content!");
        write(dir.path(), "d.txt", "different content!");
        write(dir.path(), "unique.txt", "only one of these");

        let tool = FolderDuplicatesTool::new(vec![dir.path().to_path_buf()]);
        let payload = tool
            .execute(serde_json::json!({"folder_path": null}), &ctx())
            .await
            .expect("execute");

        assert_eq!(payload["total_duplicate_groups"], 2);
        assert_eq!(payload["total_duplicate_files"], 4);
        let groups = payload["duplicates"].as_array().expect("groups");
        assert_eq!(groups.len(), 2);
        for group in groups {
            assert_eq!(group["count"], 2);
            assert_eq!(group["files"].as_array().expect("files").len(), 2);
        }
    }

    #[tokio::test]
    async fn test_same_size_different_content_not_grouped() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        write(dir.path(), "x.txt", "aaaa");
        write(dir.path(), "y.txt", "bbbb");

        let tool = FolderDuplicatesTool::new(vec![dir.path().to_path_buf()]);
        let payload = tool
            .execute(serde_json::json!({}), &ctx())
            .await
            .expect("execute");
        assert_eq!(payload["total_duplicate_groups"], 0);
        assert_eq!(payload["wasted_space_mb"], 0.0);
    }

    #[tokio::test]
    async fn test_recurses_into_subfolders() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        std::fs::create_dir(dir.path().join("sub")).expect("mkdir");
        write(dir.path(), "top.txt", "duplicated across levels");
        write(&dir.path().join("sub"), "nested.txt", "duplicated across levels");

        let tool = FolderDuplicatesTool::new(vec![dir.path().to_path_buf()]);
        let payload = tool
            .execute(serde_json::json!({}), &ctx())
            .await
            .expect("execute");
        assert_eq!(payload["total_duplicate_groups"], 1);
    }

    #[tokio::test]
    async fn test_out_of_sandbox_rejected() {
        let sandbox = tempfile::TempDir::new().expect("sandbox");
        let outside = tempfile::TempDir::new().expect("outside");

        let tool = FolderDuplicatesTool::new(vec![sandbox.path().to_path_buf()]);
        let err = tool
            .execute(
                serde_json::json!({"folder_path": outside.path().display().to_string()}),
                &ctx(),
            )
            .await
            .expect_err("outside sandbox");
        assert!(matches!(err, ToolError::OutOfSandbox(_)));
    }

    #[tokio::test]
    async fn test_no_sandbox_roots_is_invalid_input() {
        let tool = FolderDuplicatesTool::new(vec![]);
        let err = tool
            .execute(serde_json::json!({}), &ctx())
            .await
            .expect_err("no roots");
        assert!(matches!(err, ToolError::InvalidInput(_)));
    }

    #[test]
    fn test_bytes_to_mb() {
        assert!((bytes_to_mb(0) - 0.0).abs() < f64::EPSILON);
        // 398 KiB wasted in the duplicate-listing scenario.
        assert!((bytes_to_mb(401_800) - 0.38).abs() < f64::EPSILON);
        assert!((bytes_to_mb(1024 * 1024) - 1.0).abs() < f64::EPSILON);
    }
}
