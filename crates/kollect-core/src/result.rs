//! Streaming file-tree accumulator for collector output.
//!
//! Every collector produces a [`CollectorResult`]: a map from a
//! forward-slash relative path to either bytes held in memory, a regular
//! file already streamed to disk under the bundle root, or a symbolic link
//! to another key in the same result. The orchestrator merges the results
//! of all collectors into the final bundle tree.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufWriter};

/// Name of the per-collector error side file.
pub const ERRORS_FILE: &str = "errors.json";

/// Chunk size for streaming reads into the bundle tree.
const COPY_BUF_SIZE: usize = 64 * 1024;

/// A single entry in a collector result tree.
#[derive(Debug, Clone)]
pub enum ResultData {
    /// Bytes held in memory.
    Bytes(Bytes),
    /// A regular file already streamed to disk; holds the absolute path.
    File(PathBuf),
    /// A symbolic link to another key in the same result.
    SymLink(String),
}

/// Accumulated output of one or more collectors.
///
/// Keys are normalised relative paths: forward slashes, no leading `/`,
/// no `..` components. Entries are kept in a `BTreeMap` so iteration and
/// the on-disk layout are deterministic for identical inputs.
#[derive(Debug, Default)]
pub struct CollectorResult {
    entries: BTreeMap<String, ResultData>,
}

impl CollectorResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_key(&self, rel_path: &str) -> bool {
        match normalize_path(rel_path) {
            Ok(key) => self.entries.contains_key(&key),
            Err(_) => false,
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &ResultData)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Record an in-memory value at `rel_path`. A later write to the same
    /// key replaces the earlier one.
    pub fn save_bytes(&mut self, rel_path: &str, data: impl Into<Bytes>) -> Result<()> {
        let key = normalize_path(rel_path)?;
        self.entries.insert(key, ResultData::Bytes(data.into()));
        Ok(())
    }

    /// Serialize `value` as pretty JSON and record it at `rel_path`.
    pub fn save_json<T: serde::Serialize>(&mut self, rel_path: &str, value: &T) -> Result<()> {
        let data = serde_json::to_vec_pretty(value)?;
        self.save_bytes(rel_path, data)
    }

    /// Stream `reader` into the result.
    ///
    /// With a bundle root the bytes land at `root/rel_path` (parent
    /// directories created lazily) and the entry records the on-disk file;
    /// without one the bytes are buffered in memory.
    pub async fn save_result<R>(
        &mut self,
        root: Option<&Path>,
        rel_path: &str,
        mut reader: R,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let key = normalize_path(rel_path)?;

        match root {
            Some(root) => {
                let mut writer = self.get_writer(root, &key).await?;
                let mut buf = vec![0u8; COPY_BUF_SIZE];
                loop {
                    let n = reader
                        .read(&mut buf)
                        .await
                        .with_context(|| format!("streaming into {key}"))?;
                    if n == 0 {
                        break;
                    }
                    writer.write_all(&buf[..n]).await?;
                }
                self.close_writer(writer).await
            }
            None => {
                let mut data = Vec::new();
                reader
                    .read_to_end(&mut data)
                    .await
                    .with_context(|| format!("buffering {key}"))?;
                self.entries.insert(key, ResultData::Bytes(data.into()));
                Ok(())
            }
        }
    }

    /// Acquire a streaming write handle for `root/rel_path`.
    ///
    /// The underlying file is released when the writer is dropped; the
    /// entry is recorded by [`CollectorResult::close_writer`].
    pub async fn get_writer(&mut self, root: &Path, rel_path: &str) -> Result<ResultWriter> {
        let key = normalize_path(rel_path)?;
        let abs = root.join(&key);
        if let Some(parent) = abs.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let file = File::create(&abs)
            .await
            .with_context(|| format!("creating {}", abs.display()))?;
        Ok(ResultWriter {
            inner: BufWriter::new(file),
            key,
            abs,
        })
    }

    /// Flush a writer and record its file in the result.
    pub async fn close_writer(&mut self, mut writer: ResultWriter) -> Result<()> {
        writer.inner.flush().await?;
        writer.inner.get_mut().sync_all().await.ok();
        self.entries.insert(writer.key, ResultData::File(writer.abs));
        Ok(())
    }

    /// Record a symbolic link from `link_rel_path` to `target_rel_path`.
    ///
    /// The target must already be a key of this result. With a bundle root
    /// a relative symlink is also created on disk.
    pub fn symlink(
        &mut self,
        root: Option<&Path>,
        link_rel_path: &str,
        target_rel_path: &str,
    ) -> Result<()> {
        let link = normalize_path(link_rel_path)?;
        let target = normalize_path(target_rel_path)?;
        if !self.entries.contains_key(&target) {
            bail!("symlink target {target} is not in the result");
        }

        if let Some(root) = root {
            let link_abs = root.join(&link);
            if let Some(parent) = link_abs.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
            let rel_target = relative_link_target(&link, &target);
            match std::os::unix::fs::symlink(&rel_target, &link_abs) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    std::fs::remove_file(&link_abs)?;
                    std::os::unix::fs::symlink(&rel_target, &link_abs)?;
                }
                Err(e) => return Err(e).with_context(|| format!("linking {link}")),
            }
        }

        self.entries.insert(link, ResultData::SymLink(target));
        Ok(())
    }

    /// Shallow union with `other`; on key collision the later value wins.
    pub fn add_result(&mut self, other: CollectorResult) {
        self.entries.extend(other.entries);
    }

    /// Read the bytes behind `rel_path`, following symlinks inside the
    /// result. Callers cannot observe whether the entry was buffered in
    /// memory or streamed to disk.
    pub async fn get_bytes(&self, rel_path: &str) -> Result<Bytes> {
        let mut key = normalize_path(rel_path)?;
        // Bounded link chase; cycles are a programming error.
        for _ in 0..16 {
            match self.entries.get(&key) {
                Some(ResultData::Bytes(data)) => return Ok(data.clone()),
                Some(ResultData::File(abs)) => {
                    let data = fs::read(abs)
                        .await
                        .with_context(|| format!("reading {}", abs.display()))?;
                    return Ok(data.into());
                }
                Some(ResultData::SymLink(target)) => key = target.clone(),
                None => bail!("no entry at {key}"),
            }
        }
        bail!("symlink chain too deep at {rel_path}")
    }

    /// Write the canonical error side file for a collector: a JSON array
    /// of error strings at `<name>/errors.json`.
    pub fn save_errors(&mut self, name: &str, errors: &[String]) -> Result<()> {
        let doc = serde_json::to_vec_pretty(errors)?;
        self.save_bytes(&format!("{name}/{ERRORS_FILE}"), doc)
    }
}

/// Streaming write handle returned by [`CollectorResult::get_writer`].
///
/// Dropping the writer releases the file descriptor; the entry only lands
/// in the result once passed back to [`CollectorResult::close_writer`].
#[derive(Debug)]
pub struct ResultWriter {
    inner: BufWriter<File>,
    key: String,
    abs: PathBuf,
}

impl ResultWriter {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.inner
            .write_all(data)
            .await
            .with_context(|| format!("writing {}", self.key))
    }
}

/// Normalise a relative path: forward slashes only, `.` components and
/// empty segments dropped, `..` resolved without escaping the root,
/// leading slashes stripped.
pub fn normalize_path(rel_path: &str) -> Result<String> {
    let mut parts: Vec<&str> = Vec::new();
    for segment in rel_path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    bail!("path {rel_path:?} escapes the bundle root");
                }
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        bail!("path {rel_path:?} is empty after normalisation");
    }
    Ok(parts.join("/"))
}

/// Compute the relative on-disk target for a symlink at `link` pointing at
/// `target`, both normalised keys.
fn relative_link_target(link: &str, target: &str) -> PathBuf {
    let depth = link.split('/').count().saturating_sub(1);
    let mut out = PathBuf::new();
    for _ in 0..depth {
        out.push("..");
    }
    for part in target.split('/') {
        out.push(part);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("a/b/c.txt").unwrap(), "a/b/c.txt");
        assert_eq!(normalize_path("/etc/hostname").unwrap(), "etc/hostname");
        assert_eq!(normalize_path("a//b/./c").unwrap(), "a/b/c");
        assert_eq!(normalize_path("a/b/../c").unwrap(), "a/c");
        assert!(normalize_path("../escape").is_err());
        assert!(normalize_path("a/../../escape").is_err());
        assert!(normalize_path("").is_err());
        assert!(normalize_path("/").is_err());
    }

    #[test]
    fn test_second_write_wins() {
        let mut result = CollectorResult::new();
        result.save_bytes("pods/one.json", &b"first"[..]).unwrap();
        result.save_bytes("pods/one.json", &b"second"[..]).unwrap();

        assert_eq!(result.len(), 1);
        let data = futures::executor::block_on(result.get_bytes("pods/one.json")).unwrap();
        assert_eq!(&data[..], b"second");
    }

    #[tokio::test]
    async fn test_streamed_write_lands_on_disk() {
        let root = tempfile::tempdir().unwrap();
        let mut result = CollectorResult::new();

        result
            .save_result(Some(root.path()), "logs/pod.log", &b"hello\n"[..])
            .await
            .unwrap();

        let on_disk = tokio::fs::read(root.path().join("logs/pod.log"))
            .await
            .unwrap();
        assert_eq!(on_disk, b"hello\n");

        // The reader does not reveal the backing store.
        let via_reader = result.get_bytes("logs/pod.log").await.unwrap();
        assert_eq!(&via_reader[..], b"hello\n");
    }

    #[tokio::test]
    async fn test_writer_roundtrip() {
        let root = tempfile::tempdir().unwrap();
        let mut result = CollectorResult::new();

        let mut writer = result.get_writer(root.path(), "exec/out.txt").await.unwrap();
        writer.write_all(b"chunk-a").await.unwrap();
        writer.write_all(b"chunk-b").await.unwrap();
        result.close_writer(writer).await.unwrap();

        let data = result.get_bytes("exec/out.txt").await.unwrap();
        assert_eq!(&data[..], b"chunk-achunk-b");
    }

    #[tokio::test]
    async fn test_symlink_resolves_through_target() {
        let root = tempfile::tempdir().unwrap();
        let mut result = CollectorResult::new();
        result.save_bytes("ceph/status.json", &b"{}"[..]).unwrap();

        result
            .symlink(Some(root.path()), "aliases/status.json", "ceph/status.json")
            .unwrap();

        let data = result.get_bytes("aliases/status.json").await.unwrap();
        assert_eq!(&data[..], b"{}");

        let meta = std::fs::symlink_metadata(root.path().join("aliases/status.json")).unwrap();
        assert!(meta.file_type().is_symlink());
    }

    #[test]
    fn test_symlink_target_must_exist() {
        let mut result = CollectorResult::new();
        assert!(result.symlink(None, "link", "missing/target").is_err());
    }

    #[test]
    fn test_add_result_later_wins() {
        let mut a = CollectorResult::new();
        a.save_bytes("shared.txt", &b"a"[..]).unwrap();
        a.save_bytes("only-a.txt", &b"a"[..]).unwrap();

        let mut b = CollectorResult::new();
        b.save_bytes("shared.txt", &b"b"[..]).unwrap();

        a.add_result(b);
        assert_eq!(a.len(), 2);
        let data = futures::executor::block_on(a.get_bytes("shared.txt")).unwrap();
        assert_eq!(&data[..], b"b");
    }

    #[test]
    fn test_save_errors_shape() {
        let mut result = CollectorResult::new();
        result
            .save_errors("app-logs", &["selector matched nothing".to_string()])
            .unwrap();

        let data = futures::executor::block_on(result.get_bytes("app-logs/errors.json")).unwrap();
        let parsed: Vec<String> = serde_json::from_slice(&data).unwrap();
        assert_eq!(parsed, vec!["selector matched nothing"]);
    }
}
