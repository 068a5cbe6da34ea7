//! Scanning inputs and packing them into a single tar stream
//!
//! A batch's packed stream is a tar archive whose entry paths are rooted at
//! the input's own name (`photos/2024/a.jpg`), with mode bits and mtimes
//! taken from the scan. Headers are built from the scan records alone, so
//! packing the same unchanged input twice produces the same bytes.
//!
//! Unpacking refuses links, absolute paths and `..` components.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::debug;

use svault_core::FileRecord;

use crate::blake3::{hash_file_streaming, hash_to_hex};

/// A file found by `scan`, with the local path it will be read from.
#[derive(Debug, Clone)]
pub struct ScannedFile {
    pub record: FileRecord,
    pub source: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ScanResult {
    /// Name of the input file or folder; every entry path starts with it
    pub root_name: String,
    pub is_directory: bool,
    /// Files in archive order (sorted by relative path)
    pub files: Vec<ScannedFile>,
    /// Directory entries in archive order, so empty folders survive
    pub directories: Vec<String>,
    /// Symlinks and excluded names that were left out
    pub skipped: u64,
}

impl ScanResult {
    /// Sum of file sizes
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.record.size).sum()
    }

    pub fn records(&self) -> Vec<FileRecord> {
        self.files.iter().map(|f| f.record.clone()).collect()
    }
}

/// Enumerate `input` (a file or a folder), hashing every regular file.
///
/// Symlinks below the input are skipped, as is anything whose file name
/// matches one of `exclude`.
pub fn scan(input: &Path, exclude: &[glob::Pattern]) -> Result<ScanResult> {
    let meta = std::fs::metadata(input)
        .with_context(|| format!("stat input: {}", input.display()))?;
    let root_name = root_name(input)?;

    let mut result = ScanResult {
        root_name: root_name.clone(),
        is_directory: meta.is_dir(),
        files: Vec::new(),
        directories: Vec::new(),
        skipped: 0,
    };

    if meta.is_dir() {
        result.directories.push(root_name.clone());
        walk(input, &root_name, exclude, &mut result)?;
    } else if meta.is_file() {
        result.files.push(scan_file(input, root_name, &meta)?);
    } else {
        anyhow::bail!("input is neither a file nor a directory: {}", input.display());
    }

    debug!(
        input = %input.display(),
        files = result.files.len(),
        bytes = result.total_size(),
        skipped = result.skipped,
        "scanned"
    );
    Ok(result)
}

fn root_name(input: &Path) -> Result<String> {
    if let Some(name) = input.file_name() {
        return Ok(name.to_string_lossy().into_owned());
    }
    // "." or "..": name it after the directory it resolves to
    let canonical = input
        .canonicalize()
        .with_context(|| format!("resolving input: {}", input.display()))?;
    Ok(canonical
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "archive".to_string()))
}

fn walk(
    dir: &Path,
    rel_prefix: &str,
    exclude: &[glob::Pattern],
    out: &mut ScanResult,
) -> Result<()> {
    let mut entries = std::fs::read_dir(dir)
        .with_context(|| format!("reading directory: {}", dir.display()))?
        .collect::<io::Result<Vec<_>>>()
        .with_context(|| format!("listing directory: {}", dir.display()))?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name().to_string_lossy().into_owned();
        if exclude.iter().any(|p| p.matches(&name)) {
            debug!(name = %name, "excluded");
            out.skipped += 1;
            continue;
        }

        let path = entry.path();
        let meta = std::fs::symlink_metadata(&path)
            .with_context(|| format!("stat: {}", path.display()))?;
        let rel = format!("{rel_prefix}/{name}");

        if meta.file_type().is_symlink() {
            debug!(path = %path.display(), "skipping symlink");
            out.skipped += 1;
        } else if meta.is_dir() {
            out.directories.push(rel.clone());
            walk(&path, &rel, exclude, out)?;
        } else if meta.is_file() {
            out.files.push(scan_file(&path, rel, &meta)?);
        } else {
            out.skipped += 1;
        }
    }
    Ok(())
}

fn scan_file(path: &Path, relative_path: String, meta: &std::fs::Metadata) -> Result<ScannedFile> {
    let hash = hash_file_streaming(path)?;
    Ok(ScannedFile {
        record: FileRecord {
            relative_path,
            size: meta.len(),
            hash: hash_to_hex(&hash),
            mode: file_mode(meta),
            mtime: meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0),
        },
        source: path.to_path_buf(),
    })
}

#[cfg(unix)]
fn file_mode(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(meta: &std::fs::Metadata) -> u32 {
    if meta.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

/// Write the packed stream for `scan` into `out`, returning the writer.
///
/// Fails if a file's size no longer matches the scan.
pub fn write_archive<W: Write>(scan: &ScanResult, out: W) -> Result<W> {
    let mut builder = tar::Builder::new(out);

    for dir in &scan.directories {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Directory);
        header.set_size(0);
        header.set_mode(0o755);
        header.set_mtime(0);
        builder
            .append_data(&mut header, format!("{dir}/"), io::empty())
            .with_context(|| format!("packing directory {dir}"))?;
    }

    for file in &scan.files {
        let rec = &file.record;
        let handle = File::open(&file.source)
            .with_context(|| format!("opening {}", file.source.display()))?;
        let actual = handle
            .metadata()
            .with_context(|| format!("stat {}", file.source.display()))?
            .len();
        if actual != rec.size {
            anyhow::bail!(
                "{} changed since it was scanned ({} bytes, now {actual})",
                file.source.display(),
                rec.size
            );
        }

        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(rec.size);
        header.set_mode(rec.mode);
        header.set_mtime(rec.mtime);
        builder
            .append_data(&mut header, &rec.relative_path, handle.take(rec.size))
            .with_context(|| format!("packing {}", rec.relative_path))?;
    }

    builder.into_inner().context("finishing packed stream")
}

/// Unpack a packed stream into `dest`, returning the number of files written.
///
/// The reader is drained to its end even after the archive terminator so a
/// producer on the other side of a pipe never sees a broken pipe.
pub fn unpack_archive<R: Read>(reader: R, dest: &Path) -> Result<u64> {
    std::fs::create_dir_all(dest)
        .with_context(|| format!("creating output directory: {}", dest.display()))?;

    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_overwrite(true);

    let mut files = 0u64;
    for entry in archive.entries().context("reading packed stream")? {
        let mut entry = entry.context("reading packed entry")?;
        let kind = entry.header().entry_type();
        let path = entry.path().context("entry path")?.into_owned();

        if !(kind.is_file() || kind.is_dir()) {
            anyhow::bail!("refusing to unpack {:?} entry: {}", kind, path.display());
        }
        if !is_safe_path(&path) {
            anyhow::bail!("refusing to unpack unsafe path: {}", path.display());
        }
        if !entry
            .unpack_in(dest)
            .with_context(|| format!("unpacking {}", path.display()))?
        {
            anyhow::bail!("entry escapes output directory: {}", path.display());
        }
        if kind.is_file() {
            files += 1;
        }
    }

    let mut rest = archive.into_inner();
    io::copy(&mut rest, &mut io::sink()).context("draining packed stream")?;
    Ok(files)
}

fn is_safe_path(path: &Path) -> bool {
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn default_excludes() -> Vec<glob::Pattern> {
        [".DS_Store", "Thumbs.db", "__MACOSX"]
            .iter()
            .map(|p| glob::Pattern::new(p).unwrap())
            .collect()
    }

    fn make_tree(root: &Path) {
        std::fs::create_dir_all(root.join("sub/deeper")).unwrap();
        std::fs::create_dir_all(root.join("empty")).unwrap();
        std::fs::create_dir_all(root.join("__MACOSX")).unwrap();
        std::fs::write(root.join("a.txt"), b"alpha").unwrap();
        std::fs::write(root.join("sub/b.bin"), vec![0xABu8; 10_000]).unwrap();
        std::fs::write(root.join("sub/deeper/c.txt"), b"").unwrap();
        std::fs::write(root.join(".DS_Store"), b"junk").unwrap();
        std::fs::write(root.join("__MACOSX/x"), b"junk").unwrap();
    }

    #[test]
    fn scan_directory_skips_excluded() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("photos");
        make_tree(&root);

        let result = scan(&root, &default_excludes()).unwrap();
        assert!(result.is_directory);
        assert_eq!(result.root_name, "photos");

        let paths: Vec<_> = result
            .files
            .iter()
            .map(|f| f.record.relative_path.as_str())
            .collect();
        assert_eq!(
            paths,
            vec!["photos/a.txt", "photos/sub/b.bin", "photos/sub/deeper/c.txt"]
        );
        assert!(result.directories.contains(&"photos/empty".to_string()));
        assert_eq!(result.skipped, 2);
        assert_eq!(result.total_size(), 5 + 10_000);
    }

    #[cfg(unix)]
    #[test]
    fn scan_skips_symlinks() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("data");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("real.txt"), b"x").unwrap();
        std::os::unix::fs::symlink(root.join("real.txt"), root.join("link.txt")).unwrap();

        let result = scan(&root, &[]).unwrap();
        assert_eq!(result.files.len(), 1);
        assert_eq!(result.skipped, 1);
    }

    #[test]
    fn scan_single_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("report.pdf");
        std::fs::write(&path, b"%PDF").unwrap();

        let result = scan(&path, &[]).unwrap();
        assert!(!result.is_directory);
        assert_eq!(result.files.len(), 1);
        assert_eq!(result.files[0].record.relative_path, "report.pdf");
        assert!(result.directories.is_empty());
    }

    #[test]
    fn pack_unpack_roundtrip_preserves_content() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("photos");
        make_tree(&root);
        let result = scan(&root, &default_excludes()).unwrap();

        let packed = write_archive(&result, Vec::new()).unwrap();
        let out = tmp.path().join("restored");
        let count = unpack_archive(&packed[..], &out).unwrap();

        assert_eq!(count, 3);
        assert_eq!(std::fs::read(out.join("photos/a.txt")).unwrap(), b"alpha");
        assert_eq!(
            std::fs::read(out.join("photos/sub/b.bin")).unwrap(),
            vec![0xABu8; 10_000]
        );
        assert!(out.join("photos/empty").is_dir());
        assert!(!out.join("photos/.DS_Store").exists());
    }

    #[test]
    fn packing_is_deterministic() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("photos");
        make_tree(&root);
        let result = scan(&root, &default_excludes()).unwrap();

        let a = write_archive(&result, Vec::new()).unwrap();
        let b = write_archive(&result, Vec::new()).unwrap();
        assert_eq!(a, b);
    }

    #[cfg(unix)]
    #[test]
    fn unpack_preserves_mode_bits() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("bin");
        std::fs::create_dir_all(&root).unwrap();
        let script = root.join("run.sh");
        std::fs::write(&script, b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o750)).unwrap();

        let result = scan(&root, &[]).unwrap();
        let packed = write_archive(&result, Vec::new()).unwrap();
        let out = tmp.path().join("out");
        unpack_archive(&packed[..], &out).unwrap();

        let mode = std::fs::metadata(out.join("bin/run.sh"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o750);
    }

    #[test]
    fn pack_detects_size_change() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("grow.txt");
        std::fs::write(&path, b"short").unwrap();
        let result = scan(&path, &[]).unwrap();
        std::fs::write(&path, b"much longer now").unwrap();

        assert!(write_archive(&result, Vec::new()).is_err());
    }

    #[test]
    fn unpack_rejects_symlink_entries() {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        header.set_mode(0o777);
        builder
            .append_link(&mut header, "evil", "/etc/passwd")
            .unwrap();
        let packed = builder.into_inner().unwrap();

        let tmp = TempDir::new().unwrap();
        let err = unpack_archive(&packed[..], tmp.path()).unwrap_err();
        assert!(err.to_string().contains("refusing"));
    }

    #[test]
    fn safe_path_rules() {
        assert!(is_safe_path(Path::new("a/b/c.txt")));
        assert!(is_safe_path(Path::new("./a")));
        assert!(!is_safe_path(Path::new("../a")));
        assert!(!is_safe_path(Path::new("a/../../b")));
        assert!(!is_safe_path(Path::new("/etc/passwd")));
    }
}
