//! Workspace bundles: a zip holding the SQLite file plus a manifest that
//! records its SHA-256, so a restore can prove it got the bytes that were
//! exported.

use crate::db::DB_FILE_NAME;
use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const MANIFEST_ENTRY: &str = "manifest.json";
const DB_ENTRY: &str = "db/assessd.sqlite3";
const SQLITE_MAGIC: &[u8; 16] = b"SQLite format 3\0";
pub const BUNDLE_FORMAT_V1: &str = "assessd-workspace-v1";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BundleManifest {
    format: String,
    #[serde(default)]
    app_version: String,
    #[serde(default)]
    exported_at: String,
    db_sha256: String,
    db_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub bundle_format: String,
    pub entry_count: usize,
    pub db_sha256: String,
}

#[derive(Debug, Clone)]
pub struct ImportSummary {
    pub bundle_format: String,
    pub db_sha256: String,
}

/// Passes writes through to `inner`, hashing and counting what was accepted.
struct DigestWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> DigestWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    fn finish(self) -> (W, String, u64) {
        let hex = self
            .hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect();
        (self.inner, hex, self.written)
    }
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// A file being written next to its final location. Removed on drop unless
/// it was moved into place.
struct StagedFile {
    path: PathBuf,
    placed: bool,
}

impl StagedFile {
    fn create(path: PathBuf) -> anyhow::Result<(Self, File)> {
        let file = File::create(&path)
            .with_context(|| format!("failed to create temp database {}", path.display()))?;
        Ok((Self { path, placed: false }, file))
    }

    fn place(mut self, dst: &Path) -> anyhow::Result<()> {
        if cfg!(windows) && dst.exists() {
            std::fs::remove_file(dst)
                .with_context(|| format!("failed to remove existing database {}", dst.display()))?;
        }
        std::fs::rename(&self.path, dst)
            .with_context(|| format!("failed to move extracted database to {}", dst.display()))?;
        self.placed = true;
        Ok(())
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if !self.placed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

fn sibling(db_path: &Path, suffix: &str) -> PathBuf {
    let mut name = db_path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

pub fn export_workspace_bundle(
    workspace_path: &Path,
    out_path: &Path,
) -> anyhow::Result<ExportSummary> {
    let db_path = workspace_path.join(DB_FILE_NAME);
    let mut db_file = File::open(&db_path)
        .with_context(|| format!("workspace database not found: {}", db_path.display()))?;

    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    let out_file = File::create(out_path)
        .with_context(|| format!("failed to create output file {}", out_path.display()))?;
    let mut zip = ZipWriter::new(out_file);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    // The database goes first so the manifest can carry its digest.
    zip.start_file(DB_ENTRY, opts)
        .context("failed to start database entry")?;
    let mut sink = DigestWriter::new(&mut zip);
    io::copy(&mut db_file, &mut sink).context("failed to write database entry")?;
    let (_, db_sha256, db_bytes) = sink.finish();

    let manifest = BundleManifest {
        format: BUNDLE_FORMAT_V1.to_string(),
        app_version: env!("CARGO_PKG_VERSION").to_string(),
        exported_at: chrono::Utc::now().to_rfc3339(),
        db_sha256: db_sha256.clone(),
        db_bytes,
    };
    zip.start_file(MANIFEST_ENTRY, opts)
        .context("failed to start manifest entry")?;
    serde_json::to_writer_pretty(&mut zip, &manifest).context("failed to write manifest entry")?;
    zip.finish().context("failed to finalize zip bundle")?;

    tracing::info!(
        out = %out_path.display(),
        sha256 = %db_sha256,
        bytes = db_bytes,
        "exported workspace bundle"
    );

    Ok(ExportSummary {
        bundle_format: BUNDLE_FORMAT_V1.to_string(),
        entry_count: 2,
        db_sha256,
    })
}

fn read_manifest<R: Read + io::Seek>(archive: &mut ZipArchive<R>) -> anyhow::Result<BundleManifest> {
    let entry = archive
        .by_name(MANIFEST_ENTRY)
        .context("bundle missing manifest.json")?;
    let manifest: BundleManifest =
        serde_json::from_reader(entry).context("manifest.json is not a workspace manifest")?;
    if manifest.format != BUNDLE_FORMAT_V1 {
        return Err(anyhow!("unsupported bundle format: {}", manifest.format));
    }
    Ok(manifest)
}

fn check_sqlite_header(path: &Path) -> anyhow::Result<()> {
    let mut header = [0u8; 16];
    File::open(path)
        .and_then(|mut f| f.read_exact(&mut header))
        .context("extracted database is too short")?;
    if &header != SQLITE_MAGIC {
        return Err(anyhow!("extracted database is not a SQLite file"));
    }
    Ok(())
}

/// Restore a bundle into `workspace_path`. Nothing in the workspace changes
/// unless the extracted database matches the manifest.
pub fn import_workspace_bundle(
    in_path: &Path,
    workspace_path: &Path,
) -> anyhow::Result<ImportSummary> {
    let in_file = File::open(in_path)
        .with_context(|| format!("failed to open bundle {}", in_path.display()))?;
    let mut archive = ZipArchive::new(in_file).context("invalid zip archive")?;
    let manifest = read_manifest(&mut archive)?;
    let expected_sha = manifest.db_sha256.to_ascii_lowercase();

    std::fs::create_dir_all(workspace_path)
        .with_context(|| format!("failed to create workspace {}", workspace_path.display()))?;
    let dst = workspace_path.join(DB_FILE_NAME);
    let (staged, staged_file) = StagedFile::create(sibling(&dst, ".importing"))?;

    let mut sink = DigestWriter::new(staged_file);
    {
        let mut entry = archive
            .by_name(DB_ENTRY)
            .with_context(|| format!("bundle missing {}", DB_ENTRY))?;
        io::copy(&mut entry, &mut sink).context("failed to extract database entry")?;
    }
    let (staged_file, actual_sha, written) = sink.finish();
    staged_file
        .sync_all()
        .context("failed to flush extracted database")?;
    drop(staged_file);

    if actual_sha != expected_sha || written != manifest.db_bytes {
        return Err(anyhow!(
            "database checksum mismatch: manifest {} ({} bytes) vs extracted {} ({} bytes)",
            expected_sha,
            manifest.db_bytes,
            actual_sha,
            written
        ));
    }
    check_sqlite_header(&staged.path)?;

    // A leftover journal would be replayed against the restored file.
    for suffix in ["-journal", "-wal", "-shm"] {
        let stale = sibling(&dst, suffix);
        if stale.exists() {
            std::fs::remove_file(&stale)
                .with_context(|| format!("failed to remove {}", stale.display()))?;
        }
    }
    staged.place(&dst)?;

    tracing::info!(
        bundle = %in_path.display(),
        workspace = %workspace_path.display(),
        exported_at = %manifest.exported_at,
        from_version = %manifest.app_version,
        "imported workspace bundle"
    );

    Ok(ImportSummary {
        bundle_format: manifest.format,
        db_sha256: actual_sha,
    })
}
