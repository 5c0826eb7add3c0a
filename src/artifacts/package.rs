//! Report packaging: zips a job's `reports_dir` into a single archive.
//!
//! Everything here is blocking I/O; async callers go through
//! `tokio::task::spawn_blocking`.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use zip::CompressionMethod;
use zip::write::SimpleFileOptions;

use crate::error::ArtifactError;

/// Report files the analysis is expected to produce.
pub const REPORT_NAMES: &[&str] = &[
    "EXHAUSTIVE_GENETIC_REPORT.md",
    "EXHAUSTIVE_DISEASE_RISK_REPORT.md",
    "ACTIONABLE_HEALTH_PROTOCOL_V3.md",
    "comprehensive_results.json",
];

/// Package every regular file under `reports_dir` into a deflated ZIP at `dest`.
///
/// Entries are stored by path relative to `reports_dir` with `/` separators.
/// Returns the entry names in archive order.
pub fn package_reports(reports_dir: &Path, dest: &Path) -> Result<Vec<String>, ArtifactError> {
    let mut files = Vec::new();
    collect_files(reports_dir, reports_dir, &mut files)?;
    files.sort();

    if files.is_empty() {
        return Err(ArtifactError::NoReports(reports_dir.to_path_buf()));
    }

    let missing: Vec<&str> = REPORT_NAMES
        .iter()
        .copied()
        .filter(|name| !files.iter().any(|(entry, _)| entry == name))
        .collect();
    if !missing.is_empty() {
        warn!(dir = %reports_dir.display(), ?missing, "Expected reports missing from output");
    }

    let out = File::create(dest).map_err(|e| ArtifactError::io(dest, e))?;
    let mut writer = zip::ZipWriter::new(out);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut names = Vec::with_capacity(files.len());
    for (entry, path) in files {
        writer
            .start_file(entry.as_str(), options)
            .map_err(|e| ArtifactError::Packaging(format!("{entry}: {e}")))?;
        let mut src = File::open(&path).map_err(|e| ArtifactError::io(&path, e))?;
        io::copy(&mut src, &mut writer).map_err(|e| ArtifactError::io(&path, e))?;
        names.push(entry);
    }
    writer
        .finish()
        .map_err(|e| ArtifactError::Packaging(format!("finalize {}: {e}", dest.display())))?;

    debug!(dest = %dest.display(), entries = names.len(), "Reports packaged");
    Ok(names)
}

/// List the entry names of a packaged archive.
pub fn archive_entries(path: &Path) -> Result<Vec<String>, ArtifactError> {
    let file = File::open(path).map_err(|e| ArtifactError::io(path, e))?;
    let archive = zip::ZipArchive::new(file)
        .map_err(|e| ArtifactError::Packaging(format!("read {}: {e}", path.display())))?;
    let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
    names.sort();
    Ok(names)
}

fn collect_files(
    base: &Path,
    dir: &Path,
    out: &mut Vec<(String, PathBuf)>,
) -> Result<(), ArtifactError> {
    let entries = std::fs::read_dir(dir).map_err(|e| ArtifactError::io(dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| ArtifactError::io(dir, e))?;
        let path = entry.path();
        let file_type = entry.file_type().map_err(|e| ArtifactError::io(&path, e))?;
        if file_type.is_dir() {
            collect_files(base, &path, out)?;
        } else if file_type.is_file() {
            let relative = path
                .strip_prefix(base)
                .map_err(|e| ArtifactError::Packaging(e.to_string()))?;
            let name = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            out.push((name, path));
        }
    }
    Ok(())
}
