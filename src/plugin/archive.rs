//! Unpacking of downloaded plugin artifacts.
//!
//! Release assets are either an archive (`.tar.gz`, `.tgz`, `.tar`, `.zip`)
//! or the plugin executable itself. Extraction never writes outside the
//! destination directory.

use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::{Archive, EntryType};
use thiserror::Error;
use zip::ZipArchive;

/// Names that ship alongside binaries in release archives.
const DOC_FILES: &[&str] = &["license", "licence", "readme", "notice", "changelog", "authors"];

/// Errors raised while unpacking an artifact.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Archive entry escapes destination: {0}")]
    UnsafePath(PathBuf),

    #[error("Archive entry has an empty path")]
    EmptyPath,

    #[error("Invalid zip archive: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("No executables found in {0}")]
    NoExecutables(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// How an artifact is packed, judged by its file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    TarGz,
    Tar,
    Zip,
    Binary,
}

impl ArtifactKind {
    pub fn detect(path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Self::TarGz
        } else if name.ends_with(".tar") {
            Self::Tar
        } else if name.ends_with(".zip") {
            Self::Zip
        } else {
            Self::Binary
        }
    }
}

/// Strip `.` components and reject anything absolute or climbing out.
pub fn sanitize_archive_path(path: &Path) -> Result<PathBuf, ArchiveError> {
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::ParentDir => {
                return Err(ArchiveError::UnsafePath(path.to_path_buf()));
            }
            Component::CurDir => {}
            Component::Normal(part) => cleaned.push(part),
        }
    }
    if cleaned.as_os_str().is_empty() {
        return Err(ArchiveError::EmptyPath);
    }
    Ok(cleaned)
}

/// Unpack `artifact` into `dest` and return the executables it contained.
pub fn extract(artifact: &Path, dest: &Path) -> Result<Vec<PathBuf>, ArchiveError> {
    fs::create_dir_all(dest)?;

    let files = match ArtifactKind::detect(artifact) {
        ArtifactKind::TarGz => extract_tar(GzDecoder::new(File::open(artifact)?), dest)?,
        ArtifactKind::Tar => extract_tar(File::open(artifact)?, dest)?,
        ArtifactKind::Zip => extract_zip(artifact, dest)?,
        ArtifactKind::Binary => {
            let name = artifact
                .file_name()
                .ok_or_else(|| ArchiveError::UnsafePath(artifact.to_path_buf()))?;
            let out = dest.join(name);
            fs::copy(artifact, &out)?;
            return Ok(vec![out]);
        }
    };

    let executables: Vec<PathBuf> = files
        .into_iter()
        .filter(|(path, mode)| is_executable_candidate(path, *mode))
        .map(|(path, _)| path)
        .collect();

    if executables.is_empty() {
        return Err(ArchiveError::NoExecutables(artifact.to_path_buf()));
    }
    Ok(executables)
}

/// Regular files only; links and devices are skipped.
fn extract_tar(reader: impl io::Read, dest: &Path) -> Result<Vec<(PathBuf, Option<u32>)>, ArchiveError> {
    let mut archive = Archive::new(reader);
    let mut files = Vec::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let rel = sanitize_archive_path(&entry.path()?)?;
        let out = dest.join(&rel);

        match entry.header().entry_type() {
            EntryType::Directory => fs::create_dir_all(&out)?,
            EntryType::Regular | EntryType::Continuous => {
                if let Some(parent) = out.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mode = entry.header().mode().ok();
                let mut file = File::create(&out)?;
                io::copy(&mut entry, &mut file)?;
                files.push((out, mode));
            }
            other => {
                tracing::debug!("Skipping archive entry {} ({:?})", rel.display(), other);
            }
        }
    }
    Ok(files)
}

fn extract_zip(path: &Path, dest: &Path) -> Result<Vec<(PathBuf, Option<u32>)>, ArchiveError> {
    let mut archive = ZipArchive::new(File::open(path)?)?;
    let mut files = Vec::new();

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let raw = entry.name().replace('\\', "/");
        let out = dest.join(sanitize_archive_path(Path::new(&raw))?);

        if entry.is_dir() {
            fs::create_dir_all(&out)?;
            continue;
        }
        if let Some(parent) = out.parent() {
            fs::create_dir_all(parent)?;
        }
        let mode = entry.unix_mode();
        let mut file = File::create(&out)?;
        io::copy(&mut entry, &mut file)?;
        files.push((out, mode));
    }
    Ok(files)
}

/// A file is taken as a plugin when the archive marks it executable, or,
/// lacking mode bits, when it looks like a bare binary name.
fn is_executable_candidate(path: &Path, mode: Option<u32>) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    let stem = name.split('.').next().unwrap_or_default();
    if name.starts_with('.') || DOC_FILES.contains(&stem) {
        return false;
    }

    match mode {
        Some(mode) if mode & 0o111 != 0 => true,
        _ => path.extension().is_none() || name.ends_with(".exe"),
    }
}
