//! Tar archives: per-artifact `.tar.gz` files and the root bundle.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tar::{Archive, Builder};
use tracing::warn;

use super::walker::{walk_directory, WalkOptions};
use crate::utils::errors::{CloneError, Result};

/// Root bundle compression
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleFormat {
    Gzip,
    Zstd,
}

impl BundleFormat {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "gzip" | "gz" => Ok(Self::Gzip),
            "zstd" | "zst" => Ok(Self::Zstd),
            other => Err(CloneError::Config(format!("unsupported bundle compression '{}'", other))),
        }
    }

    /// Detect the format from the first bytes of a file.
    ///
    /// Gzip starts with `1f 8b`, zstd frames with `28 b5 2f fd`.
    pub fn from_magic_bytes(data: &[u8]) -> Option<Self> {
        if data.starts_with(&[0x1f, 0x8b]) {
            Some(Self::Gzip)
        } else if data.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
            Some(Self::Zstd)
        } else {
            None
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Gzip => ".tar.gz",
            Self::Zstd => ".tar.zst",
        }
    }
}

/// One member of an archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub path: PathBuf,
    pub is_dir: bool,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ArchiveStats {
    pub entries: usize,
    pub bytes: u64,
    pub skipped: usize,
}

/// Archive `src` into a gzip tarball with members rooted at `prefix`,
/// leaving out everything on the exclusion list.
pub fn create_tar_gz(src: &Path, prefix: &Path, dest: &Path) -> Result<ArchiveStats> {
    create_tar_gz_with(src, prefix, dest, WalkOptions::default())
}

/// Like [`create_tar_gz`] with explicit walk options (no exclusions for
/// opaque data such as docker volumes).
pub fn create_tar_gz_with(
    src: &Path,
    prefix: &Path,
    dest: &Path,
    options: WalkOptions,
) -> Result<ArchiveStats> {
    if !src.is_dir() {
        return Err(CloneError::FileNotFound(src.display().to_string()));
    }

    let encoder = GzEncoder::new(File::create(dest)?, Compression::default());
    let mut builder = Builder::new(encoder);
    builder.follow_symlinks(false);

    let mut stats = ArchiveStats::default();
    if !prefix.as_os_str().is_empty() {
        builder.append_dir(prefix, src)?;
        stats.entries += 1;
    }

    for file in walk_directory(src, options.with_dirs())? {
        let name = prefix.join(&file.relative_path);
        let file_type = std::fs::symlink_metadata(&file.path)?.file_type();

        let appended = if file_type.is_dir() {
            builder.append_dir(&name, &file.path)
        } else if file_type.is_file() || file_type.is_symlink() {
            builder.append_path_with_name(&file.path, &name)
        } else {
            // sockets, fifos and devices are runtime state
            stats.skipped += 1;
            continue;
        };

        match appended {
            Ok(()) => {
                stats.entries += 1;
                stats.bytes += file.size;
            }
            Err(e) => {
                warn!("Skipping {}: {}", file.path.display(), e);
                stats.skipped += 1;
            }
        }
    }

    builder.into_inner()?.finish()?;
    Ok(stats)
}

/// List the members of a gzip tarball without extracting it.
pub fn list_tar_gz(path: &Path) -> Result<Vec<ArchiveEntry>> {
    let mut archive = Archive::new(GzDecoder::new(File::open(path)?));
    let mut entries = Vec::new();
    for entry in archive.entries()? {
        let entry = entry?;
        entries.push(ArchiveEntry {
            path: entry.path()?.into_owned(),
            is_dir: entry.header().entry_type().is_dir(),
        });
    }
    Ok(entries)
}

/// Extract a gzip tarball into `dest`, preserving permissions.
pub fn extract_tar_gz(path: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    unpack(GzDecoder::new(File::open(path)?), dest)
}

fn unpack<R: Read>(reader: R, dest: &Path) -> Result<()> {
    let mut archive = Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);
    archive
        .unpack(dest)
        .map_err(|e| CloneError::Archive(format!("unpack into {}: {}", dest.display(), e)))
}

/// Bundle a staging directory into the root archive.
pub fn pack_bundle(staging: &Path, dest: &Path, format: BundleFormat, level: i32) -> Result<()> {
    let file = File::create(dest)?;
    match format {
        BundleFormat::Gzip => {
            let level = level.clamp(0, 9) as u32;
            let encoder = append_all(GzEncoder::new(file, Compression::new(level)), staging)?;
            encoder.finish()?;
        }
        BundleFormat::Zstd => {
            let encoder = append_all(zstd::stream::write::Encoder::new(file, level)?, staging)?;
            encoder.finish()?;
        }
    }
    Ok(())
}

fn append_all<W: Write>(writer: W, staging: &Path) -> Result<W> {
    let mut builder = Builder::new(writer);
    builder.follow_symlinks(false);
    builder.append_dir_all(".", staging)?;
    Ok(builder.into_inner()?)
}

/// Extract a root archive, detecting gzip or zstd from its magic bytes.
pub fn unpack_bundle(path: &Path, dest: &Path) -> Result<()> {
    let mut magic = [0u8; 4];
    let read = File::open(path)?.read(&mut magic)?;
    let format = BundleFormat::from_magic_bytes(&magic[..read]).ok_or_else(|| {
        CloneError::Archive(format!("{} is neither gzip nor zstd", path.display()))
    })?;

    std::fs::create_dir_all(dest)?;
    let file = File::open(path)?;
    match format {
        BundleFormat::Gzip => unpack(GzDecoder::new(file), dest),
        BundleFormat::Zstd => unpack(zstd::stream::read::Decoder::new(file)?, dest),
    }
}
