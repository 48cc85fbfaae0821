//! Tar+gzip packing of configuration subtrees.
//!
//! # Purpose
//! Produces the byte stream used for consensus snapshots and unpacks it again
//! into a staging directory.
//!
//! # Key invariants
//! - Entries are emitted in sorted order with zeroed ownership and timestamps
//!   so identical trees produce identical archives.
//! - Only directories and regular files are packed; symlinks, sockets and
//!   devices are skipped.
//! - Unpacking never writes outside the allowed top-level prefixes: absolute
//!   paths, `..` components and entries under other prefixes are skipped.
use crate::Result;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use tar::{Archive, Builder, EntryType, Header};

const DIR_MODE: u32 = 0o755;
const FILE_MODE: u32 = 0o600;

/// Counts reported by [`unpack_confined`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UnpackReport {
    pub files: usize,
    pub dirs: usize,
    pub skipped: usize,
}

/// Pack `root/<subtree>` for each subtree into a gzip-compressed tar stream
/// written to `writer`. Missing subtrees are skipped. Returns the writer once
/// the gzip trailer has been flushed.
pub fn pack<W: Write>(root: &Path, subtrees: &[&str], writer: W) -> Result<W> {
    let encoder = GzEncoder::new(writer, Compression::default());
    let mut builder = Builder::new(encoder);
    builder.mode(tar::HeaderMode::Deterministic);
    for subtree in subtrees {
        let base = root.join(subtree);
        if !base.is_dir() {
            continue;
        }
        append_dir(&mut builder, &base, Path::new(subtree))?;
    }
    let encoder = builder.into_inner()?;
    Ok(encoder.finish()?)
}

fn append_dir<W: Write>(builder: &mut Builder<W>, dir: &Path, rel: &Path) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Directory);
    header.set_size(0);
    header.set_mode(DIR_MODE);
    header.set_mtime(0);
    builder.append_data(&mut header, format!("{}/", to_tar_path(rel)), std::io::empty())?;

    let mut children: Vec<_> = fs::read_dir(dir)?.collect::<std::io::Result<Vec<_>>>()?;
    children.sort_by_key(|entry| entry.file_name());
    for child in children {
        let child_rel = rel.join(child.file_name());
        let metadata = fs::symlink_metadata(child.path())?;
        if metadata.is_dir() {
            append_dir(builder, &child.path(), &child_rel)?;
        } else if metadata.is_file() {
            let data = fs::read(child.path())?;
            let mut header = Header::new_gnu();
            header.set_entry_type(EntryType::Regular);
            header.set_size(data.len() as u64);
            header.set_mode(FILE_MODE);
            header.set_mtime(0);
            builder.append_data(&mut header, to_tar_path(&child_rel), data.as_slice())?;
        } else {
            tracing::debug!(path = %child.path().display(), "skipping non-regular file in snapshot");
        }
    }
    Ok(())
}

fn to_tar_path(rel: &Path) -> String {
    rel.components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Unpack a stream produced by [`pack`] into `dest`, keeping only entries
/// whose normalized path starts with one of `allowed_prefixes`.
pub fn unpack_confined<R: Read>(
    reader: R,
    dest: &Path,
    allowed_prefixes: &[&str],
) -> Result<UnpackReport> {
    fs::create_dir_all(dest)?;
    let mut archive = Archive::new(GzDecoder::new(reader));
    let mut report = UnpackReport::default();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let raw_path = entry.path()?.into_owned();
        let Some(relative) = normalize_confined(&raw_path, allowed_prefixes) else {
            tracing::warn!(path = %raw_path.display(), "skipping snapshot entry outside allowed prefixes");
            report.skipped += 1;
            continue;
        };
        let target = dest.join(&relative);
        match entry.header().entry_type() {
            EntryType::Directory => {
                fs::create_dir_all(&target)?;
                report.dirs += 1;
            }
            EntryType::Regular | EntryType::Continuous => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                // Stream the body; the header size is not trusted.
                let mut file = fs::File::create(&target)?;
                io::copy(&mut entry, &mut file)?;
                set_file_mode(&target)?;
                report.files += 1;
            }
            _ => {
                report.skipped += 1;
            }
        }
    }
    Ok(report)
}

/// Return the path relative to the archive root when it is confined to one of
/// the allowed prefixes.
fn normalize_confined(path: &Path, allowed_prefixes: &[&str]) -> Option<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    let first = normalized.components().next()?;
    let first = first.as_os_str().to_str()?;
    if allowed_prefixes.contains(&first) {
        Some(normalized)
    } else {
        None
    }
}

#[cfg(unix)]
fn set_file_mode(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(FILE_MODE))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_file_mode(_path: &Path) -> Result<()> {
    Ok(())
}
