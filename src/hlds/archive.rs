// Map archive reader - turns untrusted community zip/7z archives into a
// content tree hlds can mount directly

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use sevenz_rust::{Password, SevenZReader};
use thiserror::Error;

use crate::hlds::config::USER_CONTENT_DIR;

const MAGIC_7Z: [u8; 6] = [0x37, 0x7a, 0xbc, 0xaf, 0x27, 0x1c];
const MAGIC_ZIP: [u8; 4] = [0x50, 0x4b, 0x03, 0x04];
const MAGIC_RAR: [u8; 7] = [0x52, 0x61, 0x72, 0x21, 0x1a, 0x07, 0x00];

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive is not in a format we can handle")]
    UnknownArchive,

    #[error("archive contains paths with non-unicode characters")]
    InvalidPath,

    #[error("no .bsp file in archive")]
    MissingBsp,

    #[error("multiple .bsp files found in archive")]
    MultipleBsp,

    #[error("archive contains invalid paths: {0}")]
    UnsafePath(String),

    #[error("unable to read zip archive: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("unable to read 7z archive: {0}")]
    SevenZ(#[from] sevenz_rust::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveKind {
    Zip,
    SevenZ,
    Rar,
}

// None when no known magic number matches.
fn detect_archive_kind(path: &Path) -> Result<Option<ArchiveKind>, ArchiveError> {
    let mut file = File::open(path)?;

    let mut header = [0u8; 7];
    let mut filled = 0;
    while filled < header.len() {
        let n = file.read(&mut header[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    let header = &header[..filled];

    if header.starts_with(&MAGIC_7Z) {
        return Ok(Some(ArchiveKind::SevenZ));
    }
    if header.starts_with(&MAGIC_ZIP) {
        return Ok(Some(ArchiveKind::Zip));
    }
    if header.starts_with(&MAGIC_RAR) {
        return Ok(Some(ArchiveKind::Rar));
    }

    tracing::debug!(?header, "unable to find a known file header");

    Ok(None)
}

enum ArchiveReader {
    Zip(zip::ZipArchive<File>),
    SevenZ(SevenZReader<File>),
}

impl std::fmt::Debug for ArchiveReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Zip(_) => f.write_str("ArchiveReader::Zip(..)"),
            Self::SevenZ(_) => f.write_str("ArchiveReader::SevenZ(..)"),
        }
    }
}

impl ArchiveReader {
    fn open(path: &Path) -> Result<Self, ArchiveError> {
        match detect_archive_kind(path)? {
            Some(ArchiveKind::Zip) => {
                Ok(Self::Zip(zip::ZipArchive::new(File::open(path)?)?))
            }
            Some(ArchiveKind::SevenZ) => {
                Ok(Self::SevenZ(SevenZReader::open(path, Password::empty())?))
            }
            Some(ArchiveKind::Rar) | None => Err(ArchiveError::UnknownArchive),
        }
    }

    /// Raw names of every regular file entry.
    fn entry_paths(&mut self) -> Result<Vec<String>, ArchiveError> {
        match self {
            Self::Zip(zip) => {
                let mut files = Vec::with_capacity(zip.len());
                for i in 0..zip.len() {
                    let entry = zip.by_index(i)?;
                    if entry.is_dir() {
                        continue;
                    }
                    let name = std::str::from_utf8(entry.name_raw())
                        .map_err(|_| ArchiveError::InvalidPath)?;
                    files.push(name.to_string());
                }
                Ok(files)
            }
            // 7z entry names are stored as UTF-16 and always decode cleanly.
            Self::SevenZ(sz) => Ok(sz
                .archive()
                .files
                .iter()
                .filter(|entry| !entry.is_directory())
                .map(|entry| entry.name().to_string())
                .collect()),
        }
    }
}

/// A validated community map archive: the open archive plus the mapping from
/// entry paths to destination paths relative to the extraction root.
#[derive(Debug)]
pub struct MapArchive {
    reader: ArchiveReader,
    mapping: BTreeMap<String, String>,
}

pub fn read_map_archive_from_file(path: impl AsRef<Path>) -> Result<MapArchive, ArchiveError> {
    let path = path.as_ref();
    let mut reader = ArchiveReader::open(path)?;

    let mut files = Vec::new();
    for raw in reader.entry_paths()? {
        if is_path_garbage(&raw) {
            tracing::debug!(path = %raw, "skipping garbage");
            continue;
        }

        let cleaned = clean_archive_path(&raw);
        if cleaned.contains("..") {
            return Err(ArchiveError::UnsafePath(cleaned));
        }

        files.push(cleaned);
    }
    tracing::debug!(?files, "walked archive entries");

    let mapping = sanitize_mapping(generate_mapping(&files)?)?;
    tracing::debug!(?mapping, "derived extraction mapping");

    Ok(MapArchive { reader, mapping })
}

impl MapArchive {
    /// Name of the map, without the `.bsp` extension.
    pub fn map_name(&self) -> &str {
        self.mapping
            .values()
            .find(|dst| {
                archive_path_dir(dst) == "maps" && archive_path_ext(dst) == ".bsp"
            })
            .and_then(|dst| archive_path_base(dst).strip_suffix(".bsp"))
            .expect("mapping always holds a maps/*.bsp destination")
    }

    /// Materializes the mapping under `dst_base_dir` and writes the resource
    /// manifest next to the map. Returns the number of uncompressed bytes
    /// written.
    pub fn extract(&mut self, dst_base_dir: &Path) -> Result<u64, ArchiveError> {
        tracing::info!(dst = %dst_base_dir.display(), "extracting archive to disk");

        let Self { reader, mapping } = self;

        let mut total: u64 = 0;
        let mut extracted_names = Vec::with_capacity(mapping.len());
        let mut map_name = String::new();

        let result = match reader {
            ArchiveReader::Zip(zip) => {
                let mut failure = None;
                'entries: for i in 0..zip.len() {
                    let mut entry = match zip.by_index(i) {
                        Ok(entry) => entry,
                        Err(err) => {
                            failure = Some(err.into());
                            break 'entries;
                        }
                    };
                    if entry.is_dir() {
                        continue;
                    }
                    let Ok(raw) = std::str::from_utf8(entry.name_raw()) else {
                        continue;
                    };
                    let src = clean_archive_path(raw);
                    let Some(dst) = mapping.get(&src) else {
                        continue;
                    };

                    match extract_file(&mut entry, &dst_base_dir.join(dst)) {
                        Ok(written) => {
                            total += written;
                            extracted_names.push(dst.clone());
                            if let Some(stem) = dst.strip_suffix(".bsp") {
                                map_name = stem.to_string();
                            }
                        }
                        Err(err) => {
                            failure = Some(err);
                            break 'entries;
                        }
                    }
                }
                failure
            }
            ArchiveReader::SevenZ(sz) => {
                let mut failure: Option<ArchiveError> = None;
                sz.for_each_entries(|entry, entry_reader| {
                    if entry.is_directory() {
                        return Ok(true);
                    }
                    let src = clean_archive_path(entry.name());
                    let Some(dst) = mapping.get(&src) else {
                        return Ok(true);
                    };

                    match extract_file(entry_reader, &dst_base_dir.join(dst)) {
                        Ok(written) => {
                            total += written;
                            extracted_names.push(dst.clone());
                            if let Some(stem) = dst.strip_suffix(".bsp") {
                                map_name = stem.to_string();
                            }
                            Ok(true)
                        }
                        Err(err) => {
                            failure = Some(err);
                            Ok(false)
                        }
                    }
                })?;
                failure
            }
        };

        if let Some(err) = result {
            tracing::debug!(uncompressed = total, "extraction aborted");
            return Err(err);
        }

        let res_path = dst_base_dir.join(format!("{map_name}.res"));
        if let Err(err) = write_res_file(&res_path, &extracted_names) {
            tracing::error!(%err, path = %res_path.display(), "unable to write RES file");
        }

        tracing::info!(
            dst = %dst_base_dir.display(),
            uncompressed = total,
            "archive extracted"
        );

        Ok(total)
    }
}

fn extract_file(src: &mut dyn Read, dst_path: &Path) -> Result<u64, ArchiveError> {
    if let Some(dst_dir) = dst_path.parent() {
        if !dst_dir.exists() {
            fs::DirBuilder::new()
                .recursive(true)
                .mode(0o755)
                .create(dst_dir)?;
        }
    }

    let mut dst = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o644)
        .open(dst_path)?;

    Ok(io::copy(src, &mut dst)?)
}

// One extracted destination per line, the BSP itself excluded.
fn write_res_file(path: &Path, names: &[String]) -> io::Result<()> {
    tracing::debug!(path = %path.display(), ?names, "writing RES file");

    let mut file = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o644)
        .open(path)?;

    for name in names {
        if archive_path_ext(name) == ".bsp" {
            continue;
        }
        writeln!(file, "{name}")?;
    }

    Ok(())
}

/// Ensures the content root exists, extracts the archive into a fresh temp
/// directory under it, and returns that directory along with the map name.
pub fn prepare_addon_dir(archive_path: &Path) -> Result<(PathBuf, String), ArchiveError> {
    let mut archive = read_map_archive_from_file(archive_path)?;

    if !Path::new(USER_CONTENT_DIR).exists() {
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(USER_CONTENT_DIR)?;
    }

    let dst_dir = tempfile::Builder::new()
        .tempdir_in(USER_CONTENT_DIR)?
        .keep();

    if let Err(err) = archive.extract(&dst_dir) {
        let _ = fs::remove_dir_all(&dst_dir);
        return Err(err);
    }

    let map_name = archive.map_name().to_string();

    Ok((dst_dir, map_name))
}

fn is_path_garbage(path: &str) -> bool {
    path.starts_with("__MACOSX/") || archive_path_base(path) == ".DS_Store"
}

// Lexical normalization only: drops empty and "." segments. ".." segments are
// kept so the caller can reject them.
fn clean_archive_path(path: &str) -> String {
    path.split('/')
        .filter(|seg| !seg.is_empty() && *seg != ".")
        .collect::<Vec<_>>()
        .join("/")
}

// Get a usable tree out of random archives, ie. put the bsp in maps/ even if
// it sits at the root of the archive.
fn generate_mapping(files: &[String]) -> Result<BTreeMap<String, String>, ArchiveError> {
    let bsp_src = find_bsp_path(files)?;

    let mut mapping = BTreeMap::new();

    // Lone BSP at the root of the archive, no other file is expected to be
    // usable or in the right path in this archive. Bail.
    if !bsp_src.contains('/') {
        tracing::info!(bsp = %bsp_src, "found BSP at the archive's root");
        mapping.insert(bsp_src.to_string(), format!("maps/{bsp_src}"));
        return Ok(mapping);
    }

    // Consider the dir holding the BSP to be the maps dir and build the
    // hierarchy from its parent.
    let maps_dir = archive_path_dir(bsp_src);

    // Someone caring put a lone BSP and maybe a readme in a subdirectory to
    // avoid zip bombing your cwd. Assume a lone BSP and bail.
    if archive_path_base(maps_dir) != "maps" {
        tracing::warn!(bsp = %bsp_src, "found BSP in a weird path");
        mapping.insert(
            bsp_src.to_string(),
            format!("maps/{}", archive_path_base(bsp_src)),
        );
        return Ok(mapping);
    }

    let base_dir = archive_path_dir(maps_dir);
    tracing::debug!(bsp = %bsp_src, base = %base_dir, "found a proper hierarchy");

    Ok(remap_from_base_dir(files, base_dir))
}

fn remap_from_base_dir(files: &[String], base_dir: &str) -> BTreeMap<String, String> {
    let mut mapping = BTreeMap::new();

    for src in files {
        if !archive_path_has_prefix(src, base_dir) {
            tracing::debug!(
                src = %src,
                base_dir = %base_dir,
                "skipping file outside of found prefix"
            );
            continue;
        }

        mapping.insert(src.clone(), archive_path_trim_prefix(src, base_dir).to_string());
    }

    mapping
}

fn find_bsp_path(files: &[String]) -> Result<&str, ArchiveError> {
    let mut found: Option<&str> = None;

    for path in files {
        if path.ends_with(".bsp") {
            // Don't guess which one the user meant, surface the ambiguity.
            if found.is_some() {
                return Err(ArchiveError::MultipleBsp);
            }
            found = Some(path);
        }
    }

    found.ok_or(ArchiveError::MissingBsp)
}

fn sanitize_mapping(
    mapping: BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>, ArchiveError> {
    let mut ret = BTreeMap::new();
    let mut found_bsp = false;

    for (src, dst) in mapping {
        if !is_mapping_dest_valid(&dst) {
            tracing::debug!(src = %src, dst = %dst, "discarding invalid path");
            continue;
        }

        found_bsp = found_bsp || archive_path_ext(&dst) == ".bsp";
        ret.insert(src, dst);
    }

    // Since paths were removed, re-check that a BSP survived the filter.
    if !found_bsp {
        return Err(ArchiveError::MissingBsp);
    }

    Ok(ret)
}

fn is_mapping_dest_valid(dst: &str) -> bool {
    let dir = archive_path_dir(dst);
    let ext = archive_path_ext(dst);

    dir == "." && ext == ".wad"
        || dir == "gfx/env" && ext == ".tga"
        || dir == "maps" && (ext == ".bsp" || ext == ".cfg") // ignore .res, we generate our own
        || dir == "overviews" && (ext == ".tga" || ext == ".bmp" || ext == ".txt")
        || archive_path_has_prefix(dst, "sprites") && ext == ".spr"
        || archive_path_has_prefix(dst, "sound") && ext == ".wav"
        || archive_path_has_prefix(dst, "models") && ext == ".mdl"
}

// Mirrors the usual Dir/Base/Ext semantics for slash-separated archive paths.
fn archive_path_dir(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some((dir, _)) => dir,
        None => ".",
    }
}

fn archive_path_base(path: &str) -> &str {
    path.rsplit_once('/').map(|(_, base)| base).unwrap_or(path)
}

fn archive_path_ext(path: &str) -> &str {
    let base = archive_path_base(path);
    match base.rfind('.') {
        Some(i) => &base[i..],
        None => "",
    }
}

// Prefix as in "does this path start with the given _path_", not _string_.
fn archive_path_has_prefix(path: &str, prefix: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }

    let mut prefix = prefix.to_string();
    if !prefix.ends_with('/') {
        prefix.push('/');
    }

    if prefix == "./" {
        return true;
    }

    path.starts_with(&prefix)
}

fn archive_path_trim_prefix<'a>(path: &'a str, prefix: &str) -> &'a str {
    if prefix.is_empty() {
        return path;
    }

    let mut prefix = prefix.to_string();
    if !prefix.ends_with('/') {
        prefix.push('/');
    }

    if prefix == "./" {
        return path;
    }

    path.strip_prefix(&prefix).unwrap_or(path)
}
