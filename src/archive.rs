//! Extension-dispatched archive extraction.
//!
//! Archives are recognised by file-name suffix alone and always extracted
//! next to themselves. Extraction runs while holding an [`ArchiveLock`], by
//! default one lock shared by the whole process.

use std::env;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};

use bzip2::read::MultiBzDecoder;
use flate2::read::MultiGzDecoder;
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use uuid::Uuid;
use xz2::read::XzDecoder;
use zip::ZipArchive;

use crate::error::{FetchError, Result};
use crate::utils::str_to_bool;

static GLOBAL_ARCHIVE_LOCK: Lazy<ArchiveLock> = Lazy::new(ArchiveLock::new);

/// Binaries tried, in order, for native 7z extraction.
const SEVEN_ZIP_TOOLS: &[&str] = &["7z", "7zz", "7za"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    Gzip,
    Xz,
    Bzip2,
    SevenZip,
    TarGzip,
    TarXz,
    TarBzip2,
    TarSevenZip,
}

/// Suffix table, compound suffixes first so `.tar.gz` never reads as `.gz`.
pub const ARCHIVE_SUFFIXES: &[(&str, ArchiveKind)] = &[
    (".tar.gz", ArchiveKind::TarGzip),
    (".tar.xz", ArchiveKind::TarXz),
    (".tar.bz2", ArchiveKind::TarBzip2),
    (".tar.7z", ArchiveKind::TarSevenZip),
    (".zip", ArchiveKind::Zip),
    (".gz", ArchiveKind::Gzip),
    (".xz", ArchiveKind::Xz),
    (".bz2", ArchiveKind::Bzip2),
    (".7z", ArchiveKind::SevenZip),
];

impl ArchiveKind {
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        ARCHIVE_SUFFIXES
            .iter()
            .find(|(suffix, _)| name.len() > suffix.len() && name.ends_with(suffix))
            .map(|(_, kind)| *kind)
    }
}

/// How `.7z` layers are decompressed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SevenZipBackend {
    /// The native tool when it is on `PATH`, the library otherwise.
    #[default]
    Auto,
    /// Insist on the native tool, still falling back to the library if it fails.
    Native,
    Library,
}

impl SevenZipBackend {
    /// Reads `USE_7ZIP`; unset or unrecognised values mean [`SevenZipBackend::Auto`].
    pub fn from_env() -> Self {
        match env::var("USE_7ZIP").ok().as_deref().and_then(str_to_bool) {
            Some(true) => SevenZipBackend::Native,
            Some(false) => SevenZipBackend::Library,
            None => SevenZipBackend::Auto,
        }
    }
}

/// Serializes extractions. Clones share the same lock.
#[derive(Clone, Debug)]
pub struct ArchiveLock(Arc<Mutex<()>>);

impl ArchiveLock {
    /// A lock independent of every other one.
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(())))
    }

    /// The process-wide lock.
    pub fn global() -> Self {
        GLOBAL_ARCHIVE_LOCK.clone()
    }

    pub fn acquire(&self) -> MutexGuard<'_, ()> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[cfg(test)]
    fn same_as(&self, other: &ArchiveLock) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Default for ArchiveLock {
    fn default() -> Self {
        Self::global()
    }
}

#[derive(Clone, Debug)]
pub struct UnpackOptions {
    /// Delete the archive once extracted.
    pub remove: bool,
    pub seven_zip: SevenZipBackend,
    pub lock: ArchiveLock,
}

impl Default for UnpackOptions {
    fn default() -> Self {
        Self {
            remove: true,
            seven_zip: SevenZipBackend::from_env(),
            lock: ArchiveLock::default(),
        }
    }
}

/// A recognised archive on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Archive {
    pub path: PathBuf,
    pub kind: ArchiveKind,
}

impl Archive {
    pub fn detect(path: &Path) -> Option<Self> {
        ArchiveKind::from_path(path).map(|kind| Self {
            path: path.to_path_buf(),
            kind,
        })
    }

    fn dest(&self) -> PathBuf {
        match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    /// `archive.tar.gz` -> `archive.tar`, `file.bin.xz` -> `file.bin`.
    fn stripped(&self, suffix: &str) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let stem = name.strip_suffix(suffix).unwrap_or(&name);
        self.dest().join(stem)
    }

    /// Hidden scratch directory next to the archive for the `.7z` layer of a `.tar.7z`.
    fn staging_dir(&self) -> PathBuf {
        let stem = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.dest()
            .join(format!(".{}-{}", stem, Uuid::new_v4().simple()))
    }

    // The inner tar keeps whatever name it was packed under, which need not
    // match the outer file name.
    fn unpack_tar_7z(&self, staging: &Path, dest: &Path, seven_zip: SevenZipBackend) -> Result<()> {
        fs::create_dir_all(staging)?;
        unpack_7z(&self.path, staging, seven_zip)?;
        let tars = find_tars(staging)?;
        if tars.is_empty() {
            return Err(FetchError::archive(&self.path, "no tar archive inside the 7z layer"));
        }
        for tar in &tars {
            debug!("unpacking inner {}", tar.display());
            unpack_tar(tar, dest, |f| f)?;
        }
        Ok(())
    }

    /// Extracts next to the archive and returns what was produced: the
    /// directory for multi-entry formats, the output file for single streams.
    pub fn extract(&self, seven_zip: SevenZipBackend) -> Result<PathBuf> {
        let dest = self.dest();
        match self.kind {
            ArchiveKind::Zip => {
                unpack_zip(&self.path, &dest)?;
                Ok(dest)
            }
            ArchiveKind::Gzip => {
                let out = self.stripped(".gz");
                decompress(&self.path, &out, MultiGzDecoder::new)?;
                Ok(out)
            }
            ArchiveKind::Xz => {
                let out = self.stripped(".xz");
                decompress(&self.path, &out, XzDecoder::new)?;
                Ok(out)
            }
            ArchiveKind::Bzip2 => {
                let out = self.stripped(".bz2");
                decompress(&self.path, &out, MultiBzDecoder::new)?;
                Ok(out)
            }
            ArchiveKind::SevenZip => {
                unpack_7z(&self.path, &dest, seven_zip)?;
                Ok(dest)
            }
            ArchiveKind::TarGzip => {
                unpack_tar(&self.path, &dest, MultiGzDecoder::new)?;
                Ok(dest)
            }
            ArchiveKind::TarXz => {
                unpack_tar(&self.path, &dest, XzDecoder::new)?;
                Ok(dest)
            }
            ArchiveKind::TarBzip2 => {
                unpack_tar(&self.path, &dest, MultiBzDecoder::new)?;
                Ok(dest)
            }
            ArchiveKind::TarSevenZip => {
                let staging = self.staging_dir();
                let result = self.unpack_tar_7z(&staging, &dest, seven_zip);
                if let Err(e) = fs::remove_dir_all(&staging) {
                    warn!("could not remove {}: {}", staging.display(), e);
                }
                result?;
                Ok(dest)
            }
        }
    }
}

/// Unpacks `path` according to its suffix.
///
/// Unknown suffixes are a no-op returning `Ok(None)`. A recognised but
/// missing archive is [`FetchError::ArchiveNotFound`].
pub fn unpack_archive(path: &Path, options: &UnpackOptions) -> Result<Option<PathBuf>> {
    let Some(archive) = Archive::detect(path) else {
        debug!("{} is not a recognised archive", path.display());
        return Ok(None);
    };
    if !path.is_file() {
        return Err(FetchError::ArchiveNotFound(path.to_path_buf()));
    }

    let output = {
        let _guard = options.lock.acquire();
        archive.extract(options.seven_zip)?
    };

    if options.remove {
        fs::remove_file(path)?;
    }
    info!("unpacked {} into {}", path.display(), output.display());
    Ok(Some(output))
}

/// [`unpack_archive`] on the blocking thread pool.
pub async fn unpack_archive_async(path: PathBuf, options: UnpackOptions) -> Result<Option<PathBuf>> {
    tokio::task::spawn_blocking(move || unpack_archive(&path, &options))
        .await
        .map_err(|e| FetchError::Io(io::Error::new(io::ErrorKind::Other, e)))?
}

/// The folder the archive unpacks into, taken from the first zip entry.
///
/// `None` when the archive is empty or its first entry sits at the root
/// (`README.md` rather than `repo-main/README.md`).
pub fn zip_root_name(path: &Path) -> Result<Option<String>> {
    let mut zip = ZipArchive::new(File::open(path)?).map_err(|e| FetchError::archive(path, e))?;
    if zip.is_empty() {
        return Ok(None);
    }
    let entry = zip.by_index_raw(0).map_err(|e| FetchError::archive(path, e))?;
    Ok(entry
        .name()
        .trim_start_matches('/')
        .split_once('/')
        .map(|(root, _)| root)
        .filter(|root| !root.is_empty())
        .map(str::to_string))
}

fn unpack_zip(path: &Path, dest: &Path) -> Result<()> {
    let mut zip = ZipArchive::new(File::open(path)?).map_err(|e| FetchError::archive(path, e))?;
    zip.extract(dest).map_err(|e| FetchError::archive(path, e))
}

fn decompress<R, F>(path: &Path, out: &Path, decoder: F) -> Result<()>
where
    R: Read,
    F: FnOnce(File) -> R,
{
    let mut reader = decoder(File::open(path)?);
    let mut writer = File::create(out)?;
    io::copy(&mut reader, &mut writer).map_err(|e| FetchError::archive(path, e))?;
    Ok(())
}

fn unpack_tar<R, F>(path: &Path, dest: &Path, decoder: F) -> Result<()>
where
    R: Read,
    F: FnOnce(File) -> R,
{
    let mut archive = tar::Archive::new(decoder(File::open(path)?));
    archive.unpack(dest).map_err(|e| FetchError::archive(path, e))
}

/// Every `.tar` file under `dir`, in a stable order.
fn find_tars(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in fs::read_dir(&current)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else if path.extension().map_or(false, |ext| ext == "tar") {
                found.push(path);
            }
        }
    }
    found.sort();
    Ok(found)
}

/// True when `name` stays inside the directory it is extracted into.
fn is_contained(name: &str) -> bool {
    let normalized = name.replace('\\', "/");
    let path = Path::new(&normalized);
    path.components().next().is_some()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

fn find_7z_tool() -> Option<PathBuf> {
    SEVEN_ZIP_TOOLS.iter().find_map(|tool| which::which(tool).ok())
}

fn unpack_7z(path: &Path, dest: &Path, backend: SevenZipBackend) -> Result<()> {
    if backend != SevenZipBackend::Library {
        match find_7z_tool() {
            Some(tool) => match unpack_7z_native(&tool, path, dest) {
                Ok(()) => return Ok(()),
                Err(e) => warn!("{}, falling back to built-in 7z extraction", e),
            },
            None if backend == SevenZipBackend::Native => {
                warn!("7z not found on PATH, using built-in 7z extraction")
            }
            None => {}
        }
    }
    unpack_7z_library(path, dest)
}

fn unpack_7z_library(path: &Path, dest: &Path) -> Result<()> {
    let mut rejected: Option<String> = None;
    sevenz_rust::decompress_file_with_extract_fn(path, dest, |entry, reader, target| {
        if !is_contained(entry.name()) {
            rejected = Some(entry.name().to_string());
            return Ok(false);
        }
        sevenz_rust::default_entry_extract_fn(entry, reader, target)
    })
    .map_err(|e| FetchError::archive(path, e))?;

    match rejected {
        Some(name) => Err(FetchError::archive(
            path,
            format!("entry '{}' escapes the extraction directory", name),
        )),
        None => Ok(()),
    }
}

fn unpack_7z_native(tool: &Path, path: &Path, dest: &Path) -> Result<()> {
    debug!("extracting {} with {}", path.display(), tool.display());
    let status = Command::new(tool)
        .arg("x")
        .arg("-y")
        .arg("-bd")
        .arg("-bso0")
        .arg("-bse0")
        .arg(format!("-o{}", dest.display()))
        .arg(path)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()?;
    if status.success() {
        Ok(())
    } else {
        Err(FetchError::SevenZipTool {
            path: path.to_path_buf(),
            status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compound_suffixes_win() {
        assert_eq!(ArchiveKind::from_path(Path::new("a.tar.gz")), Some(ArchiveKind::TarGzip));
        assert_eq!(ArchiveKind::from_path(Path::new("a.tar.xz")), Some(ArchiveKind::TarXz));
        assert_eq!(ArchiveKind::from_path(Path::new("a.tar.bz2")), Some(ArchiveKind::TarBzip2));
        assert_eq!(ArchiveKind::from_path(Path::new("a.tar.7z")), Some(ArchiveKind::TarSevenZip));
        assert_eq!(ArchiveKind::from_path(Path::new("a.gz")), Some(ArchiveKind::Gzip));
        assert_eq!(ArchiveKind::from_path(Path::new("dir/a.7z")), Some(ArchiveKind::SevenZip));
        assert_eq!(ArchiveKind::from_path(Path::new("a.zip")), Some(ArchiveKind::Zip));
    }

    #[test]
    fn unknown_suffixes_are_ignored() {
        assert_eq!(ArchiveKind::from_path(Path::new("notes.txt")), None);
        assert_eq!(ArchiveKind::from_path(Path::new("archive.ZIP")), None);
        assert_eq!(ArchiveKind::from_path(Path::new(".zip")), None);
    }

    #[test]
    fn entries_must_stay_below_the_destination() {
        assert!(is_contained("pkg/a.txt"));
        assert!(is_contained("./a.txt"));
        assert!(!is_contained("../escaped.txt"));
        assert!(!is_contained("pkg/../../escaped.txt"));
        assert!(!is_contained("/etc/passwd"));
        assert!(!is_contained("..\\escaped.txt"));
        assert!(!is_contained(""));
    }

    fn zip_with(names: &[&str]) -> (tempfile::TempDir, PathBuf) {
        use std::io::Write;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("repo.zip");
        let mut writer = zip::ZipWriter::new(File::create(&path).unwrap());
        for name in names {
            writer
                .start_file(*name, zip::write::SimpleFileOptions::default())
                .unwrap();
            writer.write_all(b"x").unwrap();
        }
        writer.finish().unwrap();
        (dir, path)
    }

    #[test]
    fn root_name_comes_from_a_leading_folder() {
        let (_dir, path) = zip_with(&["repo-main/README.md", "repo-main/src/lib.rs"]);
        assert_eq!(zip_root_name(&path).unwrap().as_deref(), Some("repo-main"));
    }

    #[test]
    fn root_level_file_has_no_root_name() {
        let (_dir, path) = zip_with(&["README.md", "src/lib.rs"]);
        assert_eq!(zip_root_name(&path).unwrap(), None);
        let (_dir, path) = zip_with(&[]);
        assert_eq!(zip_root_name(&path).unwrap(), None);
    }

    #[test]
    fn stripped_output_sits_next_to_archive() {
        let archive = Archive::detect(Path::new("/tmp/x/data.json.xz")).unwrap();
        assert_eq!(archive.stripped(".xz"), PathBuf::from("/tmp/x/data.json"));
        let archive = Archive::detect(Path::new("bundle.tar.7z")).unwrap();
        assert_eq!(archive.stripped(".7z"), PathBuf::from("./bundle.tar"));
    }

    #[test]
    fn default_lock_is_shared() {
        assert!(ArchiveLock::default().same_as(&ArchiveLock::global()));
        assert!(!ArchiveLock::new().same_as(&ArchiveLock::global()));
    }
}
