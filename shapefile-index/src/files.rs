//! Sibling file resolution, per-file-type locking and copy-on-write storage.
//!
//! A shapefile set is a group of files sharing a base name and differing only
//! in extension. [`ShpFiles`] resolves each sibling (case-insensitively),
//! exposes its metadata and hands out scoped read/write guards so readers
//! and writers of the same handle never observe a half-replaced file.

use std::fmt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, RawRwLock, RwLock};
use tempfile::NamedTempFile;

use crate::errors::{ShapefileError, ShapefileResult};

/// The members of a shapefile set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FileType {
    /// Geometry records
    Shp,
    /// Record offsets
    Shx,
    /// Attribute rows
    Dbf,
    /// Projection text
    Prj,
    /// Spatial (quad-tree) index
    Qix,
    /// Identity (feature id) index
    Fix,
}

impl FileType {
    pub const ALL: [FileType; 6] = [
        FileType::Shp,
        FileType::Shx,
        FileType::Dbf,
        FileType::Prj,
        FileType::Qix,
        FileType::Fix,
    ];

    /// Lower-case extension without the dot.
    pub fn extension(&self) -> &'static str {
        match self {
            FileType::Shp => "shp",
            FileType::Shx => "shx",
            FileType::Dbf => "dbf",
            FileType::Prj => "prj",
            FileType::Qix => "qix",
            FileType::Fix => "fix",
        }
    }

    fn slot(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Shared read guard on one file type.
pub type FileReadGuard = ArcRwLockReadGuard<RawRwLock, ()>;
/// Exclusive write guard on one file type.
pub type FileWriteGuard = ArcRwLockWriteGuard<RawRwLock, ()>;

/// Handle on the sibling files of one shapefile set.
///
/// Cloning is cheap; clones share the same locks.
#[derive(Clone)]
pub struct ShpFiles {
    inner: Arc<ShpFilesInner>,
}

struct ShpFilesInner {
    dir: PathBuf,
    base_name: String,
    upper_case: bool,
    local: bool,
    locks: [Arc<RwLock<()>>; 6],
}

impl fmt::Debug for ShpFiles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShpFiles")
            .field("dir", &self.inner.dir)
            .field("base_name", &self.inner.base_name)
            .field("local", &self.inner.local)
            .finish()
    }
}

impl ShpFiles {
    /// Creates a handle for a set on a local file system. `path` may point at
    /// any member of the set or at the base name without extension.
    pub fn new(path: impl AsRef<Path>) -> ShapefileResult<ShpFiles> {
        Self::with_locality(path.as_ref(), true)
    }

    /// Creates a handle for a set that is not locally writable (for example a
    /// network mount). Indexes are used if present but never created.
    pub fn remote(path: impl AsRef<Path>) -> ShapefileResult<ShpFiles> {
        Self::with_locality(path.as_ref(), false)
    }

    fn with_locality(path: &Path, local: bool) -> ShapefileResult<ShpFiles> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                ShapefileError::InvalidOperation(format!(
                    "Not a shapefile path: {}",
                    path.display()
                ))
            })?;

        let (base_name, upper_case) = match file_name.rsplit_once('.') {
            Some((stem, ext))
                if FileType::ALL
                    .iter()
                    .any(|t| t.extension().eq_ignore_ascii_case(ext)) =>
            {
                let upper = ext.chars().all(|c| c.is_ascii_uppercase());
                (stem.to_string(), upper)
            }
            _ => (file_name.to_string(), false),
        };

        if base_name.is_empty() {
            return Err(ShapefileError::InvalidOperation(format!(
                "Not a shapefile path: {}",
                path.display()
            )));
        }

        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };

        Ok(ShpFiles {
            inner: Arc::new(ShpFilesInner {
                dir,
                base_name,
                upper_case,
                local,
                locks: std::array::from_fn(|_| Arc::new(RwLock::new(()))),
            }),
        })
    }

    /// Base name shared by every member, which doubles as the feature type name.
    pub fn type_name(&self) -> &str {
        &self.inner.base_name
    }

    pub fn is_local(&self) -> bool {
        self.inner.local
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Resolves the path of a member. An existing sibling whose extension
    /// differs only in case wins; otherwise the path follows the case of the
    /// extension the handle was opened with.
    pub fn path(&self, file_type: FileType) -> PathBuf {
        let ext = file_type.extension();
        let preferred = self.default_path(file_type);
        if preferred.exists() {
            return preferred;
        }

        let wanted_prefix = format!("{}.", self.inner.base_name);
        if let Ok(entries) = fs::read_dir(&self.inner.dir) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let Some(name) = name.to_str() else {
                    continue;
                };
                if let Some(candidate_ext) = name.strip_prefix(&wanted_prefix) {
                    if candidate_ext.eq_ignore_ascii_case(ext) {
                        return entry.path();
                    }
                }
            }
        }
        preferred
    }

    fn default_path(&self, file_type: FileType) -> PathBuf {
        let ext = if self.inner.upper_case {
            file_type.extension().to_ascii_uppercase()
        } else {
            file_type.extension().to_string()
        };
        self.inner
            .dir
            .join(format!("{}.{}", self.inner.base_name, ext))
    }

    pub fn exists(&self, file_type: FileType) -> bool {
        self.path(file_type).is_file()
    }

    /// Length in bytes, or zero when the file is absent.
    pub fn len(&self, file_type: FileType) -> u64 {
        fs::metadata(self.path(file_type))
            .map(|m| m.len())
            .unwrap_or(0)
    }

    pub fn modified(&self, file_type: FileType) -> Option<SystemTime> {
        fs::metadata(self.path(file_type))
            .and_then(|m| m.modified())
            .ok()
    }

    /// Opens a member for reading.
    pub fn open_read(&self, file_type: FileType) -> ShapefileResult<File> {
        Ok(File::open(self.path(file_type))?)
    }

    /// Deletes a member. Returns false if it did not exist.
    pub fn delete(&self, file_type: FileType) -> ShapefileResult<bool> {
        match fs::remove_file(self.path(file_type)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn acquire_read(&self, file_type: FileType) -> FileReadGuard {
        self.inner.locks[file_type.slot()].read_arc()
    }

    /// Blocks until no other guard is held on `file_type`.
    pub fn acquire_write(&self, file_type: FileType) -> FileWriteGuard {
        self.inner.locks[file_type.slot()].write_arc()
    }

    pub fn try_acquire_write(&self, file_type: FileType) -> Option<FileWriteGuard> {
        self.inner.locks[file_type.slot()].try_write_arc()
    }

    /// Creates a temp file next to the set that will later replace `file_type`.
    pub fn storage_file(&self, file_type: FileType) -> ShapefileResult<StorageFile> {
        let temp = tempfile::Builder::new()
            .prefix(&format!("{}.", self.inner.base_name))
            .suffix(&format!(".{}.tmp", file_type.extension()))
            .tempfile_in(&self.inner.dir)?;
        Ok(StorageFile { file_type, temp })
    }

    /// Atomically replaces the originals with the given storage files while
    /// holding the write lock of every affected type. Locks are taken in
    /// file-type order.
    pub fn replace_originals(&self, mut storage: Vec<StorageFile>) -> ShapefileResult<()> {
        storage.sort_by_key(|s| s.file_type);
        let _guards: Vec<FileWriteGuard> = storage
            .iter()
            .map(|s| self.acquire_write(s.file_type))
            .collect();
        self.persist_all(storage)
    }

    /// Same as [`replace_originals`](Self::replace_originals) for callers
    /// that already hold the relevant write guards.
    pub(crate) fn persist_all(&self, storage: Vec<StorageFile>) -> ShapefileResult<()> {
        for s in storage {
            let target = self.path(s.file_type);
            s.temp.as_file().sync_all()?;
            s.temp.persist(&target)?;
            log::debug!("Replaced {}", target.display());
        }
        Ok(())
    }
}

/// A temp file that becomes a member of the set once persisted. Dropping it
/// without persisting removes it.
pub struct StorageFile {
    file_type: FileType,
    temp: NamedTempFile,
}

impl StorageFile {
    pub fn file_type(&self) -> FileType {
        self.file_type
    }

    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    pub fn file(&self) -> &File {
        self.temp.as_file()
    }

    pub fn file_mut(&mut self) -> &mut File {
        self.temp.as_file_mut()
    }

    /// Opens an independent handle on the temp file.
    pub fn reopen(&self) -> ShapefileResult<File> {
        Ok(self.temp.reopen()?)
    }
}

impl fmt::Debug for StorageFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageFile")
            .field("file_type", &self.file_type)
            .field("path", &self.temp.path())
            .finish()
    }
}
