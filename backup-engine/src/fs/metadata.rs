//! File metadata captured at backup time.
//!
//! [`FileMetaData`] is an immutable value: it is either read from a live
//! path or assembled through [`FileMetaDataBuilder`], which refuses to build
//! until every field is set. There is no way to change it afterwards.

use super::pathname;
use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::Path;

const S_ISUID: u32 = 0o4000;
const S_ISGID: u32 = 0o2000;
const S_ISVTX: u32 = 0o1000;

/// Type of a filesystem node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    Fifo,
    CharDevice,
    BlockDevice,
    Socket,
}

impl FileKind {
    fn mode_char(&self) -> char {
        match self {
            FileKind::Regular => '-',
            FileKind::Directory => 'd',
            FileKind::Symlink => 'l',
            FileKind::Fifo => 'p',
            FileKind::CharDevice => 'c',
            FileKind::BlockDevice => 'b',
            FileKind::Socket => 's',
        }
    }

    fn from_file_type(ft: fs::FileType) -> Self {
        if ft.is_symlink() {
            FileKind::Symlink
        } else if ft.is_dir() {
            FileKind::Directory
        } else if ft.is_fifo() {
            FileKind::Fifo
        } else if ft.is_char_device() {
            FileKind::CharDevice
        } else if ft.is_block_device() {
            FileKind::BlockDevice
        } else if ft.is_socket() {
            FileKind::Socket
        } else {
            FileKind::Regular
        }
    }
}

/// Complete metadata of one node, as stored in a manifest entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetaData {
    kind: FileKind,
    uid: u32,
    gid: u32,
    /// Only regular files have a size
    #[serde(default, skip_serializing_if = "Option::is_none")]
    size: Option<u64>,
    atime: i64,
    mtime: i64,
    ctime: i64,
    /// Permission and setuid/setgid/sticky bits (`0o7777`)
    mode: u32,
    /// In [`pathname`] form
    #[serde(default, skip_serializing_if = "Option::is_none")]
    symlink_target: Option<String>,
}

impl FileMetaData {
    /// Read metadata of `path` without following a final symlink.
    pub fn from_path(path: &Path) -> Result<Self> {
        let meta = fs::symlink_metadata(path)?;
        let kind = FileKind::from_file_type(meta.file_type());

        let symlink_target = if kind == FileKind::Symlink {
            Some(pathname::encode(fs::read_link(path)?.as_os_str()))
        } else {
            None
        };

        Ok(Self {
            kind,
            uid: meta.uid(),
            gid: meta.gid(),
            size: (kind == FileKind::Regular).then(|| meta.len()),
            atime: meta.atime(),
            mtime: meta.mtime(),
            ctime: meta.ctime(),
            mode: meta.mode() & 0o7777,
            symlink_target,
        })
    }

    pub fn builder() -> FileMetaDataBuilder {
        FileMetaDataBuilder::default()
    }

    pub fn kind(&self) -> FileKind {
        self.kind
    }

    pub fn is_regular(&self) -> bool {
        self.kind == FileKind::Regular
    }

    pub fn is_directory(&self) -> bool {
        self.kind == FileKind::Directory
    }

    pub fn is_symlink(&self) -> bool {
        self.kind == FileKind::Symlink
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn gid(&self) -> u32 {
        self.gid
    }

    pub fn size(&self) -> Option<u64> {
        self.size
    }

    pub fn atime(&self) -> i64 {
        self.atime
    }

    pub fn mtime(&self) -> i64 {
        self.mtime
    }

    pub fn ctime(&self) -> i64 {
        self.ctime
    }

    /// Permission bits only (`0o777`).
    pub fn permissions(&self) -> u32 {
        self.mode & 0o777
    }

    pub fn is_setuid(&self) -> bool {
        self.mode & S_ISUID != 0
    }

    pub fn is_setgid(&self) -> bool {
        self.mode & S_ISGID != 0
    }

    pub fn is_sticky(&self) -> bool {
        self.mode & S_ISVTX != 0
    }

    pub fn symlink_target(&self) -> Option<&str> {
        self.symlink_target.as_deref()
    }

    /// `ls -l` style mode string, e.g. `drwxr-xr-x` or `-rwsr-x--T`.
    pub fn mode_string(&self) -> String {
        let mut s = String::with_capacity(10);
        s.push(self.kind.mode_char());

        // Symlink permissions are meaningless on Linux.
        if self.is_symlink() {
            s.push_str("rwxr-xr-x");
            return s;
        }

        let triplets = [
            (0o400, 0o200, 0o100, self.is_setuid(), 's'),
            (0o040, 0o020, 0o010, self.is_setgid(), 's'),
            (0o004, 0o002, 0o001, self.is_sticky(), 't'),
        ];
        for (r, w, x, special, special_char) in triplets {
            s.push(if self.mode & r != 0 { 'r' } else { '-' });
            s.push(if self.mode & w != 0 { 'w' } else { '-' });
            s.push(match (self.mode & x != 0, special) {
                (true, true) => special_char,
                (false, true) => special_char.to_ascii_uppercase(),
                (true, false) => 'x',
                (false, false) => '-',
            });
        }
        s
    }

    /// Re-apply ownership (only when running as root), permissions and
    /// timestamps to `path`. Symlinks get ownership and times but no chmod.
    pub fn apply_to_path(&self, path: &Path) -> Result<()> {
        use nix::sys::stat::{lutimes, utimes};
        use nix::sys::time::{TimeVal, TimeValLike};
        use nix::unistd::{chown, geteuid, Gid, Uid};

        let atime = TimeVal::seconds(self.atime);
        let mtime = TimeVal::seconds(self.mtime);

        if self.is_symlink() {
            if geteuid().is_root() {
                std::os::unix::fs::lchown(path, Some(self.uid), Some(self.gid))?;
            }
            lutimes(path, &atime, &mtime).map_err(std::io::Error::from)?;
            return Ok(());
        }

        // chown clears setuid/setgid, so it has to come before chmod.
        if geteuid().is_root() {
            chown(
                path,
                Some(Uid::from_raw(self.uid)),
                Some(Gid::from_raw(self.gid)),
            )
            .map_err(std::io::Error::from)?;
        }
        fs::set_permissions(path, fs::Permissions::from_mode(self.mode))?;
        utimes(path, &atime, &mtime).map_err(std::io::Error::from)?;
        Ok(())
    }
}

impl fmt::Display for FileMetaData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {}",
            self.mode_string(),
            self.uid,
            self.gid,
            self.size.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string()),
            self.mtime
        )
    }
}

/// Assembles a [`FileMetaData`]; every field must be provided.
#[derive(Debug, Clone, Default)]
pub struct FileMetaDataBuilder {
    kind: Option<FileKind>,
    uid: Option<u32>,
    gid: Option<u32>,
    size: Option<Option<u64>>,
    atime: Option<i64>,
    mtime: Option<i64>,
    ctime: Option<i64>,
    permissions: Option<u32>,
    setuid: Option<bool>,
    setgid: Option<bool>,
    sticky: Option<bool>,
    symlink_target: Option<Option<String>>,
}

impl FileMetaDataBuilder {
    /// Start from an existing value, so only the differences need setting.
    pub fn from_metadata(other: &FileMetaData) -> Self {
        Self {
            kind: Some(other.kind),
            uid: Some(other.uid),
            gid: Some(other.gid),
            size: Some(other.size),
            atime: Some(other.atime),
            mtime: Some(other.mtime),
            ctime: Some(other.ctime),
            permissions: Some(other.permissions()),
            setuid: Some(other.is_setuid()),
            setgid: Some(other.is_setgid()),
            sticky: Some(other.is_sticky()),
            symlink_target: Some(other.symlink_target.clone()),
        }
    }

    pub fn kind(mut self, kind: FileKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn owner(mut self, uid: u32, gid: u32) -> Self {
        self.uid = Some(uid);
        self.gid = Some(gid);
        self
    }

    pub fn size(mut self, size: Option<u64>) -> Self {
        self.size = Some(size);
        self
    }

    pub fn times(mut self, atime: i64, mtime: i64, ctime: i64) -> Self {
        self.atime = Some(atime);
        self.mtime = Some(mtime);
        self.ctime = Some(ctime);
        self
    }

    pub fn permissions(mut self, permissions: u32) -> Self {
        self.permissions = Some(permissions);
        self
    }

    pub fn special_bits(mut self, setuid: bool, setgid: bool, sticky: bool) -> Self {
        self.setuid = Some(setuid);
        self.setgid = Some(setgid);
        self.sticky = Some(sticky);
        self
    }

    pub fn symlink_target(mut self, target: Option<String>) -> Self {
        self.symlink_target = Some(target);
        self
    }

    pub fn build(self) -> Result<FileMetaData> {
        fn required<T>(value: Option<T>, field: &str) -> Result<T> {
            value.ok_or_else(|| EngineError::Config(format!("file metadata is missing '{field}'")))
        }

        let kind = required(self.kind, "kind")?;
        let size = required(self.size, "size")?;
        let symlink_target = required(self.symlink_target, "symlink_target")?;
        let permissions = required(self.permissions, "permissions")?;

        if permissions & !0o777 != 0 {
            return Err(EngineError::Config(format!(
                "permissions out of range: {permissions:o}"
            )));
        }
        if size.is_some() != (kind == FileKind::Regular) {
            return Err(EngineError::Config(
                "size must be set for regular files and only for them".to_string(),
            ));
        }
        if symlink_target.is_some() != (kind == FileKind::Symlink) {
            return Err(EngineError::Config(
                "symlink target must be set for symlinks and only for them".to_string(),
            ));
        }

        let mut mode = permissions;
        if required(self.setuid, "setuid")? {
            mode |= S_ISUID;
        }
        if required(self.setgid, "setgid")? {
            mode |= S_ISGID;
        }
        if required(self.sticky, "sticky")? {
            mode |= S_ISVTX;
        }

        Ok(FileMetaData {
            kind,
            uid: required(self.uid, "uid")?,
            gid: required(self.gid, "gid")?,
            size,
            atime: required(self.atime, "atime")?,
            mtime: required(self.mtime, "mtime")?,
            ctime: required(self.ctime, "ctime")?,
            mode,
            symlink_target,
        })
    }
}
