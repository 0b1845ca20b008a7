//! Directory entries that differ between two CephFS snapshots.
//!
//! `ceph_open_snapdiff` and friends only exist in newer libcephfs builds, so
//! all three are resolved at runtime. A [`SnapDiff`] is pull based: each
//! `next()` is one `ceph_readdir_snapdiff` call, and the native diff is closed
//! exactly once, by [`SnapDiff::close`] or on drop.

use crate::error::{BridgeError, Result};
use crate::mount::Mount;
use crate::symbols::{NativeLibrary, SymbolLookup, SymbolResolver};
use crate::sys;
use std::ffi::{CStr, CString};
use std::fmt;
use tracing::{debug, warn};

/// Which directory to compare and between which two snapshots
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapDiffConfig {
    /// Directory that holds the `.snap` directory, e.g. a subvolume root
    pub root_path: String,
    /// Directory below `root_path` to compare, `/` for the root itself
    pub rel_path: String,
    pub snap1: String,
    pub snap2: String,
}

impl SnapDiffConfig {
    pub fn new(root_path: impl Into<String>, snap1: impl Into<String>, snap2: impl Into<String>) -> Self {
        Self {
            root_path: root_path.into(),
            rel_path: "/".to_string(),
            snap1: snap1.into(),
            snap2: snap2.into(),
        }
    }

    pub fn with_rel_path(mut self, rel_path: impl Into<String>) -> Self {
        self.rel_path = rel_path.into();
        self
    }

    fn to_c_strings(&self) -> Result<[CString; 4]> {
        let field = |name: &str, value: &str| {
            if value.is_empty() {
                return Err(BridgeError::invalid_argument(format!("snapdiff {} is empty", name)));
            }
            CString::new(value)
                .map_err(|_| BridgeError::invalid_argument(format!("snapdiff {} contains a NUL byte", name)))
        };
        Ok([
            field("root_path", &self.root_path)?,
            field("rel_path", &self.rel_path)?,
            field("snap1", &self.snap1)?,
            field("snap2", &self.snap2)?,
        ])
    }
}

/// File type of a changed entry, from `d_type`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryType {
    Fifo,
    CharDevice,
    Directory,
    BlockDevice,
    Regular,
    Symlink,
    Socket,
    Unknown(u8),
}

impl EntryType {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            libc::DT_FIFO => EntryType::Fifo,
            libc::DT_CHR => EntryType::CharDevice,
            libc::DT_DIR => EntryType::Directory,
            libc::DT_BLK => EntryType::BlockDevice,
            libc::DT_REG => EntryType::Regular,
            libc::DT_LNK => EntryType::Symlink,
            libc::DT_SOCK => EntryType::Socket,
            other => EntryType::Unknown(other),
        }
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryType::Fifo => write!(f, "fifo"),
            EntryType::CharDevice => write!(f, "char"),
            EntryType::Directory => write!(f, "dir"),
            EntryType::BlockDevice => write!(f, "block"),
            EntryType::Regular => write!(f, "file"),
            EntryType::Symlink => write!(f, "symlink"),
            EntryType::Socket => write!(f, "socket"),
            EntryType::Unknown(raw) => write!(f, "unknown({})", raw),
        }
    }
}

/// An entry that was added, removed or modified between the two snapshots
///
/// `snap_id` tells which snapshot the entry was observed in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapDiffEntry {
    pub name: String,
    pub inode: u64,
    pub entry_type: EntryType,
    pub snap_id: u64,
}

/// An open snapshot diff over one directory
///
/// Yields changed entries in the order libcephfs reports them, skipping `.`
/// and `..`. A read error is yielded once and ends the iteration.
pub struct SnapDiff<'m> {
    mount: &'m Mount,
    rel_path: String,
    info: Box<sys::ceph_snapdiff_info>,
    readdir: sys::ceph_readdir_snapdiff_fn,
    close: sys::ceph_close_snapdiff_fn,
    exhausted: bool,
    closed: bool,
    delivered: u64,
}

impl<'m> SnapDiff<'m> {
    /// Open a diff through the process-wide resolver
    pub fn open(mount: &'m Mount, config: &SnapDiffConfig) -> Result<Self> {
        Self::open_with(SymbolResolver::<NativeLibrary>::global(), mount, config)
    }

    pub fn open_with<L: SymbolLookup>(
        resolver: &SymbolResolver<L>,
        mount: &'m Mount,
        config: &SnapDiffConfig,
    ) -> Result<Self> {
        let cmount = mount.validate_open()?;
        let [root_path, rel_path, snap1, snap2] = config.to_c_strings()?;

        let open = resolver.resolve(sys::CEPH_OPEN_SNAPDIFF)?;
        let readdir = resolver.resolve(sys::CEPH_READDIR_SNAPDIFF)?;
        let close = resolver.resolve(sys::CEPH_CLOSE_SNAPDIFF)?;

        let open: sys::ceph_open_snapdiff_fn = unsafe { std::mem::transmute(open.as_ptr()) };
        let readdir: sys::ceph_readdir_snapdiff_fn = unsafe { std::mem::transmute(readdir.as_ptr()) };
        let close: sys::ceph_close_snapdiff_fn = unsafe { std::mem::transmute(close.as_ptr()) };

        let mut info = Box::new(sys::ceph_snapdiff_info::empty());
        let ret = unsafe {
            open(
                cmount,
                root_path.as_ptr(),
                rel_path.as_ptr(),
                snap1.as_ptr(),
                snap2.as_ptr(),
                &mut *info,
            )
        };
        if ret != 0 {
            return Err(BridgeError::native_error(sys::CEPH_OPEN_SNAPDIFF, ret));
        }

        debug!(
            "Opened snapdiff on {} for {}{} between {} and {}",
            mount.name(),
            config.root_path,
            config.rel_path,
            config.snap1,
            config.snap2
        );

        Ok(Self {
            mount,
            rel_path: config.rel_path.clone(),
            info,
            readdir,
            close,
            exhausted: false,
            closed: false,
            delivered: 0,
        })
    }

    /// Entries yielded so far
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Close the native diff and report its status
    pub fn close(mut self) -> Result<()> {
        self.close_native()
    }

    fn close_native(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let ret = unsafe { (self.close)(&mut *self.info) };
        debug!(
            "Closed snapdiff on {} for {} after {} entries",
            self.mount.name(),
            self.rel_path,
            self.delivered
        );
        if ret != 0 {
            return Err(BridgeError::native_error(sys::CEPH_CLOSE_SNAPDIFF, ret));
        }
        Ok(())
    }

    fn read_entry(&mut self) -> Option<Result<SnapDiffEntry>> {
        // Every field of the entry is plain data, so all-zero is valid.
        let mut entry: sys::ceph_snapdiff_entry_t = unsafe { std::mem::zeroed() };
        let ret = unsafe { (self.readdir)(&mut *self.info, &mut entry) };

        if ret < 0 {
            self.exhausted = true;
            return Some(Err(BridgeError::native_error(sys::CEPH_READDIR_SNAPDIFF, ret)));
        }
        if ret == 0 {
            self.exhausted = true;
            return None;
        }

        let name = unsafe { CStr::from_ptr(entry.dir_entry.d_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();
        Some(Ok(SnapDiffEntry {
            name,
            inode: entry.dir_entry.d_ino as u64,
            entry_type: EntryType::from_raw(entry.dir_entry.d_type),
            snap_id: entry.snapid,
        }))
    }
}

impl Iterator for SnapDiff<'_> {
    type Item = Result<SnapDiffEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted || self.closed {
            return None;
        }
        loop {
            match self.read_entry()? {
                Ok(entry) if entry.name == "." || entry.name == ".." => continue,
                Ok(entry) => {
                    self.delivered += 1;
                    return Some(Ok(entry));
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

impl Drop for SnapDiff<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.close_native() {
            warn!("Failed to close snapdiff on {}: {}", self.mount.name(), e);
        }
    }
}

impl Mount {
    /// Compare a directory between two snapshots of this mount
    pub fn open_snap_diff(&self, config: &SnapDiffConfig) -> Result<SnapDiff<'_>> {
        SnapDiff::open(self, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockLibrary, MockMount, SnapDiffOpen};

    const SUBVOL: &str = "/volumes/_nogroup/SubVol1/";

    fn scripted() -> MockMount {
        MockMount::new()
            .with_snapshot("Snap1")
            .with_snapshot("Snap2")
            .with_entries([
                (".", 1099511627780, libc::DT_DIR, 2),
                ("..", 1099511627779, libc::DT_DIR, 2),
                ("file-0.txt", 1099511628290, libc::DT_REG, 3),
                ("data", 1099511628291, libc::DT_DIR, 3),
                ("file-1.txt", 1099511628292, libc::DT_REG, 2),
            ])
    }

    fn names(entries: &[SnapDiffEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.name.as_str()).collect()
    }

    #[test]
    fn test_entries_are_reported_without_dot_entries() {
        let resolver = SymbolResolver::new(MockLibrary::with_libcephfs());
        let mock = scripted();
        let mount = mock.mount();

        let mut diff =
            SnapDiff::open_with(&resolver, &mount, &SnapDiffConfig::new(SUBVOL, "Snap1", "Snap2")).unwrap();
        let entries: Vec<_> = diff.by_ref().collect::<Result<_>>().unwrap();

        assert_eq!(names(&entries), vec!["file-0.txt", "data", "file-1.txt"]);
        assert_eq!(
            entries[1],
            SnapDiffEntry {
                name: "data".to_string(),
                inode: 1099511628291,
                entry_type: EntryType::Directory,
                snap_id: 3,
            }
        );
        assert_eq!(entries[2].entry_type, EntryType::Regular);
        assert_eq!(diff.delivered(), 3);

        diff.close().unwrap();
        assert_eq!(mock.close_count(), 1);
        assert_eq!(mock.open_cursor_count(), 0);
        assert_eq!(
            mock.opens(),
            vec![SnapDiffOpen {
                root_path: SUBVOL.to_string(),
                rel_path: "/".to_string(),
                snap1: "Snap1".to_string(),
                snap2: "Snap2".to_string(),
            }]
        );
    }

    #[test]
    fn test_iteration_stops_at_end() {
        let resolver = SymbolResolver::new(MockLibrary::with_libcephfs());
        let mock = scripted();
        let mount = mock.mount();

        let mut diff = SnapDiff::open_with(
            &resolver,
            &mount,
            &SnapDiffConfig::new(SUBVOL, "Snap1", "Snap2").with_rel_path("/data"),
        )
        .unwrap();
        assert_eq!(diff.by_ref().count(), 3);
        let reads = mock.read_count();

        assert!(diff.next().is_none());
        assert_eq!(mock.read_count(), reads);
        assert_eq!(mock.opens()[0].rel_path, "/data");
    }

    #[test]
    fn test_drop_closes_once() {
        let resolver = SymbolResolver::new(MockLibrary::with_libcephfs());
        let mock = scripted();
        let mount = mock.mount();

        {
            let mut diff =
                SnapDiff::open_with(&resolver, &mount, &SnapDiffConfig::new(SUBVOL, "Snap1", "Snap2"))
                    .unwrap();
            assert!(diff.next().is_some());
            assert_eq!(mock.open_cursor_count(), 1);
        }

        assert_eq!(mock.close_count(), 1);
        assert_eq!(mock.open_cursor_count(), 0);
    }

    #[test]
    fn test_read_failure_is_yielded_once() {
        let resolver = SymbolResolver::new(MockLibrary::with_libcephfs());
        let mock = scripted().with_read_failure(3, -libc::EIO);
        let mount = mock.mount();

        let mut diff =
            SnapDiff::open_with(&resolver, &mount, &SnapDiffConfig::new(SUBVOL, "Snap1", "Snap2")).unwrap();

        assert_eq!(diff.next().unwrap().unwrap().name, "file-0.txt");
        let err = diff.next().unwrap().unwrap_err();
        assert_eq!(err.code(), Some(-libc::EIO));
        assert!(diff.next().is_none());

        drop(diff);
        assert_eq!(mock.close_count(), 1);
    }

    #[test]
    fn test_unknown_snapshot_is_native_error() {
        let resolver = SymbolResolver::new(MockLibrary::with_libcephfs());
        let mock = scripted();
        let mount = mock.mount();

        let err = SnapDiff::open_with(&resolver, &mount, &SnapDiffConfig::new(SUBVOL, "Snap1", "Snap9"))
            .err()
            .unwrap();
        assert!(matches!(err, BridgeError::NativeError { .. }));
        assert_eq!(err.code(), Some(-libc::ENOENT));
        // Nothing was opened, so nothing is closed.
        assert_eq!(mock.close_count(), 0);
    }

    #[test]
    fn test_open_failure_is_native_error() {
        let resolver = SymbolResolver::new(MockLibrary::with_libcephfs());
        let mock = scripted().with_open_failure(-libc::EOPNOTSUPP);
        let mount = mock.mount();

        let err = SnapDiff::open_with(&resolver, &mount, &SnapDiffConfig::new(SUBVOL, "Snap1", "Snap2"))
            .err()
            .unwrap();
        assert_eq!(err.code(), Some(-libc::EOPNOTSUPP));
        assert_eq!(mock.open_cursor_count(), 0);
    }

    #[test]
    fn test_close_failure_is_reported() {
        let resolver = SymbolResolver::new(MockLibrary::with_libcephfs());
        let mock = scripted().with_close_failure(-libc::EIO);
        let mount = mock.mount();

        let diff =
            SnapDiff::open_with(&resolver, &mount, &SnapDiffConfig::new(SUBVOL, "Snap1", "Snap2")).unwrap();
        let err = diff.close().unwrap_err();
        assert!(matches!(err, BridgeError::NativeError { .. }));
        assert_eq!(mock.close_count(), 1);
    }

    #[test]
    fn test_missing_entry_point_is_not_implemented() {
        let resolver = SymbolResolver::new(MockLibrary::with_libcephfs().without(sys::CEPH_READDIR_SNAPDIFF));
        let mock = scripted();
        let mount = mock.mount();

        let err = SnapDiff::open_with(&resolver, &mount, &SnapDiffConfig::new(SUBVOL, "Snap1", "Snap2"))
            .err()
            .unwrap();
        assert!(err.is_not_implemented());
        assert!(mock.opens().is_empty());

        // Cached: a second attempt does not look the symbol up again.
        assert!(SnapDiff::open_with(&resolver, &mount, &SnapDiffConfig::new(SUBVOL, "Snap1", "Snap2")).is_err());
        assert_eq!(resolver.library().lookup_count(sys::CEPH_READDIR_SNAPDIFF), 1);
    }

    #[test]
    fn test_invalid_config_is_rejected_before_native_calls() {
        let resolver = SymbolResolver::new(MockLibrary::with_libcephfs());
        let mock = scripted();
        let mount = mock.mount();

        for config in [
            SnapDiffConfig::new("", "Snap1", "Snap2"),
            SnapDiffConfig::new(SUBVOL, "", "Snap2"),
            SnapDiffConfig::new(SUBVOL, "Snap1", "Sn\0ap2"),
            SnapDiffConfig::new(SUBVOL, "Snap1", "Snap2").with_rel_path(""),
        ] {
            let err = SnapDiff::open_with(&resolver, &mount, &config).err().unwrap();
            assert!(matches!(err, BridgeError::InvalidArgument { .. }), "{:?}", config);
        }
        assert!(mock.opens().is_empty());
        assert_eq!(resolver.library().lookup_count(sys::CEPH_OPEN_SNAPDIFF), 0);
    }

    #[test]
    fn test_closed_mount_is_invalid_argument() {
        let resolver = SymbolResolver::new(MockLibrary::with_libcephfs());
        let mock = scripted();
        let mut mount = mock.mount();
        mount.detach();

        let err = SnapDiff::open_with(&resolver, &mount, &SnapDiffConfig::new(SUBVOL, "Snap1", "Snap2"))
            .err()
            .unwrap();
        assert!(matches!(err, BridgeError::InvalidArgument { .. }));
        assert!(mock.opens().is_empty());
    }

    #[test]
    fn test_entry_type_from_raw() {
        assert_eq!(EntryType::from_raw(libc::DT_LNK), EntryType::Symlink);
        assert_eq!(EntryType::from_raw(libc::DT_UNKNOWN), EntryType::Unknown(0));
        assert_eq!(EntryType::from_raw(200).to_string(), "unknown(200)");
    }
}
