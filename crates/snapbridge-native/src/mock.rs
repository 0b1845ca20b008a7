use crate::image::Image;
use crate::mount::Mount;
use crate::symbols::{SymbolAddr, SymbolLookup};
use crate::sys;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::{c_char, c_int, c_void, CStr};
use std::time::Duration;
use tracing::debug;

/// In-memory stand-in for librbd's symbol table
///
/// Hands out addresses of the `extern "C"` routines in this module and
/// counts how many times each name was looked up, so tests can assert that
/// the resolver only asked once.
pub struct MockLibrary {
    symbols: HashMap<String, SymbolAddr>,
    lookups: Mutex<HashMap<String, usize>>,
    delay: Option<Duration>,
}

impl MockLibrary {
    /// A library that exports nothing
    pub fn new() -> Self {
        Self {
            symbols: HashMap::new(),
            lookups: Mutex::new(HashMap::new()),
            delay: None,
        }
    }

    /// A library exporting every entry point the bridge knows about
    pub fn with_librbd() -> Self {
        let iterate3: sys::rbd_diff_iterate3_fn = mock_diff_iterate3;
        let iterate2: sys::rbd_diff_iterate2_fn = mock_diff_iterate2;
        let set_by_id: sys::rbd_snap_set_by_id_fn = mock_snap_set_by_id;

        Self::new()
            .with_symbol(sys::RBD_DIFF_ITERATE3, iterate3 as *mut c_void)
            .with_symbol(sys::RBD_DIFF_ITERATE2, iterate2 as *mut c_void)
            .with_symbol(sys::RBD_SNAP_SET_BY_ID, set_by_id as *mut c_void)
    }

    /// A library exporting the libcephfs snapshot diff entry points
    pub fn with_libcephfs() -> Self {
        let open: sys::ceph_open_snapdiff_fn = mock_open_snapdiff;
        let readdir: sys::ceph_readdir_snapdiff_fn = mock_readdir_snapdiff;
        let close: sys::ceph_close_snapdiff_fn = mock_close_snapdiff;

        Self::new()
            .with_symbol(sys::CEPH_OPEN_SNAPDIFF, open as *mut c_void)
            .with_symbol(sys::CEPH_READDIR_SNAPDIFF, readdir as *mut c_void)
            .with_symbol(sys::CEPH_CLOSE_SNAPDIFF, close as *mut c_void)
    }

    /// Export `name` at `addr`. Null addresses are ignored.
    pub fn with_symbol(mut self, name: &str, addr: *mut c_void) -> Self {
        if let Some(addr) = SymbolAddr::new(addr) {
            self.symbols.insert(name.to_string(), addr);
        }
        self
    }

    /// Stop exporting `name`, simulating an older library build
    pub fn without(mut self, name: &str) -> Self {
        self.symbols.remove(name);
        self
    }

    /// Sleep inside every lookup to widen race windows in tests
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of lookups performed for `name`
    pub fn lookup_count(&self, name: &str) -> usize {
        self.lookups.lock().get(name).copied().unwrap_or(0)
    }
}

impl Default for MockLibrary {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolLookup for MockLibrary {
    fn lookup(&self, name: &str) -> Result<SymbolAddr, String> {
        *self.lookups.lock().entry(name.to_string()).or_insert(0) += 1;
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        self.symbols
            .get(name)
            .copied()
            .ok_or_else(|| format!("undefined symbol: {}", name))
    }
}

/// One call into a mock diff routine, as seen by the native side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffCall {
    pub routine: &'static str,
    pub from_snap_id: Option<u64>,
    pub from_snapshot: Option<String>,
    pub offset: u64,
    pub length: u64,
    pub flags: u32,
    pub had_callback: bool,
    pub user_data: usize,
    /// Extents handed to the callback before the routine returned
    pub delivered: usize,
}

#[derive(Default)]
struct MockImageState {
    calls: Vec<DiffCall>,
    current_snap: Option<u64>,
}

/// Scripted image that the mock routines read through the image pointer
///
/// The `Image` returned by [`MockImage::image`] points at this value, so the
/// mock must stay in place (not be moved or dropped) while that `Image` is
/// in use.
pub struct MockImage {
    extents: Vec<(u64, u64, i32)>,
    failure: Option<i32>,
    snapshots: Vec<(u64, String)>,
    foreign_thread: bool,
    state: Mutex<MockImageState>,
}

impl MockImage {
    pub fn new() -> Self {
        Self {
            extents: Vec::new(),
            failure: None,
            snapshots: Vec::new(),
            foreign_thread: false,
            state: Mutex::new(MockImageState::default()),
        }
    }

    /// Extents reported by the diff routines as `(offset, length, exists)`
    pub fn with_extents(mut self, extents: impl IntoIterator<Item = (u64, u64, i32)>) -> Self {
        self.extents = extents.into_iter().collect();
        self
    }

    /// Make every diff routine fail with `code` before reporting anything
    pub fn with_failure(mut self, code: i32) -> Self {
        self.failure = Some(code);
        self
    }

    pub fn with_snapshot(mut self, id: u64, name: impl Into<String>) -> Self {
        self.snapshots.push((id, name.into()));
        self
    }

    /// Deliver extents from a thread owned by the "native" side
    pub fn on_foreign_thread(mut self) -> Self {
        self.foreign_thread = true;
        self
    }

    /// An open `Image` whose native handle is this mock
    pub fn image(&self, name: &str) -> Image {
        let raw = self as *const MockImage as sys::rbd_image_t;
        // The pointer comes from a reference, so it is never null.
        match unsafe { Image::from_raw(name, raw) } {
            Ok(image) => image,
            Err(e) => unreachable!("mock image pointer rejected: {}", e),
        }
    }

    pub fn diff_calls(&self) -> Vec<DiffCall> {
        self.state.lock().calls.clone()
    }

    pub fn diff_call_count(&self) -> usize {
        self.state.lock().calls.len()
    }

    pub fn current_snap_id(&self) -> Option<u64> {
        self.state.lock().current_snap
    }

    fn has_snap_id(&self, id: u64) -> bool {
        self.snapshots.iter().any(|(snap_id, _)| *snap_id == id)
    }

    fn has_snap_name(&self, name: &str) -> bool {
        self.snapshots.iter().any(|(_, snap_name)| snap_name == name)
    }

    /// Extents overlapping `[offset, offset + length)`, clipped to the range
    fn extents_in(&self, offset: u64, length: u64) -> Vec<(u64, u64, i32)> {
        let end = offset.saturating_add(length);
        self.extents
            .iter()
            .filter_map(|&(ofs, len, exists)| {
                let start = ofs.max(offset);
                let stop = ofs.saturating_add(len).min(end);
                let empty_overlap = start > stop || (len > 0 && start == stop);
                (!empty_overlap).then_some((start, stop - start, exists))
            })
            .collect()
    }

    fn run_diff(&self, mut call: DiffCall, cb: Option<sys::rbd_diff_cb_t>, arg: *mut c_void) -> c_int {
        debug!("Mock: {} called for range {}+{}", call.routine, call.offset, call.length);

        let ret = if let Some(code) = self.failure {
            code
        } else if let Some(cb) = cb {
            let extents = self.extents_in(call.offset, call.length);
            let arg = arg as usize;
            let (ret, delivered) = if self.foreign_thread {
                std::thread::scope(|s| {
                    s.spawn(|| deliver(&extents, cb, arg))
                        .join()
                        .unwrap_or((-libc::EIO, 0))
                })
            } else {
                deliver(&extents, cb, arg)
            };
            call.delivered = delivered;
            ret
        } else {
            -libc::EINVAL
        };

        self.state.lock().calls.push(call);
        ret
    }
}

impl Default for MockImage {
    fn default() -> Self {
        Self::new()
    }
}

/// Feed extents to `cb` and stop on a negative return, like librbd does
fn deliver(extents: &[(u64, u64, i32)], cb: sys::rbd_diff_cb_t, arg: usize) -> (c_int, usize) {
    let mut delivered = 0;
    for &(offset, length, exists) in extents {
        let r = unsafe { cb(offset, length as usize, exists, arg as *mut c_void) };
        delivered += 1;
        if r < 0 {
            return (r, delivered);
        }
    }
    (0, delivered)
}

unsafe extern "C" fn mock_diff_iterate3(
    image: sys::rbd_image_t,
    from_snap_id: u64,
    ofs: u64,
    len: u64,
    flags: u32,
    cb: Option<sys::rbd_diff_cb_t>,
    arg: *mut c_void,
) -> c_int {
    let mock = &*(image as *const MockImage);
    if from_snap_id != 0 && !mock.has_snap_id(from_snap_id) {
        return -libc::ENOENT;
    }
    let call = DiffCall {
        routine: sys::RBD_DIFF_ITERATE3,
        from_snap_id: Some(from_snap_id),
        from_snapshot: None,
        offset: ofs,
        length: len,
        flags,
        had_callback: cb.is_some(),
        user_data: arg as usize,
        delivered: 0,
    };
    mock.run_diff(call, cb, arg)
}

#[allow(clippy::too_many_arguments)]
unsafe extern "C" fn mock_diff_iterate2(
    image: sys::rbd_image_t,
    fromsnapname: *const c_char,
    ofs: u64,
    len: u64,
    include_parent: u8,
    whole_object: u8,
    cb: Option<sys::rbd_diff_cb_t>,
    arg: *mut c_void,
) -> c_int {
    let mock = &*(image as *const MockImage);
    let from_snapshot = if fromsnapname.is_null() {
        None
    } else {
        Some(CStr::from_ptr(fromsnapname).to_string_lossy().into_owned())
    };
    if let Some(ref name) = from_snapshot {
        if !mock.has_snap_name(name) {
            return -libc::ENOENT;
        }
    }

    let mut flags = 0;
    if include_parent != 0 {
        flags |= sys::RBD_DIFF_ITERATE_FLAG_INCLUDE_PARENT;
    }
    if whole_object != 0 {
        flags |= sys::RBD_DIFF_ITERATE_FLAG_WHOLE_OBJECT;
    }

    let call = DiffCall {
        routine: sys::RBD_DIFF_ITERATE2,
        from_snap_id: None,
        from_snapshot,
        offset: ofs,
        length: len,
        flags,
        had_callback: cb.is_some(),
        user_data: arg as usize,
        delivered: 0,
    };
    mock.run_diff(call, cb, arg)
}

unsafe extern "C" fn mock_snap_set_by_id(image: sys::rbd_image_t, snap_id: u64) -> c_int {
    let mock = &*(image as *const MockImage);
    if !mock.has_snap_id(snap_id) {
        return -libc::ENOENT;
    }
    mock.state.lock().current_snap = Some(snap_id);
    0
}

/// Arguments of one `ceph_open_snapdiff` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapDiffOpen {
    pub root_path: String,
    pub rel_path: String,
    pub snap1: String,
    pub snap2: String,
}

#[derive(Default)]
struct MockMountState {
    opens: Vec<SnapDiffOpen>,
    reads: usize,
    closes: usize,
    open_cursors: usize,
}

/// Read position of one open mock snapshot diff
struct MockCursor {
    next: usize,
}

/// Scripted CephFS mount read by the mock snapshot diff routines
///
/// Like [`MockImage`], the `Mount` from [`MockMount::mount`] points at this
/// value, so it must outlive that `Mount`.
pub struct MockMount {
    snapshots: Vec<String>,
    entries: Vec<(String, u64, u8, u64)>,
    open_failure: Option<i32>,
    read_failure: Option<(usize, i32)>,
    close_failure: Option<i32>,
    state: Mutex<MockMountState>,
}

impl MockMount {
    pub fn new() -> Self {
        Self {
            snapshots: Vec::new(),
            entries: Vec::new(),
            open_failure: None,
            read_failure: None,
            close_failure: None,
            state: Mutex::new(MockMountState::default()),
        }
    }

    pub fn with_snapshot(mut self, name: impl Into<String>) -> Self {
        self.snapshots.push(name.into());
        self
    }

    /// Entries returned by readdir as `(name, inode, d_type, snap_id)`
    pub fn with_entries<'a>(mut self, entries: impl IntoIterator<Item = (&'a str, u64, u8, u64)>) -> Self {
        self.entries = entries
            .into_iter()
            .map(|(name, ino, dtype, snap)| (name.to_string(), ino, dtype, snap))
            .collect();
        self
    }

    pub fn with_open_failure(mut self, code: i32) -> Self {
        self.open_failure = Some(code);
        self
    }

    /// Fail the readdir that would return entry `index`
    pub fn with_read_failure(mut self, index: usize, code: i32) -> Self {
        self.read_failure = Some((index, code));
        self
    }

    pub fn with_close_failure(mut self, code: i32) -> Self {
        self.close_failure = Some(code);
        self
    }

    /// An open `Mount` whose native handle is this mock
    pub fn mount(&self) -> Mount {
        let raw = self as *const MockMount as *mut c_void;
        match unsafe { Mount::from_raw("cephfs", raw) } {
            Ok(mount) => mount,
            Err(e) => unreachable!("mock mount pointer rejected: {}", e),
        }
    }

    pub fn opens(&self) -> Vec<SnapDiffOpen> {
        self.state.lock().opens.clone()
    }

    /// Number of readdir calls, including the one that reports the end
    pub fn read_count(&self) -> usize {
        self.state.lock().reads
    }

    pub fn close_count(&self) -> usize {
        self.state.lock().closes
    }

    /// Diffs opened and not yet closed
    pub fn open_cursor_count(&self) -> usize {
        self.state.lock().open_cursors
    }
}

impl Default for MockMount {
    fn default() -> Self {
        Self::new()
    }
}

unsafe fn c_string(ptr: *const c_char) -> String {
    if ptr.is_null() {
        String::new()
    } else {
        CStr::from_ptr(ptr).to_string_lossy().into_owned()
    }
}

unsafe extern "C" fn mock_open_snapdiff(
    cmount: *mut c_void,
    root_path: *const c_char,
    rel_path: *const c_char,
    snap1: *const c_char,
    snap2: *const c_char,
    out: *mut sys::ceph_snapdiff_info,
) -> c_int {
    let mock = &*(cmount as *const MockMount);
    let open = SnapDiffOpen {
        root_path: c_string(root_path),
        rel_path: c_string(rel_path),
        snap1: c_string(snap1),
        snap2: c_string(snap2),
    };
    debug!("mock ceph_open_snapdiff {:?}", open);

    let known = |name: &str| mock.snapshots.iter().any(|s| s == name);
    let missing = !known(&open.snap1) || !known(&open.snap2);
    mock.state.lock().opens.push(open);

    if let Some(code) = mock.open_failure {
        return code;
    }
    if missing {
        return -libc::ENOENT;
    }

    let cursor = Box::new(MockCursor { next: 0 });
    *out = sys::ceph_snapdiff_info {
        cmount,
        dir1: Box::into_raw(cursor) as *mut c_void,
        dir_aux: cmount,
    };
    mock.state.lock().open_cursors += 1;
    0
}

unsafe extern "C" fn mock_readdir_snapdiff(
    snapdiff: *mut sys::ceph_snapdiff_info,
    out: *mut sys::ceph_snapdiff_entry_t,
) -> c_int {
    let info = &*snapdiff;
    if info.dir1.is_null() {
        return -libc::EBADF;
    }
    let mock = &*(info.cmount as *const MockMount);
    let cursor = &mut *(info.dir1 as *mut MockCursor);
    mock.state.lock().reads += 1;

    if let Some((index, code)) = mock.read_failure {
        if cursor.next == index {
            return code;
        }
    }
    let Some((name, ino, dtype, snap)) = mock.entries.get(cursor.next) else {
        return 0;
    };
    cursor.next += 1;

    let entry = &mut *out;
    entry.dir_entry.d_ino = *ino as _;
    entry.dir_entry.d_type = *dtype;
    let capacity = entry.dir_entry.d_name.len() - 1;
    entry.dir_entry.d_name.fill(0);
    for (dst, src) in entry.dir_entry.d_name.iter_mut().zip(name.bytes().take(capacity)) {
        *dst = src as c_char;
    }
    entry.snapid = *snap;
    1
}

unsafe extern "C" fn mock_close_snapdiff(snapdiff: *mut sys::ceph_snapdiff_info) -> c_int {
    let info = &mut *snapdiff;
    if info.dir1.is_null() {
        return -libc::EBADF;
    }
    let mock = &*(info.cmount as *const MockMount);
    drop(Box::from_raw(info.dir1 as *mut MockCursor));
    info.dir1 = std::ptr::null_mut();
    info.dir_aux = std::ptr::null_mut();

    let mut state = mock.state.lock();
    state.closes += 1;
    state.open_cursors -= 1;
    mock.close_failure.unwrap_or(0)
}
