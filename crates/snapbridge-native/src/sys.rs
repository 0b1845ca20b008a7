//! Raw librbd and libcephfs signatures used by the bridge.
//!
//! Nothing here is linked at build time. Every entry point is looked up by
//! name through [`SymbolResolver`](crate::SymbolResolver) and cast to one of
//! the function pointer types below, so the crate loads against librbd
//! builds that predate a given API.

#![allow(non_camel_case_types)]

use std::ffi::{c_char, c_int, c_void};

/// `rbd_image_t`
pub type rbd_image_t = *mut c_void;

/// `int (*cb)(uint64_t ofs, size_t len, int exists, void *arg)`
pub type rbd_diff_cb_t = unsafe extern "C" fn(u64, usize, c_int, *mut c_void) -> c_int;

/// ```c
/// int rbd_diff_iterate3(rbd_image_t image, uint64_t from_snap_id,
///                       uint64_t ofs, uint64_t len, uint32_t flags,
///                       int (*cb)(uint64_t, size_t, int, void *), void *arg);
/// ```
pub type rbd_diff_iterate3_fn = unsafe extern "C" fn(
    image: rbd_image_t,
    from_snap_id: u64,
    ofs: u64,
    len: u64,
    flags: u32,
    cb: Option<rbd_diff_cb_t>,
    arg: *mut c_void,
) -> c_int;

/// ```c
/// int rbd_diff_iterate2(rbd_image_t image, const char *fromsnapname,
///                       uint64_t ofs, uint64_t len,
///                       uint8_t include_parent, uint8_t whole_object,
///                       int (*cb)(uint64_t, size_t, int, void *), void *arg);
/// ```
pub type rbd_diff_iterate2_fn = unsafe extern "C" fn(
    image: rbd_image_t,
    fromsnapname: *const c_char,
    ofs: u64,
    len: u64,
    include_parent: u8,
    whole_object: u8,
    cb: Option<rbd_diff_cb_t>,
    arg: *mut c_void,
) -> c_int;

/// `int rbd_snap_set_by_id(rbd_image_t image, uint64_t snap_id);`
pub type rbd_snap_set_by_id_fn = unsafe extern "C" fn(image: rbd_image_t, snap_id: u64) -> c_int;

pub const RBD_DIFF_ITERATE3: &str = "rbd_diff_iterate3";
pub const RBD_DIFF_ITERATE2: &str = "rbd_diff_iterate2";
pub const RBD_SNAP_SET_BY_ID: &str = "rbd_snap_set_by_id";

/// `struct ceph_snapdiff_info`, filled in by `ceph_open_snapdiff`
#[repr(C)]
#[derive(Debug)]
pub struct ceph_snapdiff_info {
    pub cmount: *mut c_void,
    pub dir1: *mut c_void,
    pub dir_aux: *mut c_void,
}

impl ceph_snapdiff_info {
    pub fn empty() -> Self {
        Self {
            cmount: std::ptr::null_mut(),
            dir1: std::ptr::null_mut(),
            dir_aux: std::ptr::null_mut(),
        }
    }
}

/// `struct ceph_snapdiff_entry_t`
#[repr(C)]
pub struct ceph_snapdiff_entry_t {
    pub dir_entry: libc::dirent,
    pub snapid: u64,
}

/// ```c
/// int ceph_open_snapdiff(struct ceph_mount_info *cmount, const char *root_path,
///                        const char *rel_path, const char *snap1,
///                        const char *snap2, struct ceph_snapdiff_info *out);
/// ```
pub type ceph_open_snapdiff_fn = unsafe extern "C" fn(
    cmount: *mut c_void,
    root_path: *const c_char,
    rel_path: *const c_char,
    snap1: *const c_char,
    snap2: *const c_char,
    out: *mut ceph_snapdiff_info,
) -> c_int;

/// `int ceph_readdir_snapdiff(struct ceph_snapdiff_info *snapdiff, struct ceph_snapdiff_entry_t *out);`
///
/// Returns 1 when `out` holds an entry, 0 at the end, negative errno on failure.
pub type ceph_readdir_snapdiff_fn =
    unsafe extern "C" fn(snapdiff: *mut ceph_snapdiff_info, out: *mut ceph_snapdiff_entry_t) -> c_int;

/// `int ceph_close_snapdiff(struct ceph_snapdiff_info *snapdiff);`
pub type ceph_close_snapdiff_fn = unsafe extern "C" fn(snapdiff: *mut ceph_snapdiff_info) -> c_int;

pub const CEPH_OPEN_SNAPDIFF: &str = "ceph_open_snapdiff";
pub const CEPH_READDIR_SNAPDIFF: &str = "ceph_readdir_snapdiff";
pub const CEPH_CLOSE_SNAPDIFF: &str = "ceph_close_snapdiff";

/// Optional entry points the bridge knows how to use
pub const KNOWN_SYMBOLS: &[&str] = &[
    RBD_DIFF_ITERATE3,
    RBD_DIFF_ITERATE2,
    RBD_SNAP_SET_BY_ID,
    CEPH_OPEN_SNAPDIFF,
    CEPH_READDIR_SNAPDIFF,
    CEPH_CLOSE_SNAPDIFF,
];

/// `RBD_DIFF_ITERATE_FLAG_INCLUDE_PARENT`
pub const RBD_DIFF_ITERATE_FLAG_INCLUDE_PARENT: u32 = 1 << 0;
/// `RBD_DIFF_ITERATE_FLAG_WHOLE_OBJECT`
pub const RBD_DIFF_ITERATE_FLAG_WHOLE_OBJECT: u32 = 1 << 1;
