//! Changed-extent enumeration between a snapshot and an image.
//!
//! librbd reports changed extents through a plain C function pointer plus a
//! `void *` of user data. The user data here is never a Rust pointer: it is a
//! [`Handle`] registered in a process-wide table, and [`diff_trampoline`] is the
//! only function address handed to the native side. Each invocation looks the
//! handle up, recovers the per-call state and runs the caller's closure.
//!
//! A diff runs through these phases:
//!
//! ```text
//! Configured -> Registered -> Running -> Completed
//!      |             |           |
//!      +-------------+-----------+-----> Failed
//! ```
//!
//! Validation failures leave `Configured` before anything is registered.
//! A missing entry point fails in `Registered`, also before a handle exists.
//! Once a handle exists it is removed on every exit path, including a panic
//! escaping the caller's closure.

use crate::error::{BridgeError, Result};
use crate::handles::{Handle, HandleTable};
use crate::image::Image;
use crate::symbols::{NativeLibrary, SymbolAddr, SymbolLookup, SymbolResolver};
use crate::sys;
use bitflags::bitflags;
use parking_lot::Mutex;
use std::any::Any;
use std::ffi::{c_int, c_void, CString};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, LazyLock, Weak};
use tracing::{debug, error, trace, warn};

bitflags! {
    /// Native `flags` word for `rbd_diff_iterate3`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DiffIterateFlags: u32 {
        const INCLUDE_PARENT = sys::RBD_DIFF_ITERATE_FLAG_INCLUDE_PARENT;
        const WHOLE_OBJECT = sys::RBD_DIFF_ITERATE_FLAG_WHOLE_OBJECT;
    }
}

/// Whether changes inherited from the parent image are reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IncludeParent {
    #[default]
    Disabled,
    Enabled,
}

/// Whether extents are widened to whole backing objects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WholeObject {
    #[default]
    Disabled,
    Enabled,
}

fn encode_flags(include_parent: IncludeParent, whole_object: WholeObject) -> DiffIterateFlags {
    let mut flags = DiffIterateFlags::empty();
    if include_parent == IncludeParent::Enabled {
        flags |= DiffIterateFlags::INCLUDE_PARENT;
    }
    if whole_object == WholeObject::Enabled {
        flags |= DiffIterateFlags::WHOLE_OBJECT;
    }
    flags
}

/// Existence indicator attached to a reported extent
///
/// librbd reports `0` for regions known to be zero and `1` for regions
/// holding data. Any other value is preserved as `Unknown` rather than
/// folded into one of the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtentExists {
    Zero,
    Data,
    Unknown(i32),
}

impl ExtentExists {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            0 => ExtentExists::Zero,
            1 => ExtentExists::Data,
            other => ExtentExists::Unknown(other),
        }
    }

    /// The value exactly as the native library reported it
    pub fn as_raw(self) -> i32 {
        match self {
            ExtentExists::Zero => 0,
            ExtentExists::Data => 1,
            ExtentExists::Unknown(raw) => raw,
        }
    }
}

impl fmt::Display for ExtentExists {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtentExists::Zero => write!(f, "zero"),
            ExtentExists::Data => write!(f, "data"),
            ExtentExists::Unknown(raw) => write!(f, "unknown({})", raw),
        }
    }
}

/// A changed byte range reported by a diff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub offset: u64,
    pub length: u64,
    pub exists: ExtentExists,
}

/// Opaque caller value handed back to the callback on every extent
pub type UserData = dyn Any + Send;

pub type DiffData = Option<Box<UserData>>;

/// Closure invoked once per extent. A nonzero return stops the diff.
pub type DiffIterateCallback = Box<dyn FnMut(Extent, Option<&mut UserData>) -> i32 + Send>;

/// Parameters for [`Image::diff_iterate_by_id`]
///
/// `callback`, `offset` and `length` must always be set; the rest are
/// optional. A `from_snap_id` of zero diffs against image creation.
#[derive(Default)]
pub struct DiffIterateByIdConfig {
    pub from_snap_id: u64,
    pub offset: u64,
    pub length: u64,
    pub include_parent: IncludeParent,
    pub whole_object: WholeObject,
    pub callback: Option<DiffIterateCallback>,
    pub data: DiffData,
}

impl DiffIterateByIdConfig {
    pub fn new(offset: u64, length: u64) -> Self {
        Self {
            offset,
            length,
            ..Default::default()
        }
    }

    pub fn with_from_snap_id(mut self, snap_id: u64) -> Self {
        self.from_snap_id = snap_id;
        self
    }

    pub fn with_include_parent(mut self, include_parent: IncludeParent) -> Self {
        self.include_parent = include_parent;
        self
    }

    pub fn with_whole_object(mut self, whole_object: WholeObject) -> Self {
        self.whole_object = whole_object;
        self
    }

    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: FnMut(Extent, Option<&mut UserData>) -> i32 + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
        self
    }

    pub fn with_data<D: Any + Send>(mut self, data: D) -> Self {
        self.data = Some(Box::new(data));
        self
    }

    pub fn flags(&self) -> DiffIterateFlags {
        encode_flags(self.include_parent, self.whole_object)
    }
}

impl fmt::Debug for DiffIterateByIdConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiffIterateByIdConfig")
            .field("from_snap_id", &self.from_snap_id)
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("include_parent", &self.include_parent)
            .field("whole_object", &self.whole_object)
            .field("callback", &self.callback.is_some())
            .field("data", &self.data.is_some())
            .finish()
    }
}

/// Parameters for [`Image::diff_iterate`], which names the base snapshot
///
/// Without `from_snapshot` the diff covers everything written since the
/// image was created.
#[derive(Default)]
pub struct DiffIterateConfig {
    pub from_snapshot: Option<String>,
    pub offset: u64,
    pub length: u64,
    pub include_parent: IncludeParent,
    pub whole_object: WholeObject,
    pub callback: Option<DiffIterateCallback>,
    pub data: DiffData,
}

impl DiffIterateConfig {
    pub fn new(offset: u64, length: u64) -> Self {
        Self {
            offset,
            length,
            ..Default::default()
        }
    }

    pub fn with_from_snapshot(mut self, name: impl Into<String>) -> Self {
        self.from_snapshot = Some(name.into());
        self
    }

    pub fn with_include_parent(mut self, include_parent: IncludeParent) -> Self {
        self.include_parent = include_parent;
        self
    }

    pub fn with_whole_object(mut self, whole_object: WholeObject) -> Self {
        self.whole_object = whole_object;
        self
    }

    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: FnMut(Extent, Option<&mut UserData>) -> i32 + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
        self
    }

    pub fn with_data<D: Any + Send>(mut self, data: D) -> Self {
        self.data = Some(Box::new(data));
        self
    }
}

impl fmt::Debug for DiffIterateConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiffIterateConfig")
            .field("from_snapshot", &self.from_snapshot)
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("include_parent", &self.include_parent)
            .field("whole_object", &self.whole_object)
            .field("callback", &self.callback.is_some())
            .field("data", &self.data.is_some())
            .finish()
    }
}

/// Why delivery stopped before the native routine finished
enum Stop {
    Aborted(i32),
    Panicked(Box<dyn Any + Send>),
}

impl Stop {
    fn code(&self) -> c_int {
        match self {
            Stop::Aborted(code) => *code,
            Stop::Panicked(_) => -libc::ECANCELED,
        }
    }
}

struct Delivery {
    callback: DiffIterateCallback,
    data: DiffData,
    next_offset: Option<u64>,
    delivered: u64,
    stop: Option<Stop>,
}

/// Per-call state reachable from the trampoline through a handle
pub(crate) struct DiffState {
    image: String,
    delivery: Mutex<Delivery>,
}

impl DiffState {
    fn new(image: &str, callback: DiffIterateCallback, data: DiffData) -> Self {
        Self {
            image: image.to_string(),
            delivery: Mutex::new(Delivery {
                callback,
                data,
                next_offset: None,
                delivered: 0,
                stop: None,
            }),
        }
    }

    /// Hand one extent to the caller's closure and return its verdict
    fn deliver(&self, extent: Extent) -> c_int {
        let mut delivery = self.delivery.lock();

        // librbd may keep calling after a positive return; stay stopped.
        if let Some(stop) = &delivery.stop {
            return stop.code();
        }

        if extent.length == 0 {
            trace!("Skipping empty extent at {} for {}", extent.offset, self.image);
            return 0;
        }

        if let Some(next) = delivery.next_offset {
            if extent.offset < next {
                warn!(
                    "Extent {}+{} for {} overlaps previous extent ending at {}",
                    extent.offset, extent.length, self.image, next
                );
            }
        }
        delivery.next_offset = Some(extent.offset.saturating_add(extent.length));

        trace!(
            "Delivering extent {}+{} ({}) for {}",
            extent.offset,
            extent.length,
            extent.exists,
            self.image
        );

        let Delivery { callback, data, .. } = &mut *delivery;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback(extent, data.as_deref_mut())));

        match outcome {
            Ok(0) => {
                delivery.delivered += 1;
                0
            }
            Ok(code) => {
                delivery.delivered += 1;
                delivery.stop = Some(Stop::Aborted(code));
                code
            }
            Err(payload) => {
                let stop = Stop::Panicked(payload);
                let code = stop.code();
                delivery.stop = Some(stop);
                code
            }
        }
    }

    fn finish(&self) -> (u64, Option<Stop>) {
        let mut delivery = self.delivery.lock();
        (delivery.delivered, delivery.stop.take())
    }
}

static DIFF_CALLBACKS: LazyLock<HandleTable<Weak<DiffState>>> = LazyLock::new(HandleTable::new);

/// Table the trampoline resolves handles against
#[cfg(test)]
pub(crate) fn diff_callbacks() -> &'static HandleTable<Weak<DiffState>> {
    &DIFF_CALLBACKS
}

/// Keeps a handle registered for exactly as long as it is alive
struct Registration {
    handle: Handle,
}

impl Registration {
    fn new(state: &Arc<DiffState>) -> Self {
        Self {
            handle: DIFF_CALLBACKS.add(Arc::downgrade(state)),
        }
    }

    /// The handle in the form librbd carries as callback user data
    fn user_data(&self) -> *mut c_void {
        self.handle.as_raw() as *mut c_void
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        DIFF_CALLBACKS.remove(self.handle);
    }
}

/// The one callback address given to librbd's diff routines
///
/// `arg` is a handle from [`DIFF_CALLBACKS`], never a pointer. An unknown
/// handle means the registration protocol is broken, and the process aborts
/// rather than guess.
pub extern "C" fn diff_trampoline(offset: u64, length: usize, exists: c_int, arg: *mut c_void) -> c_int {
    let handle = Handle::from_raw(arg as usize);
    let state = match DIFF_CALLBACKS.lookup(handle) {
        Ok(weak) => match weak.upgrade() {
            Some(state) => state,
            None => bridge_defect(handle, "per-call state was already released"),
        },
        Err(e) => bridge_defect(handle, &e.to_string()),
    };

    state.deliver(Extent {
        offset,
        length: length as u64,
        exists: ExtentExists::from_raw(exists),
    })
}

fn bridge_defect(handle: Handle, reason: &str) -> ! {
    error!("Diff callback invoked with unusable handle {}: {}", handle, reason);
    std::process::abort()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DiffPhase {
    Configured,
    Registered,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for DiffPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DiffPhase::Configured => "configured",
            DiffPhase::Registered => "registered",
            DiffPhase::Running => "running",
            DiffPhase::Completed => "completed",
            DiffPhase::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Drives a single diff through its phases for one image
struct DiffRun<'a> {
    image: &'a Image,
    routine: &'static str,
    phase: DiffPhase,
}

impl<'a> DiffRun<'a> {
    fn new(image: &'a Image, routine: &'static str) -> Self {
        Self {
            image,
            routine,
            phase: DiffPhase::Configured,
        }
    }

    fn advance(&mut self, next: DiffPhase) {
        debug!(
            "{} on image {}: {} -> {}",
            self.routine,
            self.image.name(),
            self.phase,
            next
        );
        self.phase = next;
    }

    fn fail(&mut self, err: BridgeError) -> BridgeError {
        self.advance(DiffPhase::Failed);
        err
    }
}

/// Runs diffs through an injectable symbol resolver
pub struct DiffIterator<'r, L> {
    resolver: &'r SymbolResolver<L>,
}

impl DiffIterator<'static, NativeLibrary> {
    /// Iterator backed by the process-wide resolver
    pub fn global() -> Self {
        Self {
            resolver: SymbolResolver::global(),
        }
    }
}

impl<'r, L: SymbolLookup> DiffIterator<'r, L> {
    pub fn new(resolver: &'r SymbolResolver<L>) -> Self {
        Self { resolver }
    }

    /// Report extents changed since snapshot `config.from_snap_id`
    ///
    /// Needs `rbd_diff_iterate3`; older librbd builds yield `NotImplemented`.
    /// Blocks until the native routine returns.
    pub fn execute(&self, image: &Image, config: DiffIterateByIdConfig) -> Result<()> {
        let flags = config.flags();
        let DiffIterateByIdConfig {
            from_snap_id,
            offset,
            length,
            callback,
            data,
            ..
        } = config;

        self.run(
            image,
            sys::RBD_DIFF_ITERATE3,
            offset,
            length,
            callback,
            data,
            || Ok(()),
            |addr, raw, user_data, ()| {
                let iterate: sys::rbd_diff_iterate3_fn = unsafe { std::mem::transmute(addr.as_ptr()) };
                let trampoline: sys::rbd_diff_cb_t = diff_trampoline;
                unsafe {
                    iterate(
                        raw,
                        from_snap_id,
                        offset,
                        length,
                        flags.bits(),
                        Some(trampoline),
                        user_data,
                    )
                }
            },
        )
    }

    /// Report extents changed since the snapshot named in `config`
    pub fn execute_by_name(&self, image: &Image, config: DiffIterateConfig) -> Result<()> {
        let DiffIterateConfig {
            from_snapshot,
            offset,
            length,
            include_parent,
            whole_object,
            callback,
            data,
        } = config;

        self.run(
            image,
            sys::RBD_DIFF_ITERATE2,
            offset,
            length,
            callback,
            data,
            || {
                from_snapshot
                    .map(CString::new)
                    .transpose()
                    .map_err(|_| BridgeError::invalid_argument("snapshot name contains a NUL byte"))
            },
            |addr, raw, user_data, from_snapshot: Option<CString>| {
                let iterate: sys::rbd_diff_iterate2_fn = unsafe { std::mem::transmute(addr.as_ptr()) };
                let trampoline: sys::rbd_diff_cb_t = diff_trampoline;
                let snap_name = from_snapshot
                    .as_ref()
                    .map_or(std::ptr::null(), |name| name.as_ptr());
                unsafe {
                    iterate(
                        raw,
                        snap_name,
                        offset,
                        length,
                        u8::from(include_parent == IncludeParent::Enabled),
                        u8::from(whole_object == WholeObject::Enabled),
                        Some(trampoline),
                        user_data,
                    )
                }
            },
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn run<P, V, F>(
        &self,
        image: &Image,
        routine: &'static str,
        offset: u64,
        length: u64,
        callback: Option<DiffIterateCallback>,
        data: DiffData,
        prepare: V,
        invoke: F,
    ) -> Result<()>
    where
        V: FnOnce() -> Result<P>,
        F: FnOnce(SymbolAddr, sys::rbd_image_t, *mut c_void, P) -> c_int,
    {
        let mut run = DiffRun::new(image, routine);

        let Some(callback) = callback else {
            return Err(run.fail(BridgeError::invalid_argument("diff callback is required")));
        };
        let raw = image.validate_open().map_err(|e| run.fail(e))?;
        if offset.checked_add(length).is_none() {
            return Err(run.fail(BridgeError::invalid_argument(format!(
                "range {}+{} overflows the 64-bit offset space",
                offset, length
            ))));
        }
        let prepared = prepare().map_err(|e| run.fail(e))?;

        run.advance(DiffPhase::Registered);
        let addr = self.resolver.resolve(routine).map_err(|e| run.fail(e))?;
        let state = Arc::new(DiffState::new(image.name(), callback, data));
        let registration = Registration::new(&state);

        run.advance(DiffPhase::Running);
        let ret = invoke(addr, raw, registration.user_data(), prepared);
        drop(registration);

        let (delivered, stop) = state.finish();
        let result = match stop {
            Some(Stop::Panicked(payload)) => {
                run.advance(DiffPhase::Failed);
                panic::resume_unwind(payload);
            }
            Some(Stop::Aborted(code)) => Err(BridgeError::aborted(code)),
            None if ret != 0 => Err(BridgeError::native_error(routine, ret)),
            None => Ok(()),
        };

        match &result {
            Ok(()) => run.advance(DiffPhase::Completed),
            Err(e) => {
                debug!("{} on image {} stopped: {}", routine, image.name(), e);
                run.advance(DiffPhase::Failed);
            }
        }
        debug!(
            "{} on image {} delivered {} extents",
            routine,
            image.name(),
            delivered
        );
        result
    }
}

impl Image {
    /// Report extents changed since snapshot id `config.from_snap_id`
    ///
    /// Resolves `rbd_diff_iterate3` from the already loaded librbd on first
    /// use. The callback runs synchronously on the thread librbd uses and may
    /// stop the diff early by returning nonzero, which surfaces as
    /// `BridgeError::Aborted`.
    pub fn diff_iterate_by_id(&self, config: DiffIterateByIdConfig) -> Result<()> {
        DiffIterator::global().execute(self, config)
    }

    /// Report extents changed since the named snapshot via `rbd_diff_iterate2`
    pub fn diff_iterate(&self, config: DiffIterateConfig) -> Result<()> {
        DiffIterator::global().execute_by_name(self, config)
    }
}
