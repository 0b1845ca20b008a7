use crate::error::{BridgeError, Result};
use crate::symbols::{NativeLibrary, SymbolLookup, SymbolResolver};
use crate::sys;
use std::ffi::c_void;
use std::ptr::NonNull;
use tracing::debug;

/// Borrowed view of an `rbd_image_t` opened by the administrative layer
///
/// The bridge never opens or closes images itself. Whoever opened the image
/// keeps ownership of the native handle and calls [`Image::detach`] before
/// closing it, after which every operation here fails with
/// `InvalidArgument`.
#[derive(Debug)]
pub struct Image {
    name: String,
    raw: Option<NonNull<c_void>>,
}

// librbd image handles may be used from any thread.
unsafe impl Send for Image {}

impl Image {
    /// Wrap an open native image handle
    ///
    /// # Safety
    ///
    /// `raw` must be a valid `rbd_image_t` (or a pointer understood by the
    /// entry points the resolver hands out) and must stay valid until
    /// [`Image::detach`] is called or the `Image` is dropped.
    pub unsafe fn from_raw(name: impl Into<String>, raw: sys::rbd_image_t) -> Result<Self> {
        let name = name.into();
        let raw = NonNull::new(raw)
            .ok_or_else(|| BridgeError::invalid_argument(format!("image '{}' handle is null", name)))?;
        Ok(Self {
            name,
            raw: Some(raw),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_open(&self) -> bool {
        self.raw.is_some()
    }

    /// Release the native handle back to its owner and mark the image closed
    pub fn detach(&mut self) -> Option<sys::rbd_image_t> {
        let raw = self.raw.take().map(NonNull::as_ptr);
        if raw.is_some() {
            debug!("Detached image {}", self.name);
        }
        raw
    }

    /// The native handle, or `InvalidArgument` if the image is closed
    pub(crate) fn validate_open(&self) -> Result<sys::rbd_image_t> {
        self.raw
            .map(NonNull::as_ptr)
            .ok_or_else(|| BridgeError::invalid_argument(format!("image '{}' is not open", self.name)))
    }

    /// Make `snap_id` the image's read context
    ///
    /// Works for snapshots in any namespace (user, trash, group), which the
    /// name-based `rbd_snap_set` cannot address.
    pub fn set_snapshot_by_id(&self, snap_id: u64) -> Result<()> {
        self.set_snapshot_by_id_with(SymbolResolver::<NativeLibrary>::global(), snap_id)
    }

    /// Same as [`Image::set_snapshot_by_id`] with an explicit resolver
    pub fn set_snapshot_by_id_with<L: SymbolLookup>(
        &self,
        resolver: &SymbolResolver<L>,
        snap_id: u64,
    ) -> Result<()> {
        let image = self.validate_open()?;
        let addr = resolver.resolve(sys::RBD_SNAP_SET_BY_ID)?;

        debug!("Setting image {} to snapshot id {}", self.name, snap_id);
        let set_by_id: sys::rbd_snap_set_by_id_fn = unsafe { std::mem::transmute(addr.as_ptr()) };
        let ret = unsafe { set_by_id(image, snap_id) };

        if ret != 0 {
            return Err(BridgeError::native_error(sys::RBD_SNAP_SET_BY_ID, ret));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockImage, MockLibrary};

    #[test]
    fn test_null_handle_rejected() {
        let err = unsafe { Image::from_raw("img", std::ptr::null_mut()) }.unwrap_err();
        assert!(matches!(err, BridgeError::InvalidArgument { .. }));
    }

    #[test]
    fn test_detach_closes_image() {
        let mock = MockImage::new();
        let mut image = mock.image("img");
        assert!(image.is_open());
        assert_eq!(image.name(), "img");

        assert!(image.detach().is_some());
        assert!(!image.is_open());
        assert!(image.detach().is_none());
        assert!(matches!(
            image.validate_open(),
            Err(BridgeError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_set_snapshot_by_id() {
        let resolver = SymbolResolver::new(MockLibrary::with_librbd());
        let mock = MockImage::new()
            .with_snapshot(4, "snap-a")
            .with_snapshot(9, "snap-b");
        let image = mock.image("img");

        image.set_snapshot_by_id_with(&resolver, 9).unwrap();
        assert_eq!(mock.current_snap_id(), Some(9));

        let err = image.set_snapshot_by_id_with(&resolver, 0).unwrap_err();
        assert_eq!(err.code(), Some(-libc::ENOENT));
        assert_eq!(mock.current_snap_id(), Some(9));
    }

    #[test]
    fn test_set_snapshot_by_id_not_implemented() {
        let resolver = SymbolResolver::new(MockLibrary::with_librbd().without(sys::RBD_SNAP_SET_BY_ID));
        let mock = MockImage::new().with_snapshot(4, "snap-a");
        let image = mock.image("img");

        let err = image.set_snapshot_by_id_with(&resolver, 4).unwrap_err();
        assert!(err.is_not_implemented());
        assert_eq!(mock.current_snap_id(), None);
    }

    #[test]
    fn test_set_snapshot_on_closed_image() {
        let resolver = SymbolResolver::new(MockLibrary::with_librbd());
        let mock = MockImage::new().with_snapshot(4, "snap-a");
        let mut image = mock.image("img");
        image.detach();

        let err = image.set_snapshot_by_id_with(&resolver, 4).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidArgument { .. }));
        assert_eq!(resolver.library().lookup_count(sys::RBD_SNAP_SET_BY_ID), 0);
    }
}
