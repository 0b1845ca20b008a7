use crate::error::{BridgeError, Result};
use std::ffi::c_void;
use std::ptr::NonNull;
use tracing::debug;

/// Borrowed view of a `struct ceph_mount_info *` mounted by the caller
///
/// Ownership rules match [`Image`](crate::Image): the bridge never mounts or
/// unmounts, and [`Mount::detach`] marks the handle closed.
#[derive(Debug)]
pub struct Mount {
    name: String,
    raw: Option<NonNull<c_void>>,
}

// libcephfs mount handles may be used from any thread.
unsafe impl Send for Mount {}

impl Mount {
    /// Wrap a mounted native handle
    ///
    /// # Safety
    ///
    /// `raw` must be a mounted `ceph_mount_info` (or a pointer understood by
    /// the entry points the resolver hands out) and must stay valid until
    /// [`Mount::detach`] is called or the `Mount` is dropped.
    pub unsafe fn from_raw(name: impl Into<String>, raw: *mut c_void) -> Result<Self> {
        let name = name.into();
        let raw = NonNull::new(raw)
            .ok_or_else(|| BridgeError::invalid_argument(format!("mount '{}' handle is null", name)))?;
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

    pub fn detach(&mut self) -> Option<*mut c_void> {
        let raw = self.raw.take().map(NonNull::as_ptr);
        if raw.is_some() {
            debug!("Detached mount {}", self.name);
        }
        raw
    }

    pub(crate) fn validate_open(&self) -> Result<*mut c_void> {
        self.raw
            .map(NonNull::as_ptr)
            .ok_or_else(|| BridgeError::invalid_argument(format!("mount '{}' is not open", self.name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockMount;

    #[test]
    fn test_null_mount_rejected() {
        let err = unsafe { Mount::from_raw("fs", std::ptr::null_mut()) }.unwrap_err();
        assert!(matches!(err, BridgeError::InvalidArgument { .. }));
    }

    #[test]
    fn test_detach_closes_mount() {
        let mock = MockMount::new();
        let mut mount = mock.mount();
        assert!(mount.is_open());

        assert!(mount.detach().is_some());
        assert!(!mount.is_open());
        assert!(mount.validate_open().is_err());
    }
}
