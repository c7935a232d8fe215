//! Fabric and domain handles.

use std::ptr::{self, NonNull};
use std::rc::Rc;

use crate::error::{check, Errno, Result};
use crate::info::Info;

pub(crate) struct FabricInner {
    pub(crate) raw: NonNull<libfabric_sys::fid_fabric>,
}

impl Drop for FabricInner {
    fn drop(&mut self) {
        unsafe { libfabric_sys::fi_close(&mut (*self.raw.as_ptr()).fid) };
    }
}

/// An opened fabric provider instance.
#[derive(Clone)]
pub struct Fabric {
    inner: Rc<FabricInner>,
}

impl Fabric {
    /// Open the fabric described by `info`.
    pub fn open(info: &Info) -> Result<Self> {
        let mut raw: *mut libfabric_sys::fid_fabric = ptr::null_mut();
        let ret = unsafe {
            libfabric_sys::fi_fabric(
                (*info.as_ptr()).fabric_attr,
                &mut raw,
                ptr::null_mut(),
            )
        };
        check(ret as isize)?;
        let raw = NonNull::new(raw).ok_or(Errno::NOMEM)?;
        Ok(Self {
            inner: Rc::new(FabricInner { raw }),
        })
    }
}

pub(crate) struct DomainInner {
    pub(crate) raw: NonNull<libfabric_sys::fid_domain>,
    // The fabric must outlive the domain.
    _fabric: Fabric,
}

impl Drop for DomainInner {
    fn drop(&mut self) {
        unsafe { libfabric_sys::fi_close(&mut (*self.raw.as_ptr()).fid) };
    }
}

/// A fabric access domain. Resource container for endpoints, CQs, AVs and
/// memory registrations of one rail.
#[derive(Clone)]
pub struct Domain {
    pub(crate) inner: Rc<DomainInner>,
}

impl Domain {
    /// Open an access domain on `fabric` for the provider instance `info`.
    pub fn open(fabric: &Fabric, info: &Info) -> Result<Self> {
        let mut raw: *mut libfabric_sys::fid_domain = ptr::null_mut();
        let ret = unsafe {
            libfabric_sys::fi_domain(
                fabric.inner.raw.as_ptr(),
                info.as_ptr(),
                &mut raw,
                ptr::null_mut(),
            )
        };
        check(ret as isize)?;
        let raw = NonNull::new(raw).ok_or(Errno::NOMEM)?;
        Ok(Self {
            inner: Rc::new(DomainInner {
                raw,
                _fabric: fabric.clone(),
            }),
        })
    }

    pub(crate) fn as_ptr(&self) -> *mut libfabric_sys::fid_domain {
        self.inner.raw.as_ptr()
    }
}
