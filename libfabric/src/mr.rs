//! Memory registration.

use std::ffi::c_void;
use std::ptr::{self, NonNull};

use bitflags::bitflags;

use crate::error::{check, Errno, Result};
use crate::fabric::Domain;

bitflags! {
    /// Access rights requested for a memory region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Access: u64 {
        const SEND = libfabric_sys::FI_SEND as u64;
        const RECV = libfabric_sys::FI_RECV as u64;
        const READ = libfabric_sys::FI_READ as u64;
        const WRITE = libfabric_sys::FI_WRITE as u64;
        const REMOTE_READ = libfabric_sys::FI_REMOTE_READ as u64;
        const REMOTE_WRITE = libfabric_sys::FI_REMOTE_WRITE as u64;
    }
}

/// Memory interface a buffer lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HmemIface {
    /// Host memory.
    System,
    /// CUDA device memory, with the owning device ordinal.
    Cuda(i32),
    /// Neuron device memory.
    Neuron,
}

/// Registration request for a single contiguous buffer.
pub struct MrAttr {
    pub addr: *const u8,
    pub len: usize,
    pub access: Access,
    /// Key to request from the provider; `None` when the provider assigns
    /// keys itself.
    pub requested_key: Option<u64>,
    pub iface: HmemIface,
}

/// A registered memory region.
pub struct MemoryRegion {
    raw: NonNull<libfabric_sys::fid_mr>,
    // Registration must not outlive the domain.
    _domain: Domain,
}

impl MemoryRegion {
    /// Register `attr` with the domain via `fi_mr_regattr`.
    ///
    /// # Safety
    /// The buffer must stay valid (and on the claimed memory interface) for
    /// the lifetime of the returned region.
    pub unsafe fn register(domain: &Domain, attr: &MrAttr) -> Result<Self> {
        let iov = libfabric_sys::iovec {
            iov_base: attr.addr as *mut c_void,
            iov_len: attr.len,
        };

        let mut mr_attr: libfabric_sys::fi_mr_attr = std::mem::zeroed();
        mr_attr.mr_iov = &iov;
        mr_attr.iov_count = 1;
        mr_attr.access = attr.access.bits();
        if let Some(key) = attr.requested_key {
            mr_attr.requested_key = key;
        }
        match attr.iface {
            HmemIface::System => {
                mr_attr.iface = libfabric_sys::fi_hmem_iface_FI_HMEM_SYSTEM;
            }
            HmemIface::Cuda(device) => {
                mr_attr.iface = libfabric_sys::fi_hmem_iface_FI_HMEM_CUDA;
                mr_attr.device.cuda = device;
            }
            HmemIface::Neuron => {
                mr_attr.iface = libfabric_sys::fi_hmem_iface_FI_HMEM_NEURON;
                // Sentinel; the provider is not expected to read it.
                mr_attr.device.neuron = -1;
            }
        }

        let mut raw: *mut libfabric_sys::fid_mr = ptr::null_mut();
        let ret = libfabric_sys::fi_mr_regattr(domain.as_ptr(), &mr_attr, 0, &mut raw);
        check(ret as isize)?;
        let raw = NonNull::new(raw).ok_or(Errno::NOMEM)?;
        Ok(Self {
            raw,
            _domain: domain.clone(),
        })
    }

    /// The remote protection key of the region.
    pub fn key(&self) -> Result<u64> {
        let key = unsafe { libfabric_sys::fi_mr_key(self.raw.as_ptr()) };
        if key == libfabric_sys::FI_KEY_NOTAVAIL {
            Err(Errno::from_raw(libfabric_sys::FI_ENOKEY as i32))
        } else {
            Ok(key)
        }
    }

    /// The local descriptor to pass alongside data transfers.
    pub fn desc(&self) -> MrDesc {
        MrDesc(unsafe { libfabric_sys::fi_mr_desc(self.raw.as_ptr()) })
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        unsafe { libfabric_sys::fi_close(&mut (*self.raw.as_ptr()).fid) };
    }
}

/// Local MR descriptor handed to data transfer calls.
#[derive(Debug, Clone, Copy)]
pub struct MrDesc(pub(crate) *mut c_void);

impl MrDesc {
    /// Descriptor for providers that do not require local registration.
    pub fn null() -> Self {
        MrDesc(ptr::null_mut())
    }
}
