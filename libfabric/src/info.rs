//! Provider discovery.
//!
//! Wraps `fi_getinfo` and the `fi_info` structure. Discovery takes a `Hints`
//! describing the endpoint requirements and yields one `Info` per matching
//! provider instance (typically one per NIC).

use std::ffi::CStr;
use std::ptr::{self, NonNull};

use crate::error::{check, Errno, Result};

/// Requirements passed to provider discovery.
pub struct Hints {
    raw: NonNull<libfabric_sys::fi_info>,
}

impl Hints {
    /// Allocate an empty hints structure.
    pub fn new() -> Result<Self> {
        let raw = unsafe { libfabric_sys::fi_allocinfo() };
        let raw = NonNull::new(raw).ok_or(Errno::NOMEM)?;
        Ok(Self { raw })
    }

    /// Request a reliable-datagram endpoint with the given capability bits.
    pub fn rdm_endpoint(self, caps: u64) -> Self {
        unsafe {
            let info = self.raw.as_ptr();
            (*info).caps = caps;
            (*info).mode = 0;
            (*(*info).tx_attr).msg_order = 0;
            (*(*info).rx_attr).msg_order = 0;
            (*(*info).ep_attr).type_ = libfabric_sys::fi_ep_type_FI_EP_RDM;
        }
        self
    }

    /// Set the domain memory-registration mode bits and requested key size.
    pub fn mr_mode(self, mode: u32, key_size: usize) -> Self {
        unsafe {
            let domain = (*self.raw.as_ptr()).domain_attr;
            (*domain).mr_mode = mode as i32;
            (*domain).mr_key_size = key_size;
        }
        self
    }

    /// Request thread-safe domains with provider-default progress.
    pub fn thread_safe_default_progress(self) -> Self {
        unsafe {
            let domain = (*self.raw.as_ptr()).domain_attr;
            (*domain).threading = libfabric_sys::fi_threading_FI_THREAD_SAFE;
            (*domain).control_progress = libfabric_sys::fi_progress_FI_PROGRESS_UNSPEC;
            (*domain).data_progress = libfabric_sys::fi_progress_FI_PROGRESS_UNSPEC;
        }
        self
    }

    fn as_ptr(&self) -> *mut libfabric_sys::fi_info {
        self.raw.as_ptr()
    }
}

impl Drop for Hints {
    fn drop(&mut self) {
        unsafe { libfabric_sys::fi_freeinfo(self.raw.as_ptr()) }
    }
}

/// One provider instance returned by discovery.
///
/// Owns a deep copy (`fi_dupinfo`) of the underlying `fi_info`, detached from
/// the discovery list.
pub struct Info {
    raw: NonNull<libfabric_sys::fi_info>,
}

impl Info {
    /// Discover providers matching `hints` under the given API version.
    ///
    /// When `filter` is set, only providers whose name starts with the filter
    /// string are returned.
    pub fn providers(version: u32, filter: Option<&str>, hints: &Hints) -> Result<Vec<Info>> {
        let mut head: *mut libfabric_sys::fi_info = ptr::null_mut();
        let ret = unsafe {
            libfabric_sys::fi_getinfo(
                version,
                ptr::null(),
                ptr::null(),
                0,
                hints.as_ptr(),
                &mut head,
            )
        };
        check(ret as isize)?;

        let mut infos = Vec::new();
        let mut cur = head;
        while !cur.is_null() {
            let keep = match filter {
                Some(f) => prov_name_of(cur).map(|n| n.starts_with(f)).unwrap_or(false),
                None => true,
            };
            if keep {
                let dup = unsafe { libfabric_sys::fi_dupinfo(cur) };
                if let Some(dup) = NonNull::new(dup) {
                    // fi_dupinfo may or may not copy the next pointer; detach.
                    unsafe { (*dup.as_ptr()).next = ptr::null_mut() };
                    infos.push(Info { raw: dup });
                }
            }
            cur = unsafe { (*cur).next };
        }
        unsafe { libfabric_sys::fi_freeinfo(head) };

        if infos.is_empty() {
            return Err(Errno::NOSYS);
        }
        Ok(infos)
    }

    /// Provider name, e.g. `"efa"` or `"tcp;ofi_rxm"`.
    pub fn prov_name(&self) -> &str {
        prov_name_of(self.raw.as_ptr()).unwrap_or("")
    }

    /// Fabric name; rails of one NIC group share it.
    pub fn fabric_name(&self) -> &str {
        unsafe {
            let name = (*(*self.raw.as_ptr()).fabric_attr).name;
            if name.is_null() {
                return "";
            }
            CStr::from_ptr(name).to_str().unwrap_or("")
        }
    }

    /// Capability bits of the provider instance.
    pub fn caps(&self) -> u64 {
        unsafe { (*self.raw.as_ptr()).caps }
    }

    /// Whether the provider expects the application to supply MR keys.
    pub fn needs_user_mr_keys(&self) -> bool {
        unsafe {
            let mode = (*(*self.raw.as_ptr()).domain_attr).mr_mode as u32;
            (mode & libfabric_sys::FI_MR_PROV_KEY) == 0
        }
    }

    /// Whether registration of local buffers is required before use.
    pub fn needs_local_mr(&self) -> bool {
        unsafe {
            let mode = (*(*self.raw.as_ptr()).domain_attr).mr_mode as u32;
            (mode & libfabric_sys::FI_MR_LOCAL) != 0
        }
    }

    /// Link speed in bits per second, when the provider reports NIC info.
    pub fn link_speed(&self) -> Option<u64> {
        unsafe {
            let nic = (*self.raw.as_ptr()).nic;
            if nic.is_null() {
                return None;
            }
            let link = (*nic).link_attr;
            if link.is_null() {
                return None;
            }
            Some((*link).speed)
        }
    }

    /// Duplicate this provider instance.
    pub fn duplicate(&self) -> Result<Info> {
        let dup = unsafe { libfabric_sys::fi_dupinfo(self.raw.as_ptr()) };
        let dup = NonNull::new(dup).ok_or(Errno::NOMEM)?;
        unsafe { (*dup.as_ptr()).next = ptr::null_mut() };
        Ok(Info { raw: dup })
    }

    pub(crate) fn as_ptr(&self) -> *mut libfabric_sys::fi_info {
        self.raw.as_ptr()
    }
}

impl Drop for Info {
    fn drop(&mut self) {
        unsafe { libfabric_sys::fi_freeinfo(self.raw.as_ptr()) }
    }
}

fn prov_name_of(info: *const libfabric_sys::fi_info) -> Option<&'static str> {
    unsafe {
        let name = (*(*info).fabric_attr).prov_name;
        if name.is_null() {
            return None;
        }
        CStr::from_ptr(name).to_str().ok()
    }
}

/// Encode an API version for [`Info::providers`].
pub const fn api_version(major: u32, minor: u32) -> u32 {
    libfabric_sys::FI_VERSION(major, minor)
}

/// Runtime libfabric version as `(major, minor)`.
pub fn version() -> (u32, u32) {
    let v = unsafe { libfabric_sys::fi_version() };
    (libfabric_sys::FI_MAJOR(v), libfabric_sys::FI_MINOR(v))
}

/// Whether the runtime libfabric is at least `major.minor`.
pub fn version_at_least(major: u32, minor: u32) -> bool {
    let v = unsafe { libfabric_sys::fi_version() };
    !libfabric_sys::FI_VERSION_LT(v, libfabric_sys::FI_VERSION(major, minor))
}
