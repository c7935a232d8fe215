//! Endpoints, address vectors and data transfer verbs.

use std::ffi::c_void;
use std::ptr::{self, NonNull};

use crate::cq::CompletionQueue;
use crate::error::{check, Errno, Result};
use crate::fabric::Domain;
use crate::info::Info;
use crate::mr::MrDesc;

/// Maximum endpoint name length carried in connection messages.
pub const MAX_EP_NAME: usize = 56;

/// A fabric address resolved through an address vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address(pub(crate) libfabric_sys::fi_addr_t);

impl Address {
    /// Wildcard source address for unsolicited receives.
    pub fn unspec() -> Self {
        Address(libfabric_sys::FI_ADDR_UNSPEC)
    }
}

/// A local endpoint name as returned by `fi_getname`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpName {
    bytes: [u8; MAX_EP_NAME],
}

impl EpName {
    pub fn from_bytes(bytes: [u8; MAX_EP_NAME]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; MAX_EP_NAME] {
        &self.bytes
    }
}

/// An address vector mapping endpoint names to fabric addresses.
pub struct AddressVector {
    raw: NonNull<libfabric_sys::fid_av>,
    _domain: Domain,
}

impl AddressVector {
    /// Open a table-style AV on `domain`.
    pub fn open(domain: &Domain) -> Result<Self> {
        let mut attr: libfabric_sys::fi_av_attr = unsafe { std::mem::zeroed() };
        attr.type_ = libfabric_sys::fi_av_type_FI_AV_TABLE;

        let mut raw: *mut libfabric_sys::fid_av = ptr::null_mut();
        let ret = unsafe {
            libfabric_sys::fi_av_open(domain.as_ptr(), &mut attr, &mut raw, ptr::null_mut())
        };
        check(ret as isize)?;
        let raw = NonNull::new(raw).ok_or(Errno::NOMEM)?;
        Ok(Self {
            raw,
            _domain: domain.clone(),
        })
    }

    /// Insert one endpoint name, returning its fabric address.
    pub fn insert(&self, name: &EpName) -> Result<Address> {
        let mut addr: libfabric_sys::fi_addr_t = 0;
        let ret = unsafe {
            libfabric_sys::fi_av_insert(
                self.raw.as_ptr(),
                name.as_bytes().as_ptr() as *const c_void,
                1,
                &mut addr,
                0,
                ptr::null_mut(),
            )
        };
        // fi_av_insert returns the number of successfully inserted addresses.
        if ret != 1 {
            return Err(Errno::INVAL);
        }
        Ok(Address(addr))
    }

    fn as_fid(&self) -> *mut libfabric_sys::fid {
        unsafe { &mut (*self.raw.as_ptr()).fid }
    }
}

impl Drop for AddressVector {
    fn drop(&mut self) {
        unsafe { libfabric_sys::fi_close(&mut (*self.raw.as_ptr()).fid) };
    }
}

/// A connectionless reliable-datagram endpoint bound to one AV and one CQ.
pub struct Endpoint {
    raw: NonNull<libfabric_sys::fid_ep>,
    _domain: Domain,
}

impl Endpoint {
    /// Create an endpoint, bind the AV and CQ (transmit + receive), and
    /// enable it.
    pub fn open(
        domain: &Domain,
        info: &Info,
        av: &AddressVector,
        cq: &CompletionQueue,
    ) -> Result<Self> {
        let mut raw: *mut libfabric_sys::fid_ep = ptr::null_mut();
        let ret = unsafe {
            libfabric_sys::fi_endpoint(domain.as_ptr(), info.as_ptr(), &mut raw, ptr::null_mut())
        };
        check(ret as isize)?;
        let raw = NonNull::new(raw).ok_or(Errno::NOMEM)?;
        let ep = Self {
            raw,
            _domain: domain.clone(),
        };

        unsafe {
            check(libfabric_sys::fi_ep_bind(ep.raw.as_ptr(), av.as_fid(), 0) as isize)?;
            check(libfabric_sys::fi_ep_bind(
                ep.raw.as_ptr(),
                cq.as_fid(),
                (libfabric_sys::FI_TRANSMIT | libfabric_sys::FI_RECV) as u64,
            ) as isize)?;
            check(libfabric_sys::fi_enable(ep.raw.as_ptr()) as isize)?;
        }

        Ok(ep)
    }

    /// The local endpoint name, for exchange with peers.
    pub fn name(&self) -> Result<EpName> {
        let mut bytes = [0u8; MAX_EP_NAME];
        let mut len = MAX_EP_NAME;
        let ret = unsafe {
            libfabric_sys::fi_getname(
                &mut (*self.raw.as_ptr()).fid,
                bytes.as_mut_ptr() as *mut c_void,
                &mut len,
            )
        };
        check(ret as isize)?;
        Ok(EpName { bytes })
    }

    /// Post a message send.
    ///
    /// # Safety
    /// `buf..buf+len` must stay valid until the completion for `context` is
    /// reaped, and must be covered by `desc`'s registration when the provider
    /// requires local MRs.
    pub unsafe fn send(
        &self,
        buf: *const u8,
        len: usize,
        desc: MrDesc,
        dest: Address,
        context: u64,
    ) -> Result<()> {
        check(libfabric_sys::fi_send(
            self.raw.as_ptr(),
            buf as *const c_void,
            len,
            desc.0,
            dest.0,
            context as *mut c_void,
        ) as isize)
    }

    /// Post a message send carrying remote CQ data (immediate).
    ///
    /// # Safety
    /// Same contract as [`Endpoint::send`].
    pub unsafe fn send_with_data(
        &self,
        buf: *const u8,
        len: usize,
        desc: MrDesc,
        data: u64,
        dest: Address,
        context: u64,
    ) -> Result<()> {
        check(libfabric_sys::fi_senddata(
            self.raw.as_ptr(),
            buf as *const c_void,
            len,
            desc.0,
            data,
            dest.0,
            context as *mut c_void,
        ) as isize)
    }

    /// Post a receive matching any source.
    ///
    /// # Safety
    /// Same contract as [`Endpoint::send`], with `buf` writable.
    pub unsafe fn recv(
        &self,
        buf: *mut u8,
        len: usize,
        desc: MrDesc,
        context: u64,
    ) -> Result<()> {
        check(libfabric_sys::fi_recv(
            self.raw.as_ptr(),
            buf as *mut c_void,
            len,
            desc.0,
            libfabric_sys::FI_ADDR_UNSPEC,
            context as *mut c_void,
        ) as isize)
    }

    /// Post an RDMA write carrying remote CQ data (immediate).
    ///
    /// # Safety
    /// Same contract as [`Endpoint::send`]; additionally `remote_addr` and
    /// `remote_key` must name a live registration at the target.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn write_with_data(
        &self,
        buf: *const u8,
        len: usize,
        desc: MrDesc,
        data: u64,
        dest: Address,
        remote_addr: u64,
        remote_key: u64,
        context: u64,
    ) -> Result<()> {
        check(libfabric_sys::fi_writedata(
            self.raw.as_ptr(),
            buf as *const c_void,
            len,
            desc.0,
            data,
            dest.0,
            remote_addr,
            remote_key,
            context as *mut c_void,
        ) as isize)
    }

    /// Post an RDMA read.
    ///
    /// # Safety
    /// Same contract as [`Endpoint::write_with_data`], with `buf` writable.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn read(
        &self,
        buf: *mut u8,
        len: usize,
        desc: MrDesc,
        src: Address,
        remote_addr: u64,
        remote_key: u64,
        context: u64,
    ) -> Result<()> {
        check(libfabric_sys::fi_read(
            self.raw.as_ptr(),
            buf as *mut c_void,
            len,
            desc.0,
            src.0,
            remote_addr,
            remote_key,
            context as *mut c_void,
        ) as isize)
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        unsafe { libfabric_sys::fi_close(&mut (*self.raw.as_ptr()).fid) };
    }
}
