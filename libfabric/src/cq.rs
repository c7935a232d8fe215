//! Completion queues.

use std::cell::RefCell;
use std::ptr::{self, NonNull};

use bitflags::bitflags;

use crate::error::{Errno, Result};
use crate::fabric::Domain;

bitflags! {
    /// Flag set attached to each completion, identifying the operation class.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CompletionFlags: u64 {
        const MSG = libfabric_sys::FI_MSG as u64;
        const RMA = libfabric_sys::FI_RMA as u64;
        const SEND = libfabric_sys::FI_SEND as u64;
        const RECV = libfabric_sys::FI_RECV as u64;
        const READ = libfabric_sys::FI_READ as u64;
        const WRITE = libfabric_sys::FI_WRITE as u64;
        const REMOTE_WRITE = libfabric_sys::FI_REMOTE_WRITE as u64;
        const REMOTE_CQ_DATA = libfabric_sys::FI_REMOTE_CQ_DATA as u64;
    }
}

/// A successful completion.
#[derive(Debug, Clone, Copy)]
pub struct CqEntry {
    /// Context token the operation was posted with (0 for remote writes).
    pub context: u64,
    pub flags: CompletionFlags,
    /// Completed byte count.
    pub len: usize,
    /// Remote CQ data (immediate), valid when `REMOTE_CQ_DATA` is set.
    pub data: u64,
}

/// An error completion read from the CQ error queue.
#[derive(Debug, Clone, Copy)]
pub struct CqErrEntry {
    pub context: u64,
    pub flags: CompletionFlags,
    pub len: usize,
    pub data: u64,
    /// Positive fabric error code.
    pub err: Errno,
    /// Provider-specific error code, for `err_string`.
    pub prov_errno: i32,
}

/// A completion queue delivering `fi_cq_data_entry` completions.
pub struct CompletionQueue {
    raw: NonNull<libfabric_sys::fid_cq>,
    scratch: RefCell<Vec<libfabric_sys::fi_cq_data_entry>>,
    _domain: Domain,
}

/// Outcome of a bounded CQ read.
pub enum CqRead {
    /// `n` entries were filled.
    Entries(usize),
    /// Nothing to report.
    Empty,
    /// An error completion is pending; drain it with `read_err`.
    ErrAvailable,
}

impl CompletionQueue {
    /// Open a CQ on `domain` sized by the provider default.
    pub fn open(domain: &Domain) -> Result<Self> {
        let mut attr: libfabric_sys::fi_cq_attr = unsafe { std::mem::zeroed() };
        attr.format = libfabric_sys::fi_cq_format_FI_CQ_FORMAT_DATA;
        attr.wait_obj = libfabric_sys::fi_wait_obj_FI_WAIT_NONE;

        let mut raw: *mut libfabric_sys::fid_cq = ptr::null_mut();
        let ret = unsafe {
            libfabric_sys::fi_cq_open(domain.as_ptr(), &mut attr, &mut raw, ptr::null_mut())
        };
        crate::error::check(ret as isize)?;
        let raw = NonNull::new(raw).ok_or(Errno::NOMEM)?;
        Ok(Self {
            raw,
            scratch: RefCell::new(Vec::new()),
            _domain: domain.clone(),
        })
    }

    /// Read up to `entries.len()` completions.
    pub fn read(&self, entries: &mut [CqEntry]) -> Result<CqRead> {
        let count = entries.len();
        let mut scratch = self.scratch.borrow_mut();
        scratch.resize(count, unsafe { std::mem::zeroed() });

        let ret = unsafe {
            libfabric_sys::fi_cq_read(
                self.raw.as_ptr(),
                scratch.as_mut_ptr() as *mut std::ffi::c_void,
                count,
            )
        };

        if ret > 0 {
            let n = ret as usize;
            for (dst, e) in entries.iter_mut().zip(scratch.iter().take(n)) {
                *dst = CqEntry {
                    context: e.op_context as u64,
                    flags: CompletionFlags::from_bits_truncate(e.flags),
                    len: e.len,
                    data: e.data,
                };
            }
            return Ok(CqRead::Entries(n));
        }

        let err = Errno::from_ret(ret);
        if err.is_again() {
            Ok(CqRead::Empty)
        } else if err == Errno::AVAIL {
            Ok(CqRead::ErrAvailable)
        } else {
            Err(err)
        }
    }

    /// Read one entry from the error queue. `None` when the error entry is
    /// not yet available.
    pub fn read_err(&self) -> Result<Option<CqErrEntry>> {
        let mut raw: libfabric_sys::fi_cq_err_entry = unsafe { std::mem::zeroed() };
        let ret = unsafe { libfabric_sys::fi_cq_readerr(self.raw.as_ptr(), &mut raw, 0) };

        if ret < 0 {
            let err = Errno::from_ret(ret as isize);
            if err.is_again() {
                return Ok(None);
            }
            return Err(err);
        }

        Ok(Some(CqErrEntry {
            context: raw.op_context as u64,
            flags: CompletionFlags::from_bits_truncate(raw.flags),
            len: raw.len,
            data: raw.data,
            err: Errno::from_raw(raw.err),
            prov_errno: raw.prov_errno,
        }))
    }

    /// Provider-specific message for an error completion.
    pub fn err_string(&self, prov_errno: i32) -> String {
        unsafe {
            let ptr = libfabric_sys::fi_cq_strerror(
                self.raw.as_ptr(),
                prov_errno,
                ptr::null(),
                ptr::null_mut(),
                0,
            );
            if ptr.is_null() {
                return String::from("unknown provider error");
            }
            std::ffi::CStr::from_ptr(ptr)
                .to_string_lossy()
                .into_owned()
        }
    }

    pub(crate) fn as_fid(&self) -> *mut libfabric_sys::fid {
        unsafe { &mut (*self.raw.as_ptr()).fid }
    }
}

impl Drop for CompletionQueue {
    fn drop(&mut self) {
        unsafe { libfabric_sys::fi_close(&mut (*self.raw.as_ptr()).fid) };
    }
}
