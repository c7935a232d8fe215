//! Safe wrapper over libfabric reliable-datagram (RDM) endpoints.
//!
//! Exposes the slice of the libfabric API a connectionless RDMA transport
//! needs: provider discovery with hints, per-NIC fabric/domain/endpoint/AV/CQ
//! lifecycle, memory registration with requested keys and HMEM interfaces,
//! and the five data-transfer verbs (`send`, `send_with_data`, `recv`,
//! `write_with_data`, `read`).
//!
//! Two conventions differ from a literal C translation:
//!
//! - Operations carry a plain `u64` context token instead of a raw pointer.
//!   The CQ returns the token verbatim, so callers can encode pool indices
//!   without ever materializing references to their request objects.
//! - `-FI_EAGAIN` is a first-class [`Errno`] value. Backpressure is part of
//!   the normal control flow and must be matched, not unwrapped.
//!
//! Handles are reference counted with `Rc` and are not `Send`: one thread
//! drives one set of fabric objects, mirroring the caller-driven progress
//! model of the transport above.

pub mod cq;
pub mod ep;
pub mod error;
pub mod fabric;
pub mod info;
pub mod mr;

pub use cq::{CompletionFlags, CompletionQueue, CqEntry, CqErrEntry, CqRead};
pub use ep::{Address, AddressVector, Endpoint, EpName, MAX_EP_NAME};
pub use error::{Errno, Result};
pub use fabric::{Domain, Fabric};
pub use info::{api_version, version, version_at_least, Hints, Info};
pub use mr::{Access, HmemIface, MemoryRegion, MrAttr, MrDesc};

/// Capability bits re-exported for hint construction.
pub mod caps {
    pub const MSG: u64 = libfabric_sys::FI_MSG as u64;
    pub const RMA: u64 = libfabric_sys::FI_RMA as u64;
    pub const HMEM: u64 = libfabric_sys::FI_HMEM as u64;
    pub const LOCAL_COMM: u64 = libfabric_sys::FI_LOCAL_COMM as u64;
    pub const REMOTE_COMM: u64 = libfabric_sys::FI_REMOTE_COMM as u64;
}

/// MR-mode bits re-exported for hint construction.
pub mod mr_mode {
    pub const LOCAL: u32 = libfabric_sys::FI_MR_LOCAL;
    pub const HMEM: u32 = libfabric_sys::FI_MR_HMEM;
    pub const VIRT_ADDR: u32 = libfabric_sys::FI_MR_VIRT_ADDR;
    pub const ALLOCATED: u32 = libfabric_sys::FI_MR_ALLOCATED;
    pub const PROV_KEY: u32 = libfabric_sys::FI_MR_PROV_KEY;
}
