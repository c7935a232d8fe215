//! Per-rail memory registration handles.
//!
//! A buffer used for sends, receives or flushes is registered once per rail;
//! the handle carries one registration (and, when the provider wants
//! caller-chosen keys, one key-pool id) per rail. Handles are reference
//! counted: requests hold clones while operations are in flight.

use std::rc::Rc;

use libfabric::{Access, HmemIface, MemoryRegion, MrAttr, MrDesc};

use crate::device::Device;
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};

/// Kind of memory a buffer lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferType {
    /// Host memory.
    Host,
    /// CUDA device memory on the given device ordinal.
    Cuda { device: i32 },
    /// Neuron device memory.
    Neuron,
}

/// A buffer registered on every rail of one device.
pub struct MrHandle {
    pub(crate) mrs: Vec<MemoryRegion>,
    keys: Vec<u64>,
    device: Option<Rc<Device>>,
}

impl MrHandle {
    /// Register `size` bytes at `data` on every rail of the endpoint's
    /// device.
    ///
    /// # Safety
    /// The buffer must stay valid, on the claimed memory interface, until
    /// the handle (and every request referencing it) is dropped.
    pub(crate) unsafe fn register(
        ep: &Endpoint,
        data: *const u8,
        size: usize,
        kind: BufferType,
    ) -> Result<MrHandle> {
        let device = ep.device().clone();
        let mut mrs = Vec::with_capacity(device.num_rails());
        let mut keys = Vec::new();

        // Send/recv plus both sides of RDMA writes on every registration;
        // host buffers additionally source local reads (flush target page),
        // device buffers are read remotely by the flush.
        let mut access = Access::SEND | Access::RECV | Access::WRITE | Access::REMOTE_WRITE;
        let iface = match kind {
            BufferType::Host => {
                access |= Access::READ;
                HmemIface::System
            }
            BufferType::Cuda { device } => {
                access |= Access::REMOTE_READ;
                HmemIface::Cuda(device)
            }
            BufferType::Neuron => {
                access |= Access::REMOTE_READ;
                HmemIface::Neuron
            }
        };

        for rail in &device.rails {
            let requested_key = device.alloc_mr_key()?;
            let attr = MrAttr {
                addr: data,
                len: size,
                access,
                requested_key,
                iface,
            };
            let mr = MemoryRegion::register(&rail.domain, &attr).map_err(Error::Fabric)?;
            mrs.push(mr);
            if let Some(key) = requested_key {
                keys.push(key);
            }
        }

        Ok(MrHandle {
            mrs,
            keys,
            device: Some(device),
        })
    }

    /// Local descriptor for `rail_id`.
    pub(crate) fn desc(&self, rail_id: usize) -> MrDesc {
        match self.mrs.get(rail_id) {
            Some(mr) => mr.desc(),
            None => MrDesc::null(),
        }
    }

    /// Remote key for `rail_id`.
    pub(crate) fn key(&self, rail_id: usize) -> Result<u64> {
        self.mrs
            .get(rail_id)
            .ok_or(Error::InvalidArgument("rail id out of range"))?
            .key()
            .map_err(Error::Fabric)
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> MrHandle {
        MrHandle {
            mrs: Vec::new(),
            keys: Vec::new(),
            device: None,
        }
    }
}

impl Drop for MrHandle {
    fn drop(&mut self) {
        if let Some(device) = &self.device {
            for key in self.keys.drain(..) {
                device.free_mr_key(key);
            }
        }
    }
}
