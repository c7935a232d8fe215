//! # railnet — RDMA multi-rail transport
//!
//! A transport plugin bridging a collective-communications runtime to an
//! RDMA-capable fabric through libfabric reliable-datagram endpoints. A
//! logical device aggregates several NICs ("rails"); every message is either
//! sent eagerly through pre-posted bounce buffers or announced by the
//! receiver with a control message and striped across the rails as RDMA
//! writes carrying identifying immediate data.
//!
//! No internal threads run: every `send`, `recv`, `flush`, `test`, `connect`
//! and `accept` call drains the completion queues of the calling thread's
//! endpoint, retries backpressured posts, and retires finished requests.
//!
//! ## Architecture
//!
//! - [`config`]: environment-driven configuration (`Config`)
//! - [`error`]: error kinds and caller-facing categories
//! - [`wire`]: wire messages and immediate-data encoding
//! - [`scheduler`]: the round-robin/striping scheduler
//! - [`msgbuff`]: the sliding window reconciling posts with arrivals
//! - [`pool`]: page-aligned registered slot pools
//! - [`request`]: the request model and completion accounting
//! - [`device`]: devices, provider discovery, the GPUDirect probe
//! - [`endpoint`]: rails, bounce buffers and the progress engine
//! - [`comm`]: communicators, handshake and the data-transfer protocol
//!
//! ## Usage
//!
//! ```ignore
//! let plugin = railnet::Plugin::init(railnet::Config::from_env()?, None)?;
//! let device = plugin.device(0);
//! let ep = device.scoped_endpoint()?;
//!
//! // Receiver side.
//! let (handle, l_comm) = railnet::listen(&ep)?;
//! // ... ship handle.to_bytes() to the peer out of band ...
//! let r_comm = loop {
//!     if let Some(c) = l_comm.accept()? {
//!         break c;
//!     }
//! };
//!
//! // Sender side.
//! let mut handle = railnet::ConnHandle::from_bytes(&bytes);
//! let s_comm = loop {
//!     if let Some(c) = railnet::connect(&ep, &mut handle)? {
//!         break c;
//!     }
//! };
//! ```

pub mod comm;
pub mod config;
pub mod device;
pub mod endpoint;
pub mod error;
pub mod mr;
pub mod msgbuff;
pub mod pool;
pub mod request;
pub mod scheduler;
pub mod wire;

use std::rc::Rc;

use tracing::{info, warn};

pub use comm::{
    connect, listen, ConnHandle, ListenComm, RecvBuffer, RecvComm, Request, SendComm, HANDLE_SIZE,
    MAX_RECVS,
};
pub use config::{Config, Protocol};
pub use device::{gdr_support, Device, GdrSupport, Properties};
pub use endpoint::Endpoint;
pub use error::{Category, Error, Result};
pub use mr::{BufferType, MrHandle};

/// The initialized transport: one device per NIC group.
pub struct Plugin {
    devices: Vec<Rc<Device>>,
    config: Rc<Config>,
}

impl Plugin {
    /// Initialize the RDMA transport over the providers matching
    /// `provider_filter`.
    pub fn init(config: Config, provider_filter: Option<&str>) -> Result<Plugin> {
        config.validate()?;

        match config.protocol {
            Protocol::Rdma => {}
            Protocol::SendRecv => {
                return Err(Error::Unsupported(
                    "the sendrecv transport is provided by a separate crate",
                ))
            }
        }

        let mut config = config;
        if config.cuda_flush_enable {
            // Without the GPU-vendor flush API linked in, flushes fall back
            // to the read-based path.
            warn!("CUDA flush requested but unavailable; using flush reads");
            config.cuda_flush_enable = false;
        }

        let config = Rc::new(config);
        let devices = device::init_devices(&config, provider_filter)?;
        info!(devices = devices.len(), "rdma transport initialized");

        // Realize one endpoint so the GPUDirect probe resolves; communication
        // threads create their own on first use.
        let ep = devices[0].scoped_endpoint()?;
        ep.release();
        debug_assert!(gdr_support() != GdrSupport::Unknown);

        // This check can only run after the first endpoint exists.
        if config.nic_dup_conns > 0 && gdr_support() != GdrSupport::Unsupported {
            return Err(Error::Unsupported(
                "NIC_DUP_CONNS is incompatible with GPUDirect RDMA platforms",
            ));
        }

        Ok(Plugin { devices, config })
    }

    /// Initialize from `RAILNET_*` environment variables.
    pub fn from_env() -> Result<Plugin> {
        Plugin::init(Config::from_env()?, None)
    }

    pub fn num_devices(&self) -> usize {
        self.devices.len()
    }

    pub fn device(&self, dev_id: usize) -> &Rc<Device> {
        &self.devices[dev_id]
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}
