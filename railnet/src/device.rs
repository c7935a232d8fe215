//! Devices and plugin initialization.
//!
//! A device is one NIC group: an ordered list of rails (libfabric provider
//! instances sharing a fabric), a striping scheduler, and an MR key pool when
//! the provider wants caller-chosen keys. Endpoints are realized lazily, one
//! per thread per device.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicU8, Ordering};

use slab::Slab;
use tracing::{debug, info, warn};

use libfabric::{self as ofi, Hints, Info};

use crate::config::Config;
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::request::MAX_REQUESTS;
use crate::scheduler::ThresholdScheduler;
use crate::wire::{MAX_COMMS, MAX_RAILS};

/// GPUDirect-RDMA support state. Unknown until the first endpoint is
/// realized; fixed afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GdrSupport {
    Unknown,
    Supported,
    Unsupported,
}

static SUPPORT_GDR: AtomicU8 = AtomicU8::new(0);

/// Current GPUDirect-RDMA support state.
pub fn gdr_support() -> GdrSupport {
    match SUPPORT_GDR.load(Ordering::Acquire) {
        1 => GdrSupport::Supported,
        2 => GdrSupport::Unsupported,
        _ => GdrSupport::Unknown,
    }
}

/// Resolve the GDR probe on first endpoint realization; later calls are
/// no-ops so the answer never changes.
pub(crate) fn resolve_gdr_support(supported: bool) {
    let value = if supported { 1 } else { 2 };
    let _ = SUPPORT_GDR.compare_exchange(0, value, Ordering::AcqRel, Ordering::Acquire);
}

/// Fixed-capacity id allocator for MR keys.
pub(crate) struct IdPool {
    used: Slab<()>,
    max: usize,
}

impl IdPool {
    pub(crate) fn new(max: usize) -> Self {
        Self {
            used: Slab::new(),
            max,
        }
    }

    pub(crate) fn alloc(&mut self) -> Result<u64> {
        if self.used.len() >= self.max {
            return Err(Error::ResourceExhausted("MR key pool"));
        }
        Ok(self.used.insert(()) as u64)
    }

    pub(crate) fn free(&mut self, id: u64) {
        if self.used.try_remove(id as usize).is_none() {
            warn!(id, "freeing MR key that was not allocated");
        }
    }
}

/// One rail of a device: the provider instance plus its opened fabric and
/// access domain.
pub(crate) struct DeviceRail {
    pub(crate) info: Info,
    pub(crate) domain: ofi::Domain,
    // Kept alive for the domain.
    _fabric: ofi::Fabric,
}

/// A logical NIC group.
pub struct Device {
    pub(crate) dev_id: usize,
    pub(crate) rails: Vec<DeviceRail>,
    pub(crate) scheduler: ThresholdScheduler,
    /// `None` when the provider assigns MR keys itself.
    pub(crate) key_pool: Option<RefCell<IdPool>>,
    pub(crate) needs_local_mr: bool,
    pub(crate) config: Rc<Config>,
    prov_name: String,
    /// Realized-endpoint count across threads, for leak diagnostics.
    live_endpoints: Cell<usize>,
}

/// Properties reported to the collective library.
#[derive(Debug, Clone)]
pub struct Properties {
    pub name: String,
    /// Aggregate port speed over all rails, bits per second.
    pub port_speed: u64,
    /// Configured latency in microseconds.
    pub latency_us: f32,
    pub max_communicators: usize,
    pub max_requests: usize,
    pub num_rails: usize,
}

thread_local! {
    static THREAD_ENDPOINTS: RefCell<HashMap<usize, Rc<Endpoint>>> =
        RefCell::new(HashMap::new());
}

impl Device {
    /// Number of rails of this device.
    pub fn num_rails(&self) -> usize {
        self.rails.len()
    }

    /// Provider name of the first rail.
    pub fn prov_name(&self) -> &str {
        &self.prov_name
    }

    /// Device properties for the caller's topology decisions.
    pub fn properties(&self) -> Properties {
        let per_rail = self.rails[0].info.link_speed().unwrap_or(0);
        Properties {
            name: self.prov_name.clone(),
            port_speed: per_rail * self.rails.len() as u64,
            latency_us: self.config.net_latency,
            max_communicators: MAX_COMMS,
            max_requests: MAX_REQUESTS,
            num_rails: self.rails.len(),
        }
    }

    /// The calling thread's endpoint for this device, created on first
    /// acquisition. Every acquisition takes one reference; pair it with
    /// [`Endpoint::release`].
    pub fn scoped_endpoint(self: &Rc<Self>) -> Result<Rc<Endpoint>> {
        let key = Rc::as_ptr(self) as usize;
        THREAD_ENDPOINTS.with(|slots| {
            if let Some(ep) = slots.borrow().get(&key) {
                ep.ref_inc();
                return Ok(ep.clone());
            }
            let ep = Endpoint::create(self.clone())?;
            self.live_endpoints.set(self.live_endpoints.get() + 1);
            debug!(dev = self.dev_id, "created thread endpoint");
            slots.borrow_mut().insert(key, ep.clone());
            Ok(ep)
        })
    }

    /// Drop the calling thread's endpoint slot once its refcount hit zero.
    pub(crate) fn forget_endpoint(&self, device_key: usize) {
        THREAD_ENDPOINTS.with(|slots| {
            slots.borrow_mut().remove(&device_key);
        });
        self.live_endpoints.set(self.live_endpoints.get().saturating_sub(1));
    }

    /// Allocate an MR key when the provider wants caller-chosen keys.
    pub(crate) fn alloc_mr_key(&self) -> Result<Option<u64>> {
        match &self.key_pool {
            Some(pool) => Ok(Some(pool.borrow_mut().alloc()?)),
            None => Ok(None),
        }
    }

    pub(crate) fn free_mr_key(&self, key: u64) {
        if let Some(pool) = &self.key_pool {
            pool.borrow_mut().free(key);
        }
    }
}

/// Discover providers and group them into devices.
pub(crate) fn init_devices(
    config: &Rc<Config>,
    provider_filter: Option<&str>,
) -> Result<Vec<Rc<Device>>> {
    let hints = Hints::new()?
        .rdm_endpoint(
            ofi::caps::MSG
                | ofi::caps::RMA
                | ofi::caps::HMEM
                | ofi::caps::LOCAL_COMM
                | ofi::caps::REMOTE_COMM,
        )
        .mr_mode(
            ofi::mr_mode::LOCAL
                | ofi::mr_mode::HMEM
                | ofi::mr_mode::VIRT_ADDR
                | ofi::mr_mode::ALLOCATED
                | ofi::mr_mode::PROV_KEY,
            config.mr_key_size,
        )
        .thread_safe_default_progress();

    let infos = Info::providers(ofi::api_version(1, 18), provider_filter, &hints)
        .map_err(Error::Fabric)?;

    let (major, minor) = ofi::version();
    info!(major, minor, "using libfabric");

    // Keep the original provider-specific gate: a 3-byte prefix match on
    // "efa" requiring libfabric 1.18.
    if infos[0].prov_name().starts_with("efa") && !ofi::version_at_least(1, 18) {
        return Err(Error::Unsupported(
            "efa provider requires libfabric >= 1.18",
        ));
    }

    // Group rails into devices by fabric name, preserving discovery order.
    let mut groups: Vec<Vec<Info>> = Vec::new();
    for info in infos {
        match groups
            .iter_mut()
            .find(|group| group[0].fabric_name() == info.fabric_name())
        {
            Some(group) => group.push(info),
            None => groups.push(vec![info]),
        }
    }

    let rails_per_device = groups[0].len();
    if rails_per_device == 0 || rails_per_device > MAX_RAILS {
        return Err(Error::InvalidArgument("unexpected rail group size"));
    }
    if groups.iter().any(|g| g.len() != rails_per_device) {
        return Err(Error::InvalidArgument(
            "providers report unequal rail counts across devices",
        ));
    }

    let mut devices = Vec::with_capacity(groups.len());
    for (dev_id, group) in groups.into_iter().enumerate() {
        devices.push(Rc::new(create_device(config, dev_id, group)?));
    }
    Ok(devices)
}

fn create_device(config: &Rc<Config>, dev_id: usize, group: Vec<Info>) -> Result<Device> {
    let prov_name = group[0].prov_name().to_string();
    let needs_user_keys = group[0].needs_user_mr_keys();
    let needs_local_mr = group[0].needs_local_mr();
    let num_rails = group.len();

    let mut rails = Vec::with_capacity(num_rails);
    for info in group {
        let fabric = ofi::Fabric::open(&info).map_err(Error::Fabric)?;
        let domain = ofi::Domain::open(&fabric, &info).map_err(Error::Fabric)?;
        rails.push(DeviceRail {
            info,
            domain,
            _fabric: fabric,
        });
    }

    let key_pool = if needs_user_keys {
        let max_keys = 1usize
            .checked_shl((config.mr_key_size * 8) as u32)
            .unwrap_or(usize::MAX);
        Some(RefCell::new(IdPool::new(max_keys)))
    } else {
        None
    };

    info!(
        dev = dev_id,
        provider = %prov_name,
        rails = num_rails,
        user_keys = needs_user_keys,
        "initialized device"
    );

    Ok(Device {
        dev_id,
        rails,
        scheduler: ThresholdScheduler::new(num_rails, config.round_robin_threshold),
        key_pool,
        needs_local_mr,
        config: config.clone(),
        prov_name,
        live_endpoints: Cell::new(0),
    })
}
