//! Per-thread endpoints: rails, bounce buffers and the progress engine.
//!
//! An endpoint aggregates one libfabric endpoint/AV/CQ triple per rail and
//! owns everything that is shared between the communicators of one thread:
//! the communicator table, the bounce-buffer pool catching unsolicited
//! messages, and the pending-request queue absorbing fabric backpressure.
//!
//! All progress is caller-driven. [`Endpoint::process_cq`] drains each
//! rail's CQ in bounded batches, dispatches completions by their flag set,
//! drains the error queue, and finally retries pending posts until the first
//! renewed `EAGAIN`.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use slab::Slab;
use tracing::{debug, trace, warn};

use libfabric::{self as ofi, CompletionFlags, CqEntry, CqRead, MrDesc};

use crate::comm;
use crate::comm::CommState;
use crate::device::{resolve_gdr_support, Device};
use crate::error::{Error, Result};
use crate::mr::{BufferType, MrHandle};
use crate::pool::{RegisteredPool, SlotRef};
use crate::request::{
    inc_recv_seg_completion, inc_req_completion, set_eager_copy_completed, set_req_error,
    set_send_ctrl_completed, ReqIdx, ReqKind,
};
use crate::msgbuff::{Elem, ElemType, InsertResult, SlotStatus};
use crate::wire::{
    comm_id_from_imm, num_seg_from_imm, peek_msg_type, seq_from_imm, ConnMsg, CtrlMsg, MsgType,
    CONN_MSG_SIZE, CTRL_MSG_SIZE, MAX_COMMS,
};

/// Alignment of bounce-buffer slots.
const BOUNCE_ALIGN: usize = 128;

/// Slots added to the bounce payload pool per growth step.
const BOUNCE_SLOTS_PER_CHUNK: usize = 16;

/// Context tokens: bit 63 marks endpoint-level bounce requests, everything
/// else is `(comm_id << 32) | req_idx`.
const BOUNCE_CTX_FLAG: u64 = 1 << 63;

#[inline]
fn comm_ctx(comm_id: u32, req_idx: ReqIdx) -> u64 {
    ((comm_id as u64) << 32) | req_idx as u64
}

#[inline]
fn bounce_ctx(idx: usize) -> u64 {
    BOUNCE_CTX_FLAG | idx as u64
}

enum CtxRef {
    CommReq { comm_id: u32, req_idx: ReqIdx },
    Bounce { idx: usize },
}

fn decode_ctx(ctx: u64) -> CtxRef {
    if ctx & BOUNCE_CTX_FLAG != 0 {
        CtxRef::Bounce {
            idx: (ctx & !BOUNCE_CTX_FLAG) as usize,
        }
    } else {
        CtxRef::CommReq {
            comm_id: (ctx >> 32) as u32,
            req_idx: (ctx & 0xffff_ffff) as usize,
        }
    }
}

/// Outcome of posting one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Progress {
    Posted,
    /// The fabric returned `EAGAIN`; retry from the pending queue.
    Backpressure,
}

/// One rail: a libfabric endpoint bound to its own AV and CQ, plus the
/// bounce-buffer accounting for that rail.
pub(crate) struct Rail {
    pub(crate) rail_id: usize,
    pub(crate) ofi_ep: ofi::Endpoint,
    pub(crate) av: ofi::AddressVector,
    pub(crate) cq: ofi::CompletionQueue,
    pub(crate) local_name: ofi::EpName,
    num_bounce_posted: Cell<usize>,
    min_bounce_posted: usize,
    max_bounce_posted: usize,
}

/// An unsolicited-receive request wrapping one bounce payload slot.
pub(crate) struct BounceReq {
    slot: SlotRef,
    rail_id: usize,
    /// Byte count of the last message received into the slot.
    recv_len: usize,
    in_pending: bool,
}

enum PendingEntry {
    CommReq { comm_id: u32, req_idx: ReqIdx },
    Bounce { idx: usize },
}

/// Per-thread aggregation of all rails of one device.
pub struct Endpoint {
    device: Rc<Device>,
    device_key: usize,
    rails: Vec<Rail>,
    comms: RefCell<Slab<Rc<RefCell<CommState>>>>,
    bounce_reqs: RefCell<Slab<BounceReq>>,
    bounce_pool: RefCell<RegisteredPool>,
    pending: RefCell<VecDeque<PendingEntry>>,
    cq_scratch: RefCell<Vec<CqEntry>>,
    ref_cnt: Cell<usize>,
}

impl Endpoint {
    pub(crate) fn create(device: Rc<Device>) -> Result<Rc<Self>> {
        let device_key = Rc::as_ptr(&device) as usize;
        let config = &device.config;
        let num_rails = device.num_rails();

        let min_per_rail = config.min_posted_bounce_buffers.div_ceil(num_rails);
        let max_per_rail = config.max_posted_bounce_buffers.div_ceil(num_rails);

        let mut rails = Vec::with_capacity(num_rails);
        for (rail_id, dev_rail) in device.rails.iter().enumerate() {
            let av = ofi::AddressVector::open(&dev_rail.domain).map_err(Error::Fabric)?;
            let cq = ofi::CompletionQueue::open(&dev_rail.domain).map_err(Error::Fabric)?;
            let ofi_ep =
                ofi::Endpoint::open(&dev_rail.domain, &dev_rail.info, &av, &cq)
                    .map_err(Error::Fabric)?;
            let local_name = ofi_ep.name().map_err(Error::Fabric)?;
            rails.push(Rail {
                rail_id,
                ofi_ep,
                av,
                cq,
                local_name,
                num_bounce_posted: Cell::new(0),
                min_bounce_posted: min_per_rail,
                max_bounce_posted: max_per_rail,
            });
        }

        // A bounce slot must hold the largest unsolicited message.
        let slot_size = CONN_MSG_SIZE
            .max(CTRL_MSG_SIZE)
            .max(config.eager_max_size)
            .next_multiple_of(BOUNCE_ALIGN);

        // The GDR answer is fixed the first time any endpoint is realized.
        let hmem = device.rails[0].info.caps() & ofi::caps::HMEM != 0;
        resolve_gdr_support(hmem);

        let cq_read_count = config.cq_read_count;
        let ep = Rc::new(Self {
            device,
            device_key,
            rails,
            comms: RefCell::new(Slab::new()),
            bounce_reqs: RefCell::new(Slab::new()),
            bounce_pool: RefCell::new(RegisteredPool::new(slot_size, BOUNCE_SLOTS_PER_CHUNK)),
            pending: RefCell::new(VecDeque::new()),
            cq_scratch: RefCell::new(vec![
                CqEntry {
                    context: 0,
                    flags: CompletionFlags::empty(),
                    len: 0,
                    data: 0,
                };
                cq_read_count
            ]),
            ref_cnt: Cell::new(1),
        });

        ep.post_bounce_buffers_all()?;
        Ok(ep)
    }

    pub(crate) fn device(&self) -> &Rc<Device> {
        &self.device
    }

    pub(crate) fn num_rails(&self) -> usize {
        self.rails.len()
    }

    pub(crate) fn rail(&self, rail_id: usize) -> &Rail {
        &self.rails[rail_id]
    }

    /// Current endpoint reference count.
    pub fn ref_count(&self) -> usize {
        self.ref_cnt.get()
    }

    pub(crate) fn ref_inc(&self) {
        self.ref_cnt.set(self.ref_cnt.get() + 1);
    }

    /// Drop one reference. On the last release the endpoint is torn down and
    /// removed from the thread's slot.
    pub fn release(&self) {
        let refs = self.ref_cnt.get();
        debug_assert!(refs > 0);
        self.ref_cnt.set(refs - 1);
        if refs == 1 {
            if !self.comms.borrow().is_empty() {
                warn!("releasing endpoint with live communicators");
            }
            if !self.pending.borrow().is_empty() {
                warn!("releasing endpoint with pending requests");
            }
            self.device.forget_endpoint(self.device_key);
            debug!(dev = self.device.dev_id, "released endpoint");
        }
    }

    /// Register internal (host) memory on every rail.
    pub(crate) fn register_internal(&self, data: *const u8, len: usize) -> Result<Rc<MrHandle>> {
        // Safety: internal buffers are page-aligned mappings owned by this
        // endpoint and outlive the returned handle.
        let handle = unsafe { MrHandle::register(self, data, len, BufferType::Host)? };
        Ok(Rc::new(handle))
    }

    // ---- communicator table ----

    pub(crate) fn insert_comm(&self, state: CommState) -> Result<(u32, Rc<RefCell<CommState>>)> {
        let mut comms = self.comms.borrow_mut();
        if comms.len() >= MAX_COMMS {
            return Err(Error::ResourceExhausted("communicator ids"));
        }
        let rc = Rc::new(RefCell::new(state));
        let id = comms.insert(rc.clone()) as u32;
        Ok((id, rc))
    }

    pub(crate) fn comm(&self, comm_id: u32) -> Result<Rc<RefCell<CommState>>> {
        self.comms
            .borrow()
            .get(comm_id as usize)
            .cloned()
            .ok_or(Error::InvalidArgument("unknown communicator id"))
    }

    pub(crate) fn remove_comm(&self, comm_id: u32) {
        let mut comms = self.comms.borrow_mut();
        if comms.try_remove(comm_id as usize).is_none() {
            warn!(comm_id, "removing unknown communicator");
        }
    }

    // ---- bounce buffers ----

    fn alloc_bounce_req(&self, rail_id: usize) -> Result<usize> {
        let slot = self
            .bounce_pool
            .borrow_mut()
            .alloc(|ptr, len| self.register_internal(ptr, len))?;
        Ok(self.bounce_reqs.borrow_mut().insert(BounceReq {
            slot,
            rail_id,
            recv_len: 0,
            in_pending: false,
        }))
    }

    /// Post (or re-post) a bounce receive on its rail.
    fn post_bounce(&self, idx: usize) -> std::result::Result<(), ofi::Errno> {
        let (slot, rail_id) = {
            let reqs = self.bounce_reqs.borrow();
            let req = &reqs[idx];
            (req.slot, req.rail_id)
        };
        let pool = self.bounce_pool.borrow();
        let rail = &self.rails[rail_id];
        // Safety: the slot memory is owned by the bounce pool and registered
        // on this rail; it stays alive until the request completes.
        unsafe {
            rail.ofi_ep.recv(
                pool.addr(slot),
                pool.slot_size(),
                pool.desc(slot, rail_id),
                bounce_ctx(idx),
            )
        }
    }

    /// Fill the rail back up to its maximum posted count.
    fn post_bounce_buffers_on_rail(&self, rail_id: usize) -> Result<()> {
        let rail = &self.rails[rail_id];
        let needed = rail.max_bounce_posted - rail.num_bounce_posted.get();
        rail.num_bounce_posted.set(rail.max_bounce_posted);
        trace!(rail = rail.rail_id, needed, "refilling bounce buffers");

        for i in 0..needed {
            let idx = self.alloc_bounce_req(rail_id)?;
            match self.post_bounce(idx) {
                Ok(()) => {}
                Err(errno) if errno.is_again() => {
                    // This request waits in the pending queue; the rest of the
                    // promised fill never happened.
                    self.enqueue_pending_bounce(idx);
                    let failed = needed - i - 1;
                    rail.num_bounce_posted
                        .set(rail.num_bounce_posted.get() - failed);
                    break;
                }
                Err(errno) => return Err(Error::Fabric(errno)),
            }
        }
        Ok(())
    }

    fn post_bounce_buffers_all(&self) -> Result<()> {
        for rail_id in 0..self.rails.len() {
            self.post_bounce_buffers_on_rail(rail_id)?;
        }
        Ok(())
    }

    fn check_post_bounce_buffers_rail(&self, rail_id: usize) -> Result<()> {
        let rail = &self.rails[rail_id];
        if rail.num_bounce_posted.get() < rail.min_bounce_posted {
            self.post_bounce_buffers_on_rail(rail_id)?;
        }
        Ok(())
    }

    /// Account for one consumed bounce buffer and refill its rail when it
    /// dropped below the minimum.
    fn decrease_bounce_cnt(&self, rail_id: usize) -> Result<()> {
        let rail = &self.rails[rail_id];
        debug_assert!(rail.num_bounce_posted.get() > 0);
        rail.num_bounce_posted
            .set(rail.num_bounce_posted.get() - 1);
        self.check_post_bounce_buffers_rail(rail_id)
    }

    /// Re-post a bounce request whose payload stayed with the pool (the
    /// posted count is unchanged).
    fn repost_bounce(&self, idx: usize) -> Result<()> {
        let rail_id = self.bounce_reqs.borrow()[idx].rail_id;
        match self.post_bounce(idx) {
            Ok(()) => self.check_post_bounce_buffers_rail(rail_id),
            Err(errno) if errno.is_again() => {
                self.enqueue_pending_bounce(idx);
                Ok(())
            }
            Err(errno) => Err(Error::Fabric(errno)),
        }
    }

    /// After a bounce payload was consumed: re-post the request if the rail
    /// is below its maximum, otherwise release request and payload.
    pub(crate) fn check_post_bounce_req(&self, idx: usize) -> Result<()> {
        let rail_id = self.bounce_reqs.borrow()[idx].rail_id;
        let rail = &self.rails[rail_id];
        let need_post = rail.num_bounce_posted.get() < rail.max_bounce_posted;
        if !need_post {
            let req = self.bounce_reqs.borrow_mut().remove(idx);
            self.bounce_pool.borrow_mut().release(req.slot);
            return Ok(());
        }
        rail.num_bounce_posted
            .set(rail.num_bounce_posted.get() + 1);
        match self.post_bounce(idx) {
            Ok(()) => self.check_post_bounce_buffers_rail(rail_id),
            Err(errno) if errno.is_again() => {
                self.enqueue_pending_bounce(idx);
                Ok(())
            }
            Err(errno) => Err(Error::Fabric(errno)),
        }
    }

    pub(crate) fn bounce_payload(&self, idx: usize) -> (*const u8, usize) {
        let reqs = self.bounce_reqs.borrow();
        let req = &reqs[idx];
        (self.bounce_pool.borrow().addr(req.slot), req.recv_len)
    }

    pub(crate) fn bounce_rail(&self, idx: usize) -> usize {
        self.bounce_reqs.borrow()[idx].rail_id
    }

    pub(crate) fn bounce_recv_len(&self, idx: usize) -> usize {
        self.bounce_reqs.borrow()[idx].recv_len
    }

    pub(crate) fn bounce_slot_key(&self, idx: usize, rail_id: usize) -> Result<u64> {
        let slot = self.bounce_reqs.borrow()[idx].slot;
        self.bounce_pool.borrow().key(slot, rail_id)
    }

    /// Parse the control message held in a bounce slot.
    pub(crate) fn bounce_ctrl_msg(&self, idx: usize) -> CtrlMsg {
        let (ptr, _) = self.bounce_payload(idx);
        // Safety: the caller checked the received length.
        unsafe { CtrlMsg::read_from(ptr) }
    }

    fn bounce_conn_msg(&self, idx: usize) -> ConnMsg {
        let (ptr, _) = self.bounce_payload(idx);
        // Safety: the caller checked the received length.
        unsafe { ConnMsg::read_from(ptr) }
    }

    // ---- pending queue ----

    fn enqueue_pending_bounce(&self, idx: usize) {
        let mut reqs = self.bounce_reqs.borrow_mut();
        let req = &mut reqs[idx];
        if req.in_pending {
            return;
        }
        req.in_pending = true;
        self.pending
            .borrow_mut()
            .push_back(PendingEntry::Bounce { idx });
        trace!(idx, "bounce request queued on backpressure");
    }

    /// Queue a communicator request for retry on the next CQ drain.
    pub(crate) fn enqueue_pending(&self, state: &mut CommState, comm_id: u32, req_idx: ReqIdx) {
        let req = &mut state.reqs_mut()[req_idx];
        if req.in_pending {
            return;
        }
        req.in_pending = true;
        self.pending
            .borrow_mut()
            .push_back(PendingEntry::CommReq { comm_id, req_idx });
        trace!(comm_id, req_idx, kind = req.kind.name(), "request queued on backpressure");
    }

    // ---- posting ----

    /// Post a CONN / CONN_RESP message from the communicator's scratch
    /// buffer on the given rail.
    pub(crate) fn post_conn_msg(
        &self,
        rail_id: usize,
        msg: *const u8,
        len: usize,
        dest: ofi::Address,
        comm_id: u32,
        req_idx: ReqIdx,
    ) -> Result<Progress> {
        // Safety: the message lives in the communicator state, which outlives
        // the posted operation; connection messages need no local MR.
        let rc = unsafe {
            self.rails[rail_id]
                .ofi_ep
                .send(msg, len, MrDesc::null(), dest, comm_ctx(comm_id, req_idx))
        };
        match rc {
            Ok(()) => Ok(Progress::Posted),
            Err(errno) if errno.is_again() => Ok(Progress::Backpressure),
            Err(errno) => Err(Error::Fabric(errno)),
        }
    }

    /// Post the next operation(s) of a request.
    pub(crate) fn progress_req(
        &self,
        state: &mut CommState,
        comm_id: u32,
        req_idx: ReqIdx,
    ) -> Result<Progress> {
        enum Op {
            SendData,
            Ctrl,
            EagerCopy,
            Flush,
        }
        let op = match &state.reqs_mut()[req_idx].kind {
            ReqKind::Send(_) => Op::SendData,
            ReqKind::SendCtrl(_) => Op::Ctrl,
            ReqKind::EagerCopy(_) => Op::EagerCopy,
            ReqKind::Flush(_) => Op::Flush,
            kind => {
                return Err(Error::Protocol(format!(
                    "request kind {} cannot be progressed",
                    kind.name()
                )))
            }
        };
        match op {
            Op::SendData => self.post_send_data(state.as_send_mut()?, comm_id, req_idx),
            Op::Ctrl => self.post_ctrl(state.as_recv_mut()?, comm_id, req_idx),
            Op::EagerCopy => self.post_eager_copy(state.as_recv_mut()?, comm_id, req_idx),
            Op::Flush => self.post_flush(state.as_recv_mut()?, comm_id, req_idx),
        }
    }

    fn post_send_data(
        &self,
        st: &mut comm::SendState,
        comm_id: u32,
        req_idx: ReqIdx,
    ) -> Result<Progress> {
        let ctx = comm_ctx(comm_id, req_idx);
        let rails: Vec<comm::CommRail> = st.rails.clone();
        let req = &mut st.reqs[req_idx];
        let data = match &mut req.kind {
            ReqKind::Send(data) => data,
            _ => unreachable!(),
        };
        let schedule = data
            .schedule
            .as_ref()
            .ok_or(Error::Protocol("send request without schedule".into()))?;

        if data.eager {
            let xfer = schedule.xfers[0];
            let comm_rail = rails[xfer.rail_id];
            let rail = &self.rails[xfer.rail_id];
            let desc = data.mr.desc(xfer.rail_id);
            // Safety: the caller registered the buffer and keeps it alive
            // until completion.
            let rc = unsafe {
                rail.ofi_ep.send_with_data(
                    data.buff.add(xfer.offset),
                    xfer.len,
                    desc,
                    data.wdata,
                    comm_rail.remote_addr,
                    ctx,
                )
            };
            return match rc {
                Ok(()) => Ok(Progress::Posted),
                Err(errno) if errno.is_again() => Ok(Progress::Backpressure),
                Err(errno) => Err(Error::Fabric(errno)),
            };
        }

        // Rendezvous: one write per schedule transfer, resuming after
        // backpressure at the first unposted transfer.
        let xfers = schedule.xfers.clone();
        for xfer in xfers.iter().skip(data.xferred_rail_id) {
            let comm_rail = rails[xfer.rail_id];
            let rail = &self.rails[xfer.rail_id];
            let desc = data.mr.desc(xfer.rail_id);
            // Safety: as above; the remote span was announced by the peer's
            // control message.
            let rc = unsafe {
                rail.ofi_ep.write_with_data(
                    data.buff.add(xfer.offset),
                    xfer.len,
                    desc,
                    data.wdata,
                    comm_rail.remote_addr,
                    data.remote_buff + xfer.offset as u64,
                    data.remote_mr_key[xfer.rail_id],
                    ctx,
                )
            };
            match rc {
                Ok(()) => {
                    data.xferred_rail_id += 1;
                    trace!(comm_id, seq = req.msg_seq_num, rail = xfer.rail_id, len = xfer.len, "posted write segment");
                }
                Err(errno) if errno.is_again() => return Ok(Progress::Backpressure),
                Err(errno) => return Err(Error::Fabric(errno)),
            }
        }
        Ok(Progress::Posted)
    }

    fn post_ctrl(
        &self,
        st: &mut comm::RecvState,
        comm_id: u32,
        req_idx: ReqIdx,
    ) -> Result<Progress> {
        let ctx = comm_ctx(comm_id, req_idx);
        let req = &st.reqs[req_idx];
        let data = match &req.kind {
            ReqKind::SendCtrl(data) => data,
            _ => unreachable!(),
        };
        let schedule = data
            .schedule
            .as_ref()
            .ok_or(Error::Protocol("ctrl request without schedule".into()))?;
        let xfer = schedule.xfers[0];
        let slot = data
            .ctrl_slot
            .ok_or(Error::Protocol("ctrl request without slot".into()))?;

        let comm_rail = st.rails[xfer.rail_id];
        let rail = &self.rails[xfer.rail_id];
        let pool = &st.ctrl_pool;
        // Safety: the slot belongs to the communicator's control pool and is
        // registered on this rail.
        let rc = unsafe {
            rail.ofi_ep.send(
                pool.addr(slot),
                CTRL_MSG_SIZE,
                pool.desc(slot, xfer.rail_id),
                comm_rail.remote_addr,
                ctx,
            )
        };
        match rc {
            Ok(()) => Ok(Progress::Posted),
            Err(errno) if errno.is_again() => Ok(Progress::Backpressure),
            Err(errno) => Err(Error::Fabric(errno)),
        }
    }

    fn post_eager_copy(
        &self,
        st: &mut comm::RecvState,
        comm_id: u32,
        req_idx: ReqIdx,
    ) -> Result<Progress> {
        let ctx = comm_ctx(comm_id, req_idx);
        let (recv_req, bounce_idx) = match &st.reqs[req_idx].kind {
            ReqKind::EagerCopy(data) => (data.recv_req, data.bounce_req),
            _ => unreachable!(),
        };
        let (dst_buff, dst_len, dst_desc) = match &st.reqs[recv_req].kind {
            ReqKind::Recv(data) => (data.dst_buff, data.dst_len, data.dst_mr.clone()),
            _ => return Err(Error::Protocol("eager copy without receive parent".into())),
        };

        let rail_id = self.bounce_rail(bounce_idx);
        let (payload, recv_len) = self.bounce_payload(bounce_idx);
        if dst_len < recv_len {
            return Err(Error::Protocol(format!(
                "eager payload of {} bytes exceeds receive buffer of {} bytes",
                recv_len, dst_len
            )));
        }
        let bounce_key = self.bounce_slot_key(bounce_idx, rail_id)?;

        let comm_rail = st.rails[rail_id];
        let local_addr = comm_rail
            .local_addr
            .ok_or(Error::Protocol("receive rail without local address".into()))?;
        let rail = &self.rails[rail_id];
        // Safety: destination is the caller's registered receive buffer; the
        // source is the bounce slot held until this copy completes.
        let rc = unsafe {
            rail.ofi_ep.read(
                dst_buff,
                recv_len,
                dst_desc.desc(rail_id),
                local_addr,
                payload as u64,
                bounce_key,
                ctx,
            )
        };
        match rc {
            Ok(()) => Ok(Progress::Posted),
            Err(errno) if errno.is_again() => Ok(Progress::Backpressure),
            Err(errno) => Err(Error::Fabric(errno)),
        }
    }

    fn post_flush(
        &self,
        st: &mut comm::RecvState,
        comm_id: u32,
        req_idx: ReqIdx,
    ) -> Result<Progress> {
        let ctx = comm_ctx(comm_id, req_idx);
        let req = &st.reqs[req_idx];
        let data = match &req.kind {
            ReqKind::Flush(data) => data,
            _ => unreachable!(),
        };
        let schedule = data
            .schedule
            .as_ref()
            .ok_or(Error::Protocol("flush request without schedule".into()))?;
        let xfer = schedule.xfers[0];

        let flush_buff = st
            .flush_buff
            .as_ref()
            .ok_or(Error::Protocol("flush without flush buffer".into()))?;
        let remote_key = match &data.mr {
            Some(mr) => mr.key(xfer.rail_id)?,
            None => 0,
        };

        let comm_rail = st.rails[xfer.rail_id];
        let local_addr = comm_rail
            .local_addr
            .ok_or(Error::Protocol("receive rail without local address".into()))?;
        let rail = &self.rails[xfer.rail_id];
        // Safety: reads `xfer.len` bytes of the flushed buffer into the
        // dedicated host page; both registrations are alive.
        let rc = unsafe {
            rail.ofi_ep.read(
                flush_buff.host_ptr(),
                xfer.len,
                flush_buff.desc(xfer.rail_id),
                local_addr,
                data.data as u64,
                remote_key,
                ctx,
            )
        };
        match rc {
            Ok(()) => Ok(Progress::Posted),
            Err(errno) if errno.is_again() => Ok(Progress::Backpressure),
            Err(errno) => Err(Error::Fabric(errno)),
        }
    }

    // ---- progress engine ----

    /// Drive one round of progress: drain every rail's CQ and retry pending
    /// posts. All communicator calls do this implicitly; explicit progress
    /// is useful while waiting on a peer without an own operation to drive.
    pub fn progress(&self) -> Result<()> {
        self.process_cq()
    }

    /// Drain every rail's CQ and retry pending posts.
    pub(crate) fn process_cq(&self) -> Result<()> {
        for rail_id in 0..self.rails.len() {
            self.process_cq_rail(rail_id)?;
        }
        self.process_pending()
    }

    /// Drive the CQ only when requests are waiting on backpressure. Returns
    /// true when the network is still busy afterwards.
    pub(crate) fn process_cq_if_pending(&self) -> Result<bool> {
        if self.pending.borrow().is_empty() {
            return Ok(false);
        }
        self.process_cq()?;
        Ok(!self.pending.borrow().is_empty())
    }

    fn process_cq_rail(&self, rail_id: usize) -> Result<()> {
        loop {
            let outcome = {
                let mut scratch = self.cq_scratch.borrow_mut();
                let outcome = self.rails[rail_id]
                    .cq
                    .read(&mut scratch)
                    .map_err(Error::Fabric)?;
                match outcome {
                    CqRead::Entries(n) => {
                        // Copy out so handlers can re-enter the scratch-free
                        // parts of the endpoint.
                        let entries: Vec<CqEntry> = scratch[..n].to_vec();
                        drop(scratch);
                        for entry in entries {
                            self.handle_completion(rail_id, &entry)?;
                        }
                        continue;
                    }
                    CqRead::Empty => None,
                    CqRead::ErrAvailable => Some(()),
                }
            };
            match outcome {
                None => break,
                Some(()) => {
                    if !self.process_err(rail_id)? {
                        // Error entry not delivered yet; try again later.
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn handle_completion(&self, rail_id: usize, entry: &CqEntry) -> Result<()> {
        let flags = entry.flags;

        if flags.contains(CompletionFlags::SEND) {
            self.handle_send_completion(entry)
        } else if flags.contains(CompletionFlags::RECV) {
            self.handle_bounce_recv(rail_id, entry)
        } else if flags.contains(CompletionFlags::REMOTE_WRITE) {
            self.handle_write_arrival(entry)
        } else if flags.contains(CompletionFlags::WRITE) {
            self.handle_write_completion(entry)
        } else if flags.contains(CompletionFlags::READ) {
            self.handle_read_completion(entry)
        } else {
            Err(Error::Protocol(format!(
                "unexpected completion flags {:#x}",
                flags.bits()
            )))
        }
    }

    fn handle_send_completion(&self, entry: &CqEntry) -> Result<()> {
        let (comm_id, req_idx) = match decode_ctx(entry.context) {
            CtxRef::CommReq { comm_id, req_idx } => (comm_id, req_idx),
            CtxRef::Bounce { .. } => {
                return Err(Error::Protocol("send completion on bounce context".into()))
            }
        };
        let comm = self.comm(comm_id)?;
        let mut state = comm.borrow_mut();
        let reqs = state.reqs_mut();

        enum SendKind {
            Conn,
            Ctrl,
            Eager { total: u32 },
        }
        let kind = match &reqs[req_idx].kind {
            ReqKind::SendConn | ReqKind::SendConnResp => SendKind::Conn,
            ReqKind::SendCtrl(_) => SendKind::Ctrl,
            ReqKind::Send(data) => {
                debug_assert!(data.eager);
                SendKind::Eager {
                    total: data.total_num_compls,
                }
            }
            kind => {
                return Err(Error::Protocol(format!(
                    "send completion on {} request",
                    kind.name()
                )))
            }
        };
        match kind {
            SendKind::Conn => {
                inc_req_completion(reqs, req_idx, entry.len, 1);
            }
            SendKind::Ctrl => {
                set_send_ctrl_completed(reqs, req_idx);
            }
            SendKind::Eager { total } => {
                inc_req_completion(reqs, req_idx, 0, total);
            }
        }
        Ok(())
    }

    fn handle_bounce_recv(&self, rail_id: usize, entry: &CqEntry) -> Result<()> {
        let bounce_idx = match decode_ctx(entry.context) {
            CtxRef::Bounce { idx } => idx,
            CtxRef::CommReq { .. } => {
                return Err(Error::Protocol(
                    "receive completion on non-bounce context".into(),
                ))
            }
        };
        self.bounce_reqs.borrow_mut()[bounce_idx].recv_len = entry.len;

        if entry.flags.contains(CompletionFlags::REMOTE_CQ_DATA) {
            // Eager payload: target message identified by the immediate.
            let comm_id = comm_id_from_imm(entry.data);
            let seq = seq_from_imm(entry.data);
            trace!(comm_id, seq, rail_id, len = entry.len, "eager arrival");
            return self.handle_eager_recv(comm_id, seq, bounce_idx);
        }

        let (payload, _) = self.bounce_payload(bounce_idx);
        // Safety: the fabric delivered at least the two-byte discriminant.
        let msg_type = unsafe { peek_msg_type(payload) };
        match msg_type {
            Some(MsgType::Conn) => self.handle_conn_recv(bounce_idx, entry.len),
            Some(MsgType::ConnResp) => self.handle_conn_resp_recv(bounce_idx, entry.len),
            Some(MsgType::Ctrl) => self.handle_ctrl_recv(bounce_idx, entry.len),
            _ => Err(Error::Protocol("unsolicited message of unknown type".into())),
        }
    }

    fn handle_conn_recv(&self, bounce_idx: usize, len: usize) -> Result<()> {
        if len != CONN_MSG_SIZE {
            return Err(Error::Protocol("truncated connect message".into()));
        }
        let msg = self.bounce_conn_msg(bounce_idx);
        let comm = self.comm(msg.remote_comm_id)?;
        {
            let mut state = comm.borrow_mut();
            let l_comm = state.as_listen_mut()?;
            let conn_req = l_comm.conn_req;
            l_comm.conn_msg = msg;
            l_comm.conn_msg_valid = true;
            inc_req_completion(&mut l_comm.reqs, conn_req, len, 1);
        }
        self.repost_bounce(bounce_idx)
    }

    fn handle_conn_resp_recv(&self, bounce_idx: usize, len: usize) -> Result<()> {
        if len != CONN_MSG_SIZE {
            return Err(Error::Protocol("truncated connect response".into()));
        }
        let msg = self.bounce_conn_msg(bounce_idx);
        let comm = self.comm(msg.remote_comm_id)?;
        {
            let mut state = comm.borrow_mut();
            let st = state.as_send_mut()?;
            let resp_req = st
                .conn_resp_req
                .ok_or(Error::Protocol("connect response without request".into()))?;
            st.conn_msg = msg;
            inc_req_completion(&mut st.reqs, resp_req, len, 1);
            comm::finish_connect(self, st)?;
        }
        self.repost_bounce(bounce_idx)
    }

    fn handle_ctrl_recv(&self, bounce_idx: usize, len: usize) -> Result<()> {
        if len != CTRL_MSG_SIZE {
            return Err(Error::Protocol("truncated control message".into()));
        }
        let ctrl = self.bounce_ctrl_msg(bounce_idx);
        let seq = ctrl.msg_seq_num;
        let comm_id = ctrl.remote_comm_id;
        let comm = self.comm(comm_id)?;

        let matched_req = {
            let mut state = comm.borrow_mut();
            let st = state.as_send_mut()?;
            match st.msgbuff.insert(seq, Elem::buff(bounce_idx)) {
                InsertResult::Inserted => None,
                InsertResult::Occupied(SlotStatus::InProgress) => {
                    let (elem, _) = st.msgbuff.retrieve(seq);
                    match elem {
                        Some(Elem {
                            kind: ElemType::Req,
                            idx,
                        }) => Some(idx),
                        _ => {
                            return Err(Error::Protocol(format!(
                                "control message for message {} did not match a request",
                                seq
                            )))
                        }
                    }
                }
                InsertResult::Occupied(status) => {
                    return Err(Error::Protocol(format!(
                        "control message for message {} in state {:?}",
                        seq, status
                    )))
                }
            }
        };

        let Some(req_idx) = matched_req else {
            // Stored for the upcoming send; the payload now belongs to the
            // message buffer.
            return self.decrease_bounce_cnt(self.bounce_rail(bounce_idx));
        };

        {
            let mut state = comm.borrow_mut();
            let st = state.as_send_mut()?;
            let (eager, total) = {
                let req = &mut st.reqs[req_idx];
                let data = match &mut req.kind {
                    ReqKind::Send(data) => data,
                    _ => return Err(Error::Protocol("ctrl matched non-send request".into())),
                };
                data.remote_buff = ctrl.buff_addr;
                data.remote_len = ctrl.buff_len;
                data.remote_mr_key = ctrl.buff_mr_key;
                (data.eager, data.total_num_compls)
            };

            if !eager {
                let buff_len = match &st.reqs[req_idx].kind {
                    ReqKind::Send(data) => data.buff_len,
                    _ => unreachable!(),
                };
                if buff_len as u64 > ctrl.buff_len {
                    warn!(
                        send = buff_len,
                        recv = ctrl.buff_len,
                        "remote receive buffer smaller than send"
                    );
                    set_req_error(&mut st.reqs, req_idx);
                    // The failure surfaces on the caller's next test.
                    return Ok(());
                }
                match self.post_send_data(st, comm_id, req_idx)? {
                    Progress::Posted => {}
                    Progress::Backpressure => {
                        let req = &mut st.reqs[req_idx];
                        if !req.in_pending {
                            req.in_pending = true;
                            self.pending
                                .borrow_mut()
                                .push_back(PendingEntry::CommReq { comm_id, req_idx });
                        }
                    }
                }
            }

            inc_req_completion(&mut st.reqs, req_idx, 0, total);
        }

        self.repost_bounce(bounce_idx)
    }

    fn handle_eager_recv(&self, comm_id: u32, seq: u16, bounce_idx: usize) -> Result<()> {
        // The payload leaves the posted set now; it is reposted (or
        // released) once consumed.
        self.decrease_bounce_cnt(self.bounce_rail(bounce_idx))?;

        let comm = self.comm(comm_id)?;
        let mut state = comm.borrow_mut();
        let st = state.as_recv_mut()?;

        let recv_req = match st.msgbuff.insert(seq, Elem::buff(bounce_idx)) {
            InsertResult::Inserted => {
                // Receiver has not posted yet; the eager copy starts from
                // the matching recv call.
                return Ok(());
            }
            InsertResult::Occupied(SlotStatus::InProgress) => {
                let (elem, _) = st.msgbuff.retrieve(seq);
                match elem {
                    Some(Elem {
                        kind: ElemType::Req,
                        idx,
                    }) => idx,
                    _ => {
                        return Err(Error::Protocol(format!(
                            "eager payload for message {} did not match a request",
                            seq
                        )))
                    }
                }
            }
            InsertResult::Occupied(status) => {
                return Err(Error::Protocol(format!(
                    "eager payload for message {} in state {:?}",
                    seq, status
                )))
            }
        };

        let recv_len = self.bounce_recv_len(bounce_idx);
        if recv_len == 0 {
            // Nothing to copy; the payload can go straight back.
            self.check_post_bounce_req(bounce_idx)?;
            let total = match &st.reqs[recv_req].kind {
                ReqKind::Recv(data) => data.total_num_compls,
                _ => return Err(Error::Protocol("eager matched non-receive request".into())),
            };
            inc_req_completion(&mut st.reqs, recv_req, 0, total);
            return Ok(());
        }

        let copy_idx = comm::alloc_eager_copy_req(st, recv_req, bounce_idx)?;
        match self.post_eager_copy(st, comm_id, copy_idx)? {
            Progress::Posted => Ok(()),
            Progress::Backpressure => {
                let req = &mut st.reqs[copy_idx];
                if !req.in_pending {
                    req.in_pending = true;
                    self.pending
                        .borrow_mut()
                        .push_back(PendingEntry::CommReq {
                            comm_id,
                            req_idx: copy_idx,
                        });
                }
                Ok(())
            }
        }
    }

    /// A remote-initiated write landed: account the segment against its
    /// receive request.
    fn handle_write_arrival(&self, entry: &CqEntry) -> Result<()> {
        let comm_id = comm_id_from_imm(entry.data);
        let seq = seq_from_imm(entry.data);
        let total_segms = num_seg_from_imm(entry.data);

        let comm = self.comm(comm_id)?;
        let mut state = comm.borrow_mut();
        let st = state.as_recv_mut()?;

        let recv_req = match st.msgbuff.retrieve(seq) {
            (
                Some(Elem {
                    kind: ElemType::Req,
                    idx,
                }),
                SlotStatus::InProgress,
            ) => idx,
            (_, status) => {
                return Err(Error::Protocol(format!(
                    "write arrival for message {} in state {:?}",
                    seq, status
                )))
            }
        };
        let segms_req = match &st.reqs[recv_req].kind {
            ReqKind::Recv(data) => data.recv_segms_req,
            _ => return Err(Error::Protocol("write arrival on non-receive request".into())),
        };
        inc_recv_seg_completion(&mut st.reqs, segms_req, entry.len, total_segms);
        Ok(())
    }

    fn handle_write_completion(&self, entry: &CqEntry) -> Result<()> {
        let (comm_id, req_idx) = match decode_ctx(entry.context) {
            CtxRef::CommReq { comm_id, req_idx } => (comm_id, req_idx),
            CtxRef::Bounce { .. } => {
                return Err(Error::Protocol("write completion on bounce context".into()))
            }
        };
        let comm = self.comm(comm_id)?;
        let mut state = comm.borrow_mut();
        let reqs = state.reqs_mut();
        let total = match &reqs[req_idx].kind {
            ReqKind::Send(data) => data.total_num_compls,
            kind => {
                return Err(Error::Protocol(format!(
                    "write completion on {} request",
                    kind.name()
                )))
            }
        };
        inc_req_completion(reqs, req_idx, 0, total);
        Ok(())
    }

    fn handle_read_completion(&self, entry: &CqEntry) -> Result<()> {
        let (comm_id, req_idx) = match decode_ctx(entry.context) {
            CtxRef::CommReq { comm_id, req_idx } => (comm_id, req_idx),
            CtxRef::Bounce { .. } => {
                return Err(Error::Protocol("read completion on bounce context".into()))
            }
        };
        let comm = self.comm(comm_id)?;
        let mut state = comm.borrow_mut();

        enum ReadKind {
            Flush { total: u32 },
            EagerCopy { bounce_idx: usize },
        }
        let read_kind = {
            let reqs = state.reqs_mut();
            match &reqs[req_idx].kind {
                ReqKind::Flush(data) => ReadKind::Flush {
                    total: data
                        .schedule
                        .as_ref()
                        .map(|s| s.xfers.len() as u32)
                        .unwrap_or(1),
                },
                ReqKind::EagerCopy(data) => ReadKind::EagerCopy {
                    bounce_idx: data.bounce_req,
                },
                kind => {
                    return Err(Error::Protocol(format!(
                        "read completion on {} request",
                        kind.name()
                    )))
                }
            }
        };

        match read_kind {
            ReadKind::Flush { total } => {
                inc_req_completion(state.reqs_mut(), req_idx, 0, total);
            }
            ReadKind::EagerCopy { bounce_idx } => {
                let size = self.bounce_recv_len(bounce_idx);
                self.check_post_bounce_req(bounce_idx)?;
                set_eager_copy_completed(state.reqs_mut(), req_idx, size);
            }
        }
        Ok(())
    }

    /// Drain one entry from the rail's error queue. `Ok(false)` means the
    /// error entry was not delivered yet.
    fn process_err(&self, rail_id: usize) -> Result<bool> {
        let err = match self.rails[rail_id].cq.read_err().map_err(Error::Fabric)? {
            Some(err) => err,
            None => return Ok(false),
        };

        warn!(
            rail = rail_id,
            err = %err.err,
            detail = %self.rails[rail_id].cq.err_string(err.prov_errno),
            len = err.len,
            "operation completed with error"
        );

        if err.flags.contains(CompletionFlags::REMOTE_WRITE) {
            // Identify the target receive request through the immediate.
            let comm_id = comm_id_from_imm(err.data);
            let seq = seq_from_imm(err.data);
            let comm = self.comm(comm_id)?;
            let mut state = comm.borrow_mut();
            let st = state.as_recv_mut()?;
            if let (
                Some(Elem {
                    kind: ElemType::Req,
                    idx,
                }),
                _,
            ) = st.msgbuff.retrieve(seq)
            {
                set_req_error(&mut st.reqs, idx);
            }
        } else {
            match decode_ctx(err.context) {
                CtxRef::Bounce { .. } => {
                    // The protocol cannot recover from losing a posted
                    // bounce receive.
                    return Err(Error::Protocol(
                        "bounce buffer receive completed with error".into(),
                    ));
                }
                CtxRef::CommReq { comm_id, req_idx } => {
                    let comm = self.comm(comm_id)?;
                    let mut state = comm.borrow_mut();
                    set_req_error(state.reqs_mut(), req_idx);
                }
            }
        }

        Err(Error::Fabric(err.err))
    }

    /// Retry pending posts front to back, stopping at the first renewed
    /// backpressure.
    fn process_pending(&self) -> Result<()> {
        loop {
            let entry = match self.pending.borrow_mut().pop_front() {
                Some(entry) => entry,
                None => return Ok(()),
            };

            match entry {
                PendingEntry::Bounce { idx } => {
                    self.bounce_reqs.borrow_mut()[idx].in_pending = false;
                    match self.post_bounce(idx) {
                        Ok(()) => {}
                        Err(errno) if errno.is_again() => {
                            self.bounce_reqs.borrow_mut()[idx].in_pending = true;
                            self.pending
                                .borrow_mut()
                                .push_front(PendingEntry::Bounce { idx });
                            return Ok(());
                        }
                        Err(errno) => return Err(Error::Fabric(errno)),
                    }
                }
                PendingEntry::CommReq { comm_id, req_idx } => {
                    let comm = self.comm(comm_id)?;
                    let mut state = comm.borrow_mut();
                    state.reqs_mut()[req_idx].in_pending = false;
                    match self.progress_req(&mut state, comm_id, req_idx)? {
                        Progress::Posted => {}
                        Progress::Backpressure => {
                            state.reqs_mut()[req_idx].in_pending = true;
                            self.pending
                                .borrow_mut()
                                .push_front(PendingEntry::CommReq { comm_id, req_idx });
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}
