//! Communicators: handshake, send/receive protocol, flush and completion.
//!
//! A listen communicator waits for one CONN message; accepting it builds a
//! receive communicator bound to all rails and answers with CONN_RESP. The
//! connecting side builds a send communicator on its first rail, posts CONN,
//! and finalizes the remaining rails when CONN_RESP arrives. Both `connect`
//! and `accept` are non-blocking stage machines: each call drives the CQ,
//! advances as far as it can, and returns `None` when it must be called
//! again.
//!
//! Data transfer is rendezvous by default — the receiver announces its
//! buffer in a CTRL message, the sender stripes RDMA writes across the rails
//! — with an eager path for small messages that travels through the
//! receiver's bounce buffers.

use std::rc::Rc;

use slab::Slab;
use tracing::{debug, warn};

use libfabric::EpName;

use crate::device::{gdr_support, GdrSupport};
use crate::endpoint::{Endpoint, Progress};
use crate::error::{Error, Result};
use crate::mr::{BufferType, MrHandle};
use crate::msgbuff::{Elem, ElemType, InsertResult, MsgBuff, SlotStatus};
use crate::pool::{page_size, MmapRegion, RegisteredPool};
use crate::request::{
    alloc_req, inc_req_completion, EagerCopyData, FlushData, RecvData, RecvSegmsData, Req, ReqIdx,
    ReqKind, ReqState, SendCtrlData, SendData, MAX_REQUESTS, MAX_SEND_REQUESTS,
};
use crate::scheduler::Schedule;
use crate::wire::{
    rdma_write_imm, ConnMsg, CtrlMsg, MsgType, CONN_MSG_SIZE, CTRL_MSG_SIZE, MAX_COMMS, MAX_RAILS,
    SEQ_RANGE,
};

/// Window width of the per-communicator message buffer.
const MSGBUFF_SIZE: u16 = 256;

/// Receive-side request pool: each receive owns up to three helper requests.
const RECV_REQ_POOL: usize = 4 * MAX_REQUESTS;

/// Bytes read by the flush operation.
pub(crate) const FLUSH_SIZE: usize = 4;

/// Control-message slots added per pool growth.
const CTRL_SLOTS_PER_CHUNK: usize = 8;

/// Maximum entries of the grouped-receive API. The RDMA transport posts a
/// single receive per call.
pub const MAX_RECVS: usize = 1;

/// Connection-establishment stage, identical on both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CommStage {
    CreateStart,
    SendConn,
    ConnReqPending,
    RecvConn,
    ConnRespReqPending,
    Connected,
}

/// One rail binding of a communicator.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CommRail {
    pub(crate) rail_id: usize,
    pub(crate) remote_addr: libfabric::Address,
    /// Own address on this rail; receive communicators loop flush and eager
    /// reads through it.
    pub(crate) local_addr: Option<libfabric::Address>,
}

/// The host page flush reads land in.
pub(crate) struct FlushBuffer {
    mr: Option<Rc<MrHandle>>,
    region: MmapRegion,
    pub(crate) size: usize,
}

impl FlushBuffer {
    fn alloc(ep: &Endpoint) -> Result<Self> {
        let region = MmapRegion::alloc(page_size())?;
        let mr = if ep.device().needs_local_mr {
            Some(ep.register_internal(region.as_ptr(), region.len())?)
        } else {
            None
        };
        Ok(Self {
            mr,
            region,
            size: FLUSH_SIZE,
        })
    }

    pub(crate) fn host_ptr(&self) -> *mut u8 {
        self.region.as_ptr()
    }

    pub(crate) fn desc(&self, rail_id: usize) -> libfabric::MrDesc {
        match &self.mr {
            Some(mr) => mr.desc(rail_id),
            None => libfabric::MrDesc::null(),
        }
    }
}

/// State of a listen communicator.
pub(crate) struct ListenState {
    pub(crate) comm_id: u32,
    pub(crate) stage: CommStage,
    /// Scratch connection message: filled by the CONN arrival, then rewritten
    /// into the CONN_RESP sent back.
    pub(crate) conn_msg: ConnMsg,
    pub(crate) conn_msg_valid: bool,
    pub(crate) reqs: Slab<Req>,
    /// The one request of this communicator, recycled from RECV_CONN into
    /// SEND_CONN_RESP.
    pub(crate) conn_req: ReqIdx,
    /// Half-built receive communicator between CONN arrival and handover.
    pub(crate) r_comm: Option<RecvComm>,
}

/// State of a send communicator.
pub(crate) struct SendState {
    pub(crate) local_comm_id: u32,
    pub(crate) remote_comm_id: u32,
    pub(crate) rails: Vec<CommRail>,
    pub(crate) num_init_rails: usize,
    pub(crate) reqs: Slab<Req>,
    pub(crate) msgbuff: MsgBuff,
    /// CONN message sent during the handshake; overwritten by the received
    /// CONN_RESP.
    pub(crate) conn_msg: ConnMsg,
    pub(crate) connected: bool,
    pub(crate) next_seq: u16,
    pub(crate) num_inflight: usize,
    pub(crate) conn_resp_req: Option<ReqIdx>,
}

/// State of a receive communicator.
pub(crate) struct RecvState {
    pub(crate) local_comm_id: u32,
    pub(crate) remote_comm_id: u32,
    pub(crate) rails: Vec<CommRail>,
    pub(crate) reqs: Slab<Req>,
    pub(crate) msgbuff: MsgBuff,
    pub(crate) next_seq: u16,
    pub(crate) num_inflight: usize,
    pub(crate) ctrl_pool: RegisteredPool,
    pub(crate) flush_buff: Option<FlushBuffer>,
}

/// Any communicator, as stored in the endpoint's table.
pub(crate) enum CommState {
    Listen(ListenState),
    Send(SendState),
    Recv(RecvState),
}

impl CommState {
    pub(crate) fn reqs(&self) -> &Slab<Req> {
        match self {
            CommState::Listen(st) => &st.reqs,
            CommState::Send(st) => &st.reqs,
            CommState::Recv(st) => &st.reqs,
        }
    }

    pub(crate) fn reqs_mut(&mut self) -> &mut Slab<Req> {
        match self {
            CommState::Listen(st) => &mut st.reqs,
            CommState::Send(st) => &mut st.reqs,
            CommState::Recv(st) => &mut st.reqs,
        }
    }

    pub(crate) fn as_listen_mut(&mut self) -> Result<&mut ListenState> {
        match self {
            CommState::Listen(st) => Ok(st),
            _ => Err(Error::Protocol("expected a listen communicator".into())),
        }
    }

    pub(crate) fn as_send_mut(&mut self) -> Result<&mut SendState> {
        match self {
            CommState::Send(st) => Ok(st),
            _ => Err(Error::Protocol("expected a send communicator".into())),
        }
    }

    pub(crate) fn as_recv_mut(&mut self) -> Result<&mut RecvState> {
        match self {
            CommState::Recv(st) => Ok(st),
            _ => Err(Error::Protocol("expected a receive communicator".into())),
        }
    }
}

/// Out-of-band connection handle produced by [`listen`].
///
/// The first two fields travel to the connecting peer; `state` is local
/// bookkeeping for the non-blocking connect.
pub struct ConnHandle {
    pub ep_name: EpName,
    pub comm_id: u32,
    state: ConnectState,
}

#[derive(Default)]
struct ConnectState {
    stage: Option<CommStage>,
    comm: Option<SendComm>,
    req: Option<ReqIdx>,
}

/// Serialized size of the peer-visible part of a handle.
pub const HANDLE_SIZE: usize = libfabric::MAX_EP_NAME + 4;

impl ConnHandle {
    /// Bytes to ship to the connecting peer.
    pub fn to_bytes(&self) -> [u8; HANDLE_SIZE] {
        let mut bytes = [0u8; HANDLE_SIZE];
        bytes[..libfabric::MAX_EP_NAME].copy_from_slice(self.ep_name.as_bytes());
        bytes[libfabric::MAX_EP_NAME..].copy_from_slice(&self.comm_id.to_ne_bytes());
        bytes
    }

    /// Rebuild a handle on the connecting side.
    pub fn from_bytes(bytes: &[u8; HANDLE_SIZE]) -> Self {
        let mut name = [0u8; libfabric::MAX_EP_NAME];
        name.copy_from_slice(&bytes[..libfabric::MAX_EP_NAME]);
        let mut id = [0u8; 4];
        id.copy_from_slice(&bytes[libfabric::MAX_EP_NAME..]);
        Self {
            ep_name: EpName::from_bytes(name),
            comm_id: u32::from_ne_bytes(id),
            state: ConnectState::default(),
        }
    }
}

/// A passive communicator accepting one connection.
pub struct ListenComm {
    ep: Rc<Endpoint>,
    id: u32,
    state: Rc<std::cell::RefCell<CommState>>,
}

/// The sending end of a connection.
#[derive(Clone)]
pub struct SendComm {
    ep: Rc<Endpoint>,
    id: u32,
    state: Rc<std::cell::RefCell<CommState>>,
}

/// The receiving end of a connection.
pub struct RecvComm {
    ep: Rc<Endpoint>,
    id: u32,
    state: Rc<std::cell::RefCell<CommState>>,
}

/// One entry of the receive/flush APIs.
pub struct RecvBuffer {
    pub data: *mut u8,
    pub size: usize,
    pub tag: i32,
    pub mr: Rc<MrHandle>,
}

/// Handle to an in-flight send, receive or flush.
pub struct Request {
    ep: Rc<Endpoint>,
    comm_id: u32,
    req_idx: ReqIdx,
}

fn prepare_conn_msg(
    ep: &Endpoint,
    msg_type: MsgType,
    local_comm_id: u32,
    remote_comm_id: u32,
) -> ConnMsg {
    let num_rails = ep.num_rails();
    let mut msg = ConnMsg::new(msg_type, local_comm_id, remote_comm_id, num_rails as u16);
    for rail_id in 0..num_rails {
        msg.ep_names[rail_id].name = *ep.rail(rail_id).local_name.as_bytes();
    }
    msg
}

/// Open a listen communicator and the handle naming it.
pub fn listen(ep: &Rc<Endpoint>) -> Result<(ConnHandle, ListenComm)> {
    let mut reqs = Slab::new();
    let mut conn_req = Req::new(ReqKind::RecvConn, 0);
    conn_req.state = ReqState::Pending;
    let conn_req = reqs.insert(conn_req);

    let state = CommState::Listen(ListenState {
        comm_id: 0,
        stage: CommStage::CreateStart,
        conn_msg: ConnMsg::new(MsgType::Conn, 0, 0, 0),
        conn_msg_valid: false,
        reqs,
        conn_req,
        r_comm: None,
    });
    let (id, rc) = ep.insert_comm(state)?;
    rc.borrow_mut().as_listen_mut()?.comm_id = id;
    ep.ref_inc();

    debug!(comm = id, "listening");
    let handle = ConnHandle {
        ep_name: ep.rail(0).local_name,
        comm_id: id,
        state: ConnectState::default(),
    };
    Ok((
        handle,
        ListenComm {
            ep: ep.clone(),
            id,
            state: rc,
        },
    ))
}

fn create_send_comm(ep: &Rc<Endpoint>, handle: &ConnHandle) -> Result<SendComm> {
    if (handle.comm_id as usize) >= MAX_COMMS {
        return Err(Error::InvalidArgument("handle carries an invalid comm id"));
    }

    let remote_addr = ep
        .rail(0)
        .av
        .insert(&handle.ep_name)
        .map_err(Error::Fabric)?;

    let state = CommState::Send(SendState {
        local_comm_id: 0,
        remote_comm_id: handle.comm_id,
        rails: vec![CommRail {
            rail_id: 0,
            remote_addr,
            local_addr: None,
        }],
        num_init_rails: 1,
        reqs: Slab::new(),
        msgbuff: MsgBuff::new(MSGBUFF_SIZE),
        conn_msg: ConnMsg::new(MsgType::Conn, 0, 0, 0),
        connected: false,
        next_seq: 0,
        num_inflight: 0,
        conn_resp_req: None,
    });
    let (id, rc) = ep.insert_comm(state)?;
    {
        let mut st = rc.borrow_mut();
        let st = st.as_send_mut()?;
        st.local_comm_id = id;
        st.conn_msg = prepare_conn_msg(ep, MsgType::Conn, id, handle.comm_id);
    }
    ep.ref_inc();

    Ok(SendComm {
        ep: ep.clone(),
        id,
        state: rc,
    })
}

/// Finalize a send communicator once its CONN_RESP arrived: bind the
/// remaining rails and flip `connected`.
pub(crate) fn finish_connect(ep: &Endpoint, st: &mut SendState) -> Result<()> {
    let resp_req = st
        .conn_resp_req
        .ok_or(Error::Protocol("connect finish without response request".into()))?;
    if st.reqs[resp_req].state != ReqState::Completed {
        return Err(Error::Protocol(
            "connect response request not completed".into(),
        ));
    }

    let resp = st.conn_msg;
    if resp.num_rails as usize != ep.num_rails() {
        return Err(Error::Protocol(format!(
            "peer reports {} rails, expected {}",
            resp.num_rails,
            ep.num_rails()
        )));
    }
    if (resp.local_comm_id as usize) >= MAX_COMMS {
        return Err(Error::Protocol("peer sent an invalid comm id".into()));
    }
    st.remote_comm_id = resp.local_comm_id;

    for rail_id in st.num_init_rails..ep.num_rails() {
        let name = EpName::from_bytes(resp.ep_names[rail_id].name);
        let remote_addr = ep.rail(rail_id).av.insert(&name).map_err(Error::Fabric)?;
        st.rails.push(CommRail {
            rail_id,
            remote_addr,
            local_addr: None,
        });
    }
    st.num_init_rails = st.rails.len();

    st.reqs.remove(resp_req);
    st.conn_resp_req = None;

    // Publish the rail bindings before the connected flag.
    std::sync::atomic::compiler_fence(std::sync::atomic::Ordering::SeqCst);
    st.connected = true;
    debug!(comm = st.local_comm_id, peer = st.remote_comm_id, "connected");
    Ok(())
}

/// Drive the connecting side. Returns the send communicator once the CONN
/// message is on the wire; `None` means call again.
pub fn connect(ep: &Rc<Endpoint>, handle: &mut ConnHandle) -> Result<Option<SendComm>> {
    let mut stage = handle.state.stage.unwrap_or(CommStage::CreateStart);

    if stage == CommStage::Connected {
        return Err(Error::InvalidArgument("handle already has a connection"));
    }

    if stage == CommStage::CreateStart {
        let s_comm = create_send_comm(ep, handle)?;
        let req_idx = {
            let mut state = s_comm.state.borrow_mut();
            let st = state.as_send_mut()?;
            alloc_req(
                &mut st.reqs,
                MAX_SEND_REQUESTS,
                Req::new(ReqKind::SendConn, 0),
            )?
        };
        handle.state.comm = Some(s_comm);
        handle.state.req = Some(req_idx);
        stage = CommStage::SendConn;
        handle.state.stage = Some(stage);
    }

    let s_comm = handle
        .state
        .comm
        .as_ref()
        .ok_or(Error::Protocol("connect handle lost its communicator".into()))?
        .clone();

    if stage == CommStage::SendConn {
        let req_idx = handle.state.req.unwrap();
        let progress = {
            let mut state = s_comm.state.borrow_mut();
            let st = state.as_send_mut()?;
            if st.conn_resp_req.is_none() {
                st.conn_resp_req = Some(alloc_req(
                    &mut st.reqs,
                    MAX_SEND_REQUESTS,
                    Req::new(ReqKind::RecvConnResp, 0),
                )?);
            }
            let msg = &st.conn_msg as *const ConnMsg as *const u8;
            let dest = st.rails[0].remote_addr;
            ep.post_conn_msg(0, msg, CONN_MSG_SIZE, dest, s_comm.id, req_idx)?
        };
        match progress {
            Progress::Posted => {}
            Progress::Backpressure => {
                // Make room and let the caller retry this stage.
                ep.process_cq()?;
                return Ok(None);
            }
        }
        stage = CommStage::ConnReqPending;
        handle.state.stage = Some(stage);
    }

    if stage == CommStage::ConnReqPending {
        ep.process_cq()?;
        let sent = {
            let state = s_comm.state.borrow();
            state.reqs()[handle.state.req.unwrap()].state == ReqState::Completed
        };
        if !sent {
            return Ok(None);
        }
        {
            let mut state = s_comm.state.borrow_mut();
            state.reqs_mut().remove(handle.state.req.take().unwrap());
        }
        stage = CommStage::RecvConn;
        handle.state.stage = Some(stage);
    }

    if stage == CommStage::RecvConn {
        // The CONN_RESP lands in a bounce buffer; one drain may already
        // finalize the connection.
        ep.process_cq()?;
        handle.state.stage = Some(CommStage::ConnRespReqPending);
        return Ok(Some(s_comm));
    }

    Err(Error::InvalidArgument("invalid connect stage"))
}

fn prepare_recv_comm(ep: &Rc<Endpoint>, conn_msg: &ConnMsg) -> Result<RecvComm> {
    let num_rails = ep.num_rails();
    if (conn_msg.local_comm_id as usize) >= MAX_COMMS {
        return Err(Error::Protocol("peer sent an invalid comm id".into()));
    }

    let mut rails = Vec::with_capacity(num_rails);
    for rail_id in 0..num_rails {
        let rail = ep.rail(rail_id);
        let remote_name = EpName::from_bytes(conn_msg.ep_names[rail_id].name);
        let remote_addr = rail.av.insert(&remote_name).map_err(Error::Fabric)?;
        let local_addr = rail.av.insert(&rail.local_name).map_err(Error::Fabric)?;
        rails.push(CommRail {
            rail_id,
            remote_addr,
            local_addr: Some(local_addr),
        });
    }

    let flush_buff = if !ep.device().config.gdr_flush_disable
        && gdr_support() == GdrSupport::Supported
    {
        Some(FlushBuffer::alloc(ep)?)
    } else {
        None
    };

    let state = CommState::Recv(RecvState {
        local_comm_id: 0,
        remote_comm_id: conn_msg.local_comm_id,
        rails,
        reqs: Slab::new(),
        msgbuff: MsgBuff::new(MSGBUFF_SIZE),
        next_seq: 0,
        num_inflight: 0,
        ctrl_pool: RegisteredPool::new(CTRL_MSG_SIZE.next_multiple_of(128), CTRL_SLOTS_PER_CHUNK),
        flush_buff,
    });
    let (id, rc) = ep.insert_comm(state)?;
    rc.borrow_mut().as_recv_mut()?.local_comm_id = id;
    ep.ref_inc();

    Ok(RecvComm {
        ep: ep.clone(),
        id,
        state: rc,
    })
}

impl ListenComm {
    /// Drive the accepting side. Returns the receive communicator once the
    /// CONN_RESP send completed; `None` means call again.
    pub fn accept(&self) -> Result<Option<RecvComm>> {
        let mut stage = {
            let mut state = self.state.borrow_mut();
            let st = state.as_listen_mut()?;
            if st.stage == CommStage::Connected {
                return Err(Error::InvalidArgument(
                    "listen communicator already accepted a connection",
                ));
            }
            if st.stage == CommStage::CreateStart || st.stage == CommStage::SendConn {
                st.stage = CommStage::ConnReqPending;
            }
            st.stage
        };

        if stage == CommStage::ConnReqPending {
            self.ep.process_cq()?;

            let conn_msg = {
                let mut state = self.state.borrow_mut();
                let st = state.as_listen_mut()?;
                if st.reqs[st.conn_req].state != ReqState::Completed || !st.conn_msg_valid {
                    return Ok(None);
                }
                if st.conn_msg.num_rails as usize != self.ep.num_rails() {
                    return Err(Error::Protocol(format!(
                        "peer reports {} rails, expected {}",
                        st.conn_msg.num_rails,
                        self.ep.num_rails()
                    )));
                }
                st.conn_msg
            };

            let r_comm = prepare_recv_comm(&self.ep, &conn_msg)?;
            {
                let mut state = self.state.borrow_mut();
                let st = state.as_listen_mut()?;

                // Rewrite the scratch message into the response and recycle
                // the request for the CONN_RESP send.
                let mut resp =
                    prepare_conn_msg(&self.ep, MsgType::ConnResp, r_comm.id, conn_msg.local_comm_id);
                resp.remote_comm_id = conn_msg.local_comm_id;
                st.conn_msg = resp;

                let req = &mut st.reqs[st.conn_req];
                req.kind = ReqKind::SendConnResp;
                req.state = ReqState::Created;
                req.ncompls = 0;
                req.size = 0;

                st.r_comm = Some(r_comm);
                st.stage = CommStage::RecvConn;
            }
            stage = CommStage::RecvConn;
        }

        if stage == CommStage::RecvConn {
            let progress = {
                let mut state = self.state.borrow_mut();
                let st = state.as_listen_mut()?;
                let dest = {
                    let r_comm = st.r_comm.as_ref().unwrap();
                    let r_state = r_comm.state.borrow();
                    match &*r_state {
                        CommState::Recv(rs) => rs.rails[0].remote_addr,
                        _ => unreachable!(),
                    }
                };
                let msg = &st.conn_msg as *const ConnMsg as *const u8;
                let req_idx = st.conn_req;
                st.reqs[req_idx].state = ReqState::Pending;
                let progress =
                    self.ep
                        .post_conn_msg(0, msg, CONN_MSG_SIZE, dest, st.comm_id, req_idx)?;
                if progress == Progress::Backpressure {
                    st.reqs[req_idx].state = ReqState::Created;
                }
                progress
            };
            match progress {
                Progress::Posted => {}
                Progress::Backpressure => {
                    self.ep.process_cq()?;
                    return Ok(None);
                }
            }
            let mut state = self.state.borrow_mut();
            state.as_listen_mut()?.stage = CommStage::ConnRespReqPending;
            stage = CommStage::ConnRespReqPending;
        }

        if stage == CommStage::ConnRespReqPending {
            self.ep.process_cq()?;
            let mut state = self.state.borrow_mut();
            let st = state.as_listen_mut()?;
            if st.reqs[st.conn_req].state != ReqState::Completed {
                return Ok(None);
            }
            let r_comm = st.r_comm.take();
            st.stage = CommStage::Connected;
            return Ok(r_comm);
        }

        Err(Error::InvalidArgument("invalid accept stage"))
    }

    /// Close the listen communicator. Refuses while the connect request is
    /// still posted.
    pub fn close(self) -> Result<()> {
        {
            let mut state = self.state.borrow_mut();
            let st = state.as_listen_mut()?;
            if st.reqs[st.conn_req].state == ReqState::Pending {
                warn!(comm = self.id, "closing listen communicator with posted request");
                return Err(Error::InvalidArgument(
                    "listen request still pending",
                ));
            }
            if let Some(r_comm) = st.r_comm.take() {
                drop(state);
                r_comm.close()?;
            }
        }
        self.ep.remove_comm(self.id);
        self.ep.release();
        Ok(())
    }
}

impl SendComm {
    /// Post a send of `size` bytes at `data`.
    ///
    /// Returns `None` when the connection is still settling or the fabric is
    /// backpressuring; the caller retries with the same arguments.
    ///
    /// # Safety
    /// `data..data+size` must be covered by `mr` and stay valid until the
    /// returned request tests complete.
    pub unsafe fn send(
        &self,
        data: *const u8,
        size: usize,
        _tag: i32,
        mr: &Rc<MrHandle>,
    ) -> Result<Option<Request>> {
        {
            let mut state = self.state.borrow_mut();
            let st = state.as_send_mut()?;
            if st.num_inflight == MAX_SEND_REQUESTS {
                return Err(Error::ResourceExhausted("in-flight send requests"));
            }
            if !st.connected {
                drop(state);
                // The connect response may already be queued.
                self.ep.process_cq()?;
                let mut state = self.state.borrow_mut();
                if !state.as_send_mut()?.connected {
                    return Ok(None);
                }
            }
        }

        if self.ep.process_cq_if_pending()? {
            // Network is still busy.
            return Ok(None);
        }

        let mut state = self.state.borrow_mut();
        let st = state.as_send_mut()?;
        let seq = st.next_seq;

        // A ctrl message for this sequence number may have arrived already.
        let (have_ctrl, ctrl_bounce) = match st.msgbuff.retrieve(seq) {
            (Some(elem), SlotStatus::InProgress) => match elem.kind {
                ElemType::Buff => (true, Some(elem.idx)),
                ElemType::Req => {
                    return Err(Error::Protocol(format!(
                        "duplicate send for message {}",
                        seq
                    )))
                }
            },
            (None, SlotStatus::NotStarted) => (false, None),
            (_, status) => {
                return Err(Error::Protocol(format!(
                    "message {} in unexpected state {:?}",
                    seq, status
                )))
            }
        };

        let eager = (!have_ctrl && size <= self.ep.device().config.eager_max_size) || size == 0;

        let schedule = self
            .ep
            .device()
            .scheduler
            .schedule(size, self.ep.num_rails());
        debug_assert!(!eager || schedule.xfers.len() == 1);
        let total_num_compls = (if have_ctrl { 0 } else { 1 }) + schedule.xfers.len() as u32;
        let wdata = rdma_write_imm(st.remote_comm_id, seq, schedule.xfers.len());

        let req_idx = alloc_req(
            &mut st.reqs,
            MAX_SEND_REQUESTS,
            Req::new(
                ReqKind::Send(SendData {
                    buff: data,
                    buff_len: size,
                    mr: mr.clone(),
                    schedule: Some(schedule),
                    eager,
                    total_num_compls,
                    xferred_rail_id: 0,
                    wdata,
                    remote_buff: 0,
                    remote_len: 0,
                    remote_mr_key: [0; MAX_RAILS],
                }),
                seq,
            ),
        )?;

        if let Some(bounce_idx) = ctrl_bounce {
            let ctrl = self.ep.bounce_ctrl_msg(bounce_idx);
            if let ReqKind::Send(send) = &mut st.reqs[req_idx].kind {
                send.remote_buff = ctrl.buff_addr;
                send.remote_len = ctrl.buff_len;
                send.remote_mr_key = ctrl.buff_mr_key;
            }
            self.ep.check_post_bounce_req(bounce_idx)?;
        }

        if have_ctrl {
            if st.msgbuff.replace(seq, Elem::req(req_idx)).is_err() {
                free_send_req(&self.ep, st, req_idx, false);
                return Err(Error::Protocol(format!(
                    "failed to take over message {} from ctrl",
                    seq
                )));
            }
        } else {
            match st.msgbuff.insert(seq, Elem::req(req_idx)) {
                InsertResult::Inserted => {}
                InsertResult::Occupied(SlotStatus::InProgress) => {
                    // The peer's ctrl slipped in; let the caller retry and
                    // take the ctrl path.
                    free_send_req(&self.ep, st, req_idx, false);
                    return Ok(None);
                }
                InsertResult::Occupied(status) => {
                    free_send_req(&self.ep, st, req_idx, false);
                    return Err(Error::Protocol(format!(
                        "message {} in unexpected state {:?}",
                        seq, status
                    )));
                }
            }
        }

        st.num_inflight += 1;

        if have_ctrl || eager {
            match self.ep.progress_req(&mut state, self.id, req_idx) {
                Ok(Progress::Posted) => {}
                Ok(Progress::Backpressure) => {
                    self.ep.enqueue_pending(&mut state, self.id, req_idx);
                }
                Err(e) => {
                    let st = state.as_send_mut()?;
                    st.num_inflight -= 1;
                    free_send_req(&self.ep, st, req_idx, false);
                    return Err(e);
                }
            }
        }

        let st = state.as_send_mut()?;
        st.next_seq = (seq + 1) & (SEQ_RANGE - 1);

        Ok(Some(Request {
            ep: self.ep.clone(),
            comm_id: self.id,
            req_idx,
        }))
    }

    /// Register `size` bytes at `data` for transfers on this communicator.
    ///
    /// # Safety
    /// See [`MrHandle::register`].
    pub unsafe fn register_memory(
        &self,
        data: *const u8,
        size: usize,
        kind: BufferType,
    ) -> Result<Rc<MrHandle>> {
        Ok(Rc::new(MrHandle::register(&self.ep, data, size, kind)?))
    }

    /// Whether the handshake has finished.
    pub fn is_connected(&self) -> bool {
        match &*self.state.borrow() {
            CommState::Send(st) => st.connected,
            _ => false,
        }
    }

    /// Close the communicator, finishing a still-running handshake first.
    /// Refuses while requests are in flight.
    pub fn close(self) -> Result<()> {
        loop {
            let connected = {
                let mut state = self.state.borrow_mut();
                state.as_send_mut()?.connected
            };
            if connected {
                break;
            }
            self.ep.process_cq()?;
        }

        {
            let mut state = self.state.borrow_mut();
            let st = state.as_send_mut()?;
            if st.num_inflight > 0 {
                return Err(Error::InvalidArgument(
                    "closing send communicator with in-flight requests",
                ));
            }
            if let Some(resp_req) = st.conn_resp_req.take() {
                st.reqs.remove(resp_req);
            }
        }
        self.ep.remove_comm(self.id);
        self.ep.release();
        Ok(())
    }
}

impl RecvComm {
    /// Post a receive for one message. `buffers` must contain exactly one
    /// entry (the grouped API caps at [`MAX_RECVS`]).
    ///
    /// # Safety
    /// Each buffer must be covered by its registration and stay valid until
    /// the returned request tests complete.
    pub unsafe fn recv(&self, buffers: &[RecvBuffer]) -> Result<Option<Request>> {
        if buffers.len() > MAX_RECVS {
            return Err(Error::InvalidArgument("too many receive buffers"));
        }
        if buffers.len() != 1 {
            return Err(Error::InvalidArgument(
                "the RDMA transport posts exactly one receive per call",
            ));
        }
        let buffer = &buffers[0];

        {
            let mut state = self.state.borrow_mut();
            let st = state.as_recv_mut()?;
            if st.num_inflight == MAX_REQUESTS {
                return Err(Error::ResourceExhausted("in-flight receive requests"));
            }
        }

        if self.ep.process_cq_if_pending()? {
            return Ok(None);
        }

        let mut state = self.state.borrow_mut();
        let st = state.as_recv_mut()?;
        let seq = st.next_seq;

        // An eager payload for this sequence number may already be waiting.
        let (eager, eager_bounce) = match st.msgbuff.retrieve(seq) {
            (Some(elem), SlotStatus::InProgress) => match elem.kind {
                ElemType::Buff => (true, Some(elem.idx)),
                ElemType::Req => {
                    return Err(Error::Protocol(format!(
                        "duplicate receive for message {}",
                        seq
                    )))
                }
            },
            (None, SlotStatus::NotStarted) => (false, None),
            (_, status) => {
                return Err(Error::Protocol(format!(
                    "message {} in unexpected state {:?}",
                    seq, status
                )))
            }
        };

        let recv_idx = alloc_recv_reqs(&self.ep, st, seq, buffer)?;

        if let Some(bounce_idx) = eager_bounce {
            if self.ep.bounce_recv_len(bounce_idx) == 0 {
                // Zero-length eager: nothing to copy.
                self.ep.check_post_bounce_req(bounce_idx)?;
            } else {
                alloc_eager_copy_req(st, recv_idx, bounce_idx)?;
            }
        }

        if eager {
            if st.msgbuff.replace(seq, Elem::req(recv_idx)).is_err() {
                free_recv_req(&self.ep, st, recv_idx, false);
                return Err(Error::Protocol(format!(
                    "failed to take over message {} from eager payload",
                    seq
                )));
            }
        } else {
            match st.msgbuff.insert(seq, Elem::req(recv_idx)) {
                InsertResult::Inserted => {}
                InsertResult::Occupied(SlotStatus::InProgress) => {
                    free_recv_req(&self.ep, st, recv_idx, false);
                    return Ok(None);
                }
                InsertResult::Occupied(status) => {
                    free_recv_req(&self.ep, st, recv_idx, false);
                    return Err(Error::Protocol(format!(
                        "message {} in unexpected state {:?}",
                        seq, status
                    )));
                }
            }
        }

        st.num_inflight += 1;

        // Announce the buffer to the sender.
        let ctrl_req = match &st.reqs[recv_idx].kind {
            ReqKind::Recv(data) => data.send_ctrl_req,
            _ => unreachable!(),
        };
        match self.ep.progress_req(&mut state, self.id, ctrl_req) {
            Ok(Progress::Posted) => {}
            Ok(Progress::Backpressure) => {
                self.ep.enqueue_pending(&mut state, self.id, ctrl_req);
            }
            Err(e) => {
                let st = state.as_recv_mut()?;
                st.num_inflight -= 1;
                free_recv_req(&self.ep, st, recv_idx, false);
                return Err(e);
            }
        }

        if eager {
            let st = state.as_recv_mut()?;
            let (total, copy_req) = match &st.reqs[recv_idx].kind {
                ReqKind::Recv(data) => (data.total_num_compls, data.eager_copy_req),
                _ => unreachable!(),
            };
            match copy_req {
                None => {
                    // Zero-length eager already arrived in full.
                    inc_req_completion(&mut st.reqs, recv_idx, 0, total);
                }
                Some(copy_idx) => match self.ep.progress_req(&mut state, self.id, copy_idx) {
                    Ok(Progress::Posted) => {}
                    Ok(Progress::Backpressure) => {
                        self.ep.enqueue_pending(&mut state, self.id, copy_idx);
                    }
                    Err(e) => {
                        warn!(comm = self.id, seq, "failed to post eager copy");
                        let st = state.as_recv_mut()?;
                        st.num_inflight -= 1;
                        free_recv_req(&self.ep, st, recv_idx, false);
                        return Err(e);
                    }
                },
            }
        }

        let st = state.as_recv_mut()?;
        st.next_seq = (seq + 1) & (SEQ_RANGE - 1);

        Ok(Some(Request {
            ep: self.ep.clone(),
            comm_id: self.id,
            req_idx: recv_idx,
        }))
    }

    /// Ensure prior RDMA writes into the given buffers are visible. Returns
    /// `None` when no flush is needed (flush disabled, GPUDirect unsupported,
    /// or all entries zero-length).
    ///
    /// # Safety
    /// Same buffer contract as [`RecvComm::recv`].
    pub unsafe fn flush(&self, buffers: &[RecvBuffer]) -> Result<Option<Request>> {
        {
            let mut state = self.state.borrow_mut();
            let st = state.as_recv_mut()?;
            if st.num_inflight == MAX_REQUESTS {
                return Err(Error::ResourceExhausted("in-flight receive requests"));
            }
        }

        let network_busy = self.ep.process_cq_if_pending()?;

        let config = &self.ep.device().config;
        if config.gdr_flush_disable || gdr_support() == GdrSupport::Unsupported {
            return Ok(None);
        }

        // One read covers every buffer of the group; zero-length entries
        // never need it.
        let Some(flush_n) = buffers.iter().position(|b| b.size != 0) else {
            return Ok(None);
        };
        let buffer = &buffers[flush_n];

        let mut state = self.state.borrow_mut();
        let st = state.as_recv_mut()?;
        let flush_size = st
            .flush_buff
            .as_ref()
            .ok_or(Error::Protocol("flush without flush buffer".into()))?
            .size;

        let schedule = self
            .ep
            .device()
            .scheduler
            .schedule(flush_size, self.ep.num_rails());
        if schedule.xfers.len() != 1 {
            let n = schedule.xfers.len();
            self.ep.device().scheduler.release(schedule);
            return Err(Error::Protocol(format!(
                "flush schedule with {} transfers, expected one",
                n
            )));
        }

        let req_idx = alloc_req(
            &mut st.reqs,
            RECV_REQ_POOL,
            Req::new(
                ReqKind::Flush(FlushData {
                    data: buffer.data,
                    mr: Some(buffer.mr.clone()),
                    schedule: Some(schedule),
                }),
                0,
            ),
        )?;

        if network_busy {
            self.ep.enqueue_pending(&mut state, self.id, req_idx);
        } else {
            match self.ep.progress_req(&mut state, self.id, req_idx) {
                Ok(Progress::Posted) => {}
                Ok(Progress::Backpressure) => {
                    self.ep.enqueue_pending(&mut state, self.id, req_idx);
                }
                Err(e) => {
                    let st = state.as_recv_mut()?;
                    free_flush_req(&self.ep, st, req_idx, false);
                    return Err(e);
                }
            }
        }

        let st = state.as_recv_mut()?;
        st.num_inflight += 1;

        Ok(Some(Request {
            ep: self.ep.clone(),
            comm_id: self.id,
            req_idx,
        }))
    }

    /// Register `size` bytes at `data` for transfers on this communicator.
    ///
    /// # Safety
    /// See [`MrHandle::register`].
    pub unsafe fn register_memory(
        &self,
        data: *const u8,
        size: usize,
        kind: BufferType,
    ) -> Result<Rc<MrHandle>> {
        Ok(Rc::new(MrHandle::register(&self.ep, data, size, kind)?))
    }

    /// Close the communicator. Refuses while requests are in flight.
    pub fn close(self) -> Result<()> {
        {
            let mut state = self.state.borrow_mut();
            let st = state.as_recv_mut()?;
            if st.num_inflight > 0 {
                return Err(Error::InvalidArgument(
                    "closing receive communicator with in-flight requests",
                ));
            }
        }
        self.ep.remove_comm(self.id);
        self.ep.release();
        Ok(())
    }
}

/// Allocate the receive request and its ctrl/segms helpers, and write the
/// control message into a registered slot.
fn alloc_recv_reqs(
    ep: &Rc<Endpoint>,
    st: &mut RecvState,
    seq: u16,
    buffer: &RecvBuffer,
) -> Result<ReqIdx> {
    let mut ctrl = CtrlMsg::new(
        st.remote_comm_id,
        seq,
        buffer.data as u64,
        buffer.size as u64,
    );
    for rail_id in 0..ep.num_rails() {
        ctrl.buff_mr_key[rail_id] = buffer.mr.key(rail_id)?;
    }

    let recv_idx = alloc_req(
        &mut st.reqs,
        RECV_REQ_POOL,
        Req::new(
            ReqKind::Recv(RecvData {
                total_num_compls: 2,
                dst_buff: buffer.data,
                dst_len: buffer.size,
                dst_mr: buffer.mr.clone(),
                send_ctrl_req: 0,
                recv_segms_req: 0,
                eager_copy_req: None,
            }),
            seq,
        ),
    )?;

    let schedule = ep
        .device()
        .scheduler
        .schedule(CTRL_MSG_SIZE, ep.num_rails());
    if schedule.xfers.len() != 1 {
        let n = schedule.xfers.len();
        ep.device().scheduler.release(schedule);
        st.reqs.remove(recv_idx);
        return Err(Error::Protocol(format!(
            "control schedule with {} transfers, expected one",
            n
        )));
    }

    let slot = match st.ctrl_pool.alloc(|ptr, len| ep.register_internal(ptr, len)) {
        Ok(slot) => slot,
        Err(e) => {
            ep.device().scheduler.release(schedule);
            st.reqs.remove(recv_idx);
            return Err(e);
        }
    };
    // Safety: the slot is at least CTRL_MSG_SIZE bytes.
    unsafe {
        std::ptr::copy_nonoverlapping(
            &ctrl as *const CtrlMsg as *const u8,
            st.ctrl_pool.addr(slot),
            CTRL_MSG_SIZE,
        );
    }

    let ctrl_idx = alloc_req(
        &mut st.reqs,
        RECV_REQ_POOL,
        Req::new(
            ReqKind::SendCtrl(SendCtrlData {
                recv_req: recv_idx,
                schedule: Some(schedule),
                ctrl_slot: Some(slot),
            }),
            seq,
        ),
    )?;
    let segms_idx = match alloc_req(
        &mut st.reqs,
        RECV_REQ_POOL,
        Req::new(ReqKind::RecvSegms(RecvSegmsData { recv_req: recv_idx }), seq),
    ) {
        Ok(idx) => idx,
        Err(e) => {
            if let ReqKind::SendCtrl(ctrl_data) = st.reqs.remove(ctrl_idx).kind {
                release_schedule(ep, ctrl_data.schedule);
                if let Some(slot) = ctrl_data.ctrl_slot {
                    st.ctrl_pool.release(slot);
                }
            }
            st.reqs.remove(recv_idx);
            return Err(e);
        }
    };

    if let ReqKind::Recv(data) = &mut st.reqs[recv_idx].kind {
        data.send_ctrl_req = ctrl_idx;
        data.recv_segms_req = segms_idx;
    }
    Ok(recv_idx)
}

/// Attach an eager-copy helper request to a receive request.
pub(crate) fn alloc_eager_copy_req(
    st: &mut RecvState,
    recv_req: ReqIdx,
    bounce_req: usize,
) -> Result<ReqIdx> {
    let seq = st.reqs[recv_req].msg_seq_num;
    let copy_idx = alloc_req(
        &mut st.reqs,
        RECV_REQ_POOL,
        Req::new(
            ReqKind::EagerCopy(EagerCopyData {
                recv_req,
                bounce_req,
            }),
            seq,
        ),
    )?;
    if let ReqKind::Recv(data) = &mut st.reqs[recv_req].kind {
        data.eager_copy_req = Some(copy_idx);
    }
    Ok(copy_idx)
}

fn release_schedule(ep: &Endpoint, schedule: Option<Schedule>) {
    if let Some(schedule) = schedule {
        ep.device().scheduler.release(schedule);
    }
}

fn free_send_req(ep: &Endpoint, st: &mut SendState, req_idx: ReqIdx, dec_inflight: bool) {
    let req = st.reqs.remove(req_idx);
    if let ReqKind::Send(data) = req.kind {
        release_schedule(ep, data.schedule);
    }
    if dec_inflight {
        st.num_inflight -= 1;
    }
}

fn free_recv_req(ep: &Endpoint, st: &mut RecvState, req_idx: ReqIdx, dec_inflight: bool) {
    let req = st.reqs.remove(req_idx);
    if let ReqKind::Recv(data) = req.kind {
        let ctrl = st.reqs.remove(data.send_ctrl_req);
        if let ReqKind::SendCtrl(ctrl_data) = ctrl.kind {
            release_schedule(ep, ctrl_data.schedule);
            if let Some(slot) = ctrl_data.ctrl_slot {
                st.ctrl_pool.release(slot);
            }
        }
        st.reqs.remove(data.recv_segms_req);
        if let Some(copy_idx) = data.eager_copy_req {
            st.reqs.remove(copy_idx);
        }
    }
    if dec_inflight {
        st.num_inflight -= 1;
    }
}

fn free_flush_req(ep: &Endpoint, st: &mut RecvState, req_idx: ReqIdx, dec_inflight: bool) {
    let req = st.reqs.remove(req_idx);
    if let ReqKind::Flush(data) = req.kind {
        release_schedule(ep, data.schedule);
    }
    if dec_inflight {
        st.num_inflight -= 1;
    }
}

impl Request {
    /// Poll for completion. Drains the endpoint's CQ when the request is not
    /// yet terminal. Returns the completed byte count once done.
    pub fn test(&self) -> Result<Option<usize>> {
        let comm = self.ep.comm(self.comm_id)?;

        let terminal = {
            let state = comm.borrow();
            let req = state
                .reqs()
                .get(self.req_idx)
                .ok_or(Error::InvalidArgument("stale request handle"))?;
            match req.kind {
                ReqKind::Send(_) | ReqKind::Recv(_) | ReqKind::Flush(_) => {}
                _ => return Err(Error::InvalidArgument("request is not testable")),
            }
            req.is_terminal()
        };

        if !terminal {
            self.ep.process_cq()?;
        }

        let mut state = comm.borrow_mut();
        let (req_state, size, seq, is_flush) = {
            let req = &state.reqs()[self.req_idx];
            (
                req.state,
                req.size,
                req.msg_seq_num,
                matches!(req.kind, ReqKind::Flush(_)),
            )
        };

        match req_state {
            ReqState::Completed => {
                match &mut *state {
                    CommState::Send(st) => {
                        st.msgbuff
                            .complete(seq)
                            .map_err(|status| {
                                Error::Protocol(format!(
                                    "completing message {} in state {:?}",
                                    seq, status
                                ))
                            })?;
                        free_send_req(&self.ep, st, self.req_idx, true);
                    }
                    CommState::Recv(st) => {
                        if is_flush {
                            free_flush_req(&self.ep, st, self.req_idx, true);
                        } else {
                            st.msgbuff
                                .complete(seq)
                                .map_err(|status| {
                                    Error::Protocol(format!(
                                        "completing message {} in state {:?}",
                                        seq, status
                                    ))
                                })?;
                            free_recv_req(&self.ep, st, self.req_idx, true);
                        }
                    }
                    CommState::Listen(_) => {
                        return Err(Error::Protocol("testable request on listen comm".into()))
                    }
                }
                Ok(Some(size))
            }
            ReqState::Error => Err(Error::RequestFailed),
            _ => Ok(None),
        }
    }
}
