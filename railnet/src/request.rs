//! Request model.
//!
//! Every posted operation is tracked by a request allocated from its
//! communicator's pool. Requests are referenced by pool index everywhere —
//! fabric context tokens, message-buffer slots, the pending queue and
//! parent/child links — never by pointer. A request reaches `Completed` when
//! its completion count hits the expected total; receive requests own three
//! helper requests (ctrl send, segment accumulation, eager copy) whose
//! completions propagate to the parent.

use std::rc::Rc;

use slab::Slab;

use crate::mr::MrHandle;
use crate::error::{Error, Result};
use crate::pool::SlotRef;
use crate::scheduler::Schedule;
use crate::wire::MAX_RAILS;

/// Request pool index within one communicator.
pub(crate) type ReqIdx = usize;

/// Upper bound on in-flight requests per receive communicator.
pub(crate) const MAX_REQUESTS: usize = 128;

/// Upper bound on in-flight requests per send communicator.
pub(crate) const MAX_SEND_REQUESTS: usize = 128;

/// Lifecycle state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReqState {
    Created,
    Pending,
    Completed,
    Error,
}

/// Payload of a SEND request.
pub(crate) struct SendData {
    pub buff: *const u8,
    pub buff_len: usize,
    pub mr: Rc<MrHandle>,
    pub schedule: Option<Schedule>,
    pub eager: bool,
    /// Expected completions: one per schedule transfer, plus one for the
    /// awaited ctrl message when it has not arrived yet.
    pub total_num_compls: u32,
    /// Next schedule transfer to post; partial posting resumes here after
    /// backpressure.
    pub xferred_rail_id: usize,
    /// Immediate data attached to every segment.
    pub wdata: u64,
    pub remote_buff: u64,
    pub remote_len: u64,
    pub remote_mr_key: [u64; MAX_RAILS],
}

/// Payload of a RECV request (the parent of the receive trio).
pub(crate) struct RecvData {
    pub total_num_compls: u32,
    pub dst_buff: *mut u8,
    pub dst_len: usize,
    pub dst_mr: Rc<MrHandle>,
    pub send_ctrl_req: ReqIdx,
    pub recv_segms_req: ReqIdx,
    pub eager_copy_req: Option<ReqIdx>,
}

/// Payload of a SEND_CTRL request.
pub(crate) struct SendCtrlData {
    pub recv_req: ReqIdx,
    pub schedule: Option<Schedule>,
    pub ctrl_slot: Option<SlotRef>,
}

/// Payload of a RECV_SEGMS request.
pub(crate) struct RecvSegmsData {
    pub recv_req: ReqIdx,
}

/// Payload of an EAGER_COPY request.
pub(crate) struct EagerCopyData {
    pub recv_req: ReqIdx,
    /// Endpoint-level bounce request holding the eager payload.
    pub bounce_req: usize,
}

/// Payload of a FLUSH request.
pub(crate) struct FlushData {
    pub data: *const u8,
    pub mr: Option<Rc<MrHandle>>,
    pub schedule: Option<Schedule>,
}

/// Request kind with per-kind payload.
pub(crate) enum ReqKind {
    Send(SendData),
    Recv(RecvData),
    SendCtrl(SendCtrlData),
    RecvSegms(RecvSegmsData),
    EagerCopy(EagerCopyData),
    Flush(FlushData),
    SendConn,
    SendConnResp,
    RecvConn,
    RecvConnResp,
}

impl ReqKind {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            ReqKind::Send(_) => "SEND",
            ReqKind::Recv(_) => "RECV",
            ReqKind::SendCtrl(_) => "SEND_CTRL",
            ReqKind::RecvSegms(_) => "RECV_SEGMS",
            ReqKind::EagerCopy(_) => "EAGER_COPY",
            ReqKind::Flush(_) => "FLUSH",
            ReqKind::SendConn => "SEND_CONN",
            ReqKind::SendConnResp => "SEND_CONN_RESP",
            ReqKind::RecvConn => "RECV_CONN",
            ReqKind::RecvConnResp => "RECV_CONN_RESP",
        }
    }
}

/// One tracked operation.
pub(crate) struct Req {
    pub kind: ReqKind,
    pub state: ReqState,
    pub msg_seq_num: u16,
    /// Accumulated completed bytes.
    pub size: usize,
    /// Completions observed so far.
    pub ncompls: u32,
    /// Guards against double-insertion into the pending queue.
    pub in_pending: bool,
}

impl Req {
    pub(crate) fn new(kind: ReqKind, msg_seq_num: u16) -> Self {
        Self {
            kind,
            state: ReqState::Created,
            msg_seq_num,
            size: 0,
            ncompls: 0,
            in_pending: false,
        }
    }

    pub(crate) fn is_terminal(&self) -> bool {
        matches!(self.state, ReqState::Completed | ReqState::Error)
    }
}

/// Allocate a request from `reqs`, enforcing the pool cap.
pub(crate) fn alloc_req(reqs: &mut Slab<Req>, cap: usize, req: Req) -> Result<ReqIdx> {
    if reqs.len() >= cap {
        return Err(Error::ResourceExhausted("request pool"));
    }
    Ok(reqs.insert(req))
}

/// Record one completion of `size` bytes against a request expecting
/// `total_ncompls`. Returns true when this completion made the request
/// complete. An errored request keeps its error state.
pub(crate) fn inc_req_completion(
    reqs: &mut Slab<Req>,
    idx: ReqIdx,
    size: usize,
    total_ncompls: u32,
) -> bool {
    let req = &mut reqs[idx];
    req.size += size;
    req.ncompls += 1;
    if req.ncompls == total_ncompls && req.state != ReqState::Error {
        req.state = ReqState::Completed;
        return true;
    }
    false
}

/// Move a request to the error state, propagating to the parent of the
/// receive sub-requests.
pub(crate) fn set_req_error(reqs: &mut Slab<Req>, idx: ReqIdx) {
    let parent = {
        let req = &mut reqs[idx];
        req.state = ReqState::Error;
        match &req.kind {
            ReqKind::SendCtrl(data) => Some(data.recv_req),
            ReqKind::RecvSegms(data) => Some(data.recv_req),
            _ => None,
        }
    };
    if let Some(parent) = parent {
        reqs[parent].state = ReqState::Error;
    }
}

/// Complete a SEND_CTRL request and propagate one completion (of zero bytes)
/// to its parent receive request.
pub(crate) fn set_send_ctrl_completed(reqs: &mut Slab<Req>, idx: ReqIdx) {
    let recv_req = {
        let req = &mut reqs[idx];
        req.ncompls = 1;
        req.state = ReqState::Completed;
        match &req.kind {
            ReqKind::SendCtrl(data) => data.recv_req,
            _ => unreachable!("ctrl completion on non-ctrl request"),
        }
    };
    let total = match &reqs[recv_req].kind {
        ReqKind::Recv(data) => data.total_num_compls,
        _ => unreachable!("ctrl parent is not a receive request"),
    };
    inc_req_completion(reqs, recv_req, 0, total);
}

/// Record one arrived segment of `size` bytes on a RECV_SEGMS request. When
/// all `total_segms` segments have arrived, the parent receive request gets
/// one completion carrying the summed byte count.
pub(crate) fn inc_recv_seg_completion(
    reqs: &mut Slab<Req>,
    idx: ReqIdx,
    size: usize,
    total_segms: usize,
) {
    let (all_arrived, recv_req, seg_bytes) = {
        let req = &mut reqs[idx];
        req.size += size;
        req.ncompls += 1;
        let recv_req = match &req.kind {
            ReqKind::RecvSegms(data) => data.recv_req,
            _ => unreachable!("segment completion on non-segms request"),
        };
        let done = req.ncompls as usize == total_segms;
        if done {
            req.state = ReqState::Completed;
        }
        (done, recv_req, req.size)
    };
    if all_arrived {
        let total = match &reqs[recv_req].kind {
            ReqKind::Recv(data) => data.total_num_compls,
            _ => unreachable!("segms parent is not a receive request"),
        };
        inc_req_completion(reqs, recv_req, seg_bytes, total);
    }
}

/// Complete an EAGER_COPY request and propagate `size` copied bytes to the
/// parent receive request.
pub(crate) fn set_eager_copy_completed(reqs: &mut Slab<Req>, idx: ReqIdx, size: usize) {
    let recv_req = {
        let req = &mut reqs[idx];
        req.ncompls = 1;
        req.state = ReqState::Completed;
        match &req.kind {
            ReqKind::EagerCopy(data) => data.recv_req,
            _ => unreachable!("eager-copy completion on non-copy request"),
        }
    };
    let total = match &reqs[recv_req].kind {
        ReqKind::Recv(data) => data.total_num_compls,
        _ => unreachable!("eager-copy parent is not a receive request"),
    };
    inc_req_completion(reqs, recv_req, size, total);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recv_trio(reqs: &mut Slab<Req>) -> (ReqIdx, ReqIdx, ReqIdx) {
        let recv = reqs.insert(Req::new(
            ReqKind::Recv(RecvData {
                total_num_compls: 2,
                dst_buff: std::ptr::null_mut(),
                dst_len: 0,
                dst_mr: Rc::new(MrHandle::for_tests()),
                send_ctrl_req: 0,
                recv_segms_req: 0,
                eager_copy_req: None,
            }),
            0,
        ));
        let ctrl = reqs.insert(Req::new(
            ReqKind::SendCtrl(SendCtrlData {
                recv_req: recv,
                schedule: None,
                ctrl_slot: None,
            }),
            0,
        ));
        let segms = reqs.insert(Req::new(
            ReqKind::RecvSegms(RecvSegmsData { recv_req: recv }),
            0,
        ));
        if let ReqKind::Recv(data) = &mut reqs[recv].kind {
            data.send_ctrl_req = ctrl;
            data.recv_segms_req = segms;
        }
        (recv, ctrl, segms)
    }

    #[test]
    fn test_send_completion_accounting() {
        let mut reqs = Slab::new();
        let send = reqs.insert(Req::new(ReqKind::SendConn, 0));
        assert!(!inc_req_completion(&mut reqs, send, 100, 2));
        assert!(inc_req_completion(&mut reqs, send, 50, 2));
        assert_eq!(reqs[send].state, ReqState::Completed);
        assert_eq!(reqs[send].size, 150);
    }

    #[test]
    fn test_recv_completes_after_ctrl_and_segments() {
        let mut reqs = Slab::new();
        let (recv, ctrl, segms) = recv_trio(&mut reqs);

        inc_recv_seg_completion(&mut reqs, segms, 4096, 2);
        assert_eq!(reqs[recv].state, ReqState::Created);
        inc_recv_seg_completion(&mut reqs, segms, 4096, 2);
        // All segments arrived, but the ctrl send has not completed.
        assert_eq!(reqs[recv].state, ReqState::Created);
        assert_eq!(reqs[recv].size, 8192);

        set_send_ctrl_completed(&mut reqs, ctrl);
        assert_eq!(reqs[recv].state, ReqState::Completed);
        assert_eq!(reqs[recv].size, 8192);
    }

    #[test]
    fn test_error_propagates_to_parent() {
        let mut reqs = Slab::new();
        let (recv, _ctrl, segms) = recv_trio(&mut reqs);
        set_req_error(&mut reqs, segms);
        assert_eq!(reqs[recv].state, ReqState::Error);
        // A later completion must not override the error.
        let total = 2;
        inc_req_completion(&mut reqs, recv, 0, total);
        inc_req_completion(&mut reqs, recv, 0, total);
        assert_eq!(reqs[recv].state, ReqState::Error);
    }

    #[test]
    fn test_pool_cap() {
        let mut reqs = Slab::new();
        for _ in 0..4 {
            alloc_req(&mut reqs, 4, Req::new(ReqKind::SendConn, 0)).unwrap();
        }
        assert!(alloc_req(&mut reqs, 4, Req::new(ReqKind::SendConn, 0)).is_err());
    }
}
