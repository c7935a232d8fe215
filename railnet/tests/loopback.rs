//! Loopback integration tests.
//!
//! These tests drive the full protocol — handshake, eager and rendezvous
//! paths, flush bookkeeping — over a real libfabric provider on the local
//! host. They skip when no provider matching the transport's requirements is
//! installed.
//!
//! Run with:
//! ```bash
//! cargo test --package railnet --test loopback -- --nocapture
//! ```

use std::rc::Rc;
use std::time::{Duration, Instant};

use railnet::{
    connect, listen, BufferType, Config, ConnHandle, Plugin, RecvBuffer, RecvComm, Request,
    SendComm,
};

const TIMEOUT: Duration = Duration::from_secs(10);

fn test_config() -> Config {
    Config::default()
        .with_eager_max_size(64)
        .with_round_robin_threshold(8192)
        .with_posted_bounce_buffers(16, 32)
        .with_cq_read_count(4)
        .with_gdr_flush_disable(true)
}

fn init_plugin() -> Option<Plugin> {
    static TRACING: std::sync::Once = std::sync::Once::new();
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt().try_init();
    });

    match Plugin::init(test_config(), None) {
        Ok(plugin) => Some(plugin),
        Err(e) => {
            eprintln!("Skipping test: no usable fabric provider ({})", e);
            None
        }
    }
}

/// Drive connect and accept until both sides finish.
fn establish(plugin: &Plugin) -> (SendComm, RecvComm, railnet::ListenComm) {
    let device = plugin.device(0);
    let ep = device.scoped_endpoint().expect("endpoint");

    let (handle, l_comm) = listen(&ep).expect("listen");
    let mut handle = ConnHandle::from_bytes(&handle.to_bytes());

    let deadline = Instant::now() + TIMEOUT;
    let mut s_comm = None;
    let mut r_comm = None;
    while s_comm.is_none() || r_comm.is_none() {
        assert!(Instant::now() < deadline, "handshake timed out");
        if s_comm.is_none() {
            s_comm = connect(&ep, &mut handle).expect("connect");
        }
        if r_comm.is_none() {
            r_comm = l_comm.accept().expect("accept");
        }
    }
    let s_comm = s_comm.unwrap();

    // The sender may still be waiting for CONN_RESP.
    while !s_comm.is_connected() {
        assert!(Instant::now() < deadline, "connect finalize timed out");
        ep.progress().expect("progress");
    }

    (s_comm, r_comm.unwrap(), l_comm)
}

fn wait_done(req: &Request, what: &str) -> usize {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        if let Some(size) = req.test().unwrap_or_else(|e| panic!("{} failed: {}", what, e)) {
            return size;
        }
        assert!(Instant::now() < deadline, "{} timed out", what);
    }
}

#[test]
fn test_plugin_init_and_properties() {
    let Some(plugin) = init_plugin() else { return };
    assert!(plugin.num_devices() > 0);

    let props = plugin.device(0).properties();
    println!(
        "device 0: provider {}, {} rails, {} Mbps",
        props.name,
        props.num_rails,
        props.port_speed / 1_000_000
    );
    assert!(props.num_rails >= 1);
    assert!(props.max_communicators >= 1 << 18);
}

#[test]
fn test_endpoint_refcount_returns_to_zero() {
    let Some(plugin) = init_plugin() else { return };
    let device = plugin.device(0);

    let ep = device.scoped_endpoint().expect("endpoint");
    assert_eq!(ep.ref_count(), 1);
    let ep2 = device.scoped_endpoint().expect("endpoint");
    assert!(Rc::ptr_eq(&ep, &ep2));
    assert_eq!(ep.ref_count(), 2);
    ep2.release();
    assert_eq!(ep.ref_count(), 1);
    ep.release();
}

#[test]
fn test_handshake_loopback() {
    let Some(plugin) = init_plugin() else { return };
    let (s_comm, _r_comm, _l_comm) = establish(&plugin);
    assert!(s_comm.is_connected());
}

#[test]
fn test_eager_zero_byte() {
    let Some(plugin) = init_plugin() else { return };
    let (s_comm, r_comm, _l_comm) = establish(&plugin);

    let mut src = vec![0u8; 8];
    let mut dst = vec![0u8; 8];
    let src_mr = unsafe {
        s_comm
            .register_memory(src.as_mut_ptr(), src.len(), BufferType::Host)
            .expect("register send buffer")
    };
    let dst_mr = unsafe {
        r_comm
            .register_memory(dst.as_mut_ptr(), dst.len(), BufferType::Host)
            .expect("register recv buffer")
    };

    let recv_req = unsafe {
        r_comm.recv(&[RecvBuffer {
            data: dst.as_mut_ptr(),
            size: 0,
            tag: 0,
            mr: dst_mr.clone(),
        }])
    }
    .expect("recv")
    .expect("recv request");

    let send_req = loop {
        match unsafe { s_comm.send(src.as_ptr(), 0, 0, &src_mr) }.expect("send") {
            Some(req) => break req,
            None => continue,
        }
    };

    assert_eq!(wait_done(&send_req, "zero-byte send"), 0);
    assert_eq!(wait_done(&recv_req, "zero-byte recv"), 0);
}

#[test]
fn test_eager_small_message() {
    let Some(plugin) = init_plugin() else { return };
    let (s_comm, r_comm, _l_comm) = establish(&plugin);

    let mut src: Vec<u8> = (0u8..64).collect();
    let mut dst = vec![0u8; 64];
    let src_mr = unsafe {
        s_comm
            .register_memory(src.as_mut_ptr(), src.len(), BufferType::Host)
            .expect("register send buffer")
    };
    let dst_mr = unsafe {
        r_comm
            .register_memory(dst.as_mut_ptr(), dst.len(), BufferType::Host)
            .expect("register recv buffer")
    };

    // Sender first: the payload travels eagerly and waits in a bounce
    // buffer until the receive is posted.
    let send_req = loop {
        match unsafe { s_comm.send(src.as_ptr(), src.len(), 0, &src_mr) }.expect("send") {
            Some(req) => break req,
            None => continue,
        }
    };

    let recv_req = loop {
        match unsafe {
            r_comm.recv(&[RecvBuffer {
                data: dst.as_mut_ptr(),
                size: dst.len(),
                tag: 0,
                mr: dst_mr.clone(),
            }])
        }
        .expect("recv")
        {
            Some(req) => break req,
            None => continue,
        }
    };

    wait_done(&send_req, "eager send");
    assert_eq!(wait_done(&recv_req, "eager recv"), 64);
    assert_eq!(src, dst);
}

#[test]
fn test_rendezvous_large_message() {
    let Some(plugin) = init_plugin() else { return };
    let (s_comm, r_comm, _l_comm) = establish(&plugin);

    const SIZE: usize = 1 << 20;
    let mut src: Vec<u8> = (0..SIZE).map(|i| (i % 251) as u8).collect();
    let mut dst = vec![0u8; SIZE];
    let src_mr = unsafe {
        s_comm
            .register_memory(src.as_mut_ptr(), src.len(), BufferType::Host)
            .expect("register send buffer")
    };
    let dst_mr = unsafe {
        r_comm
            .register_memory(dst.as_mut_ptr(), dst.len(), BufferType::Host)
            .expect("register recv buffer")
    };

    let recv_req = unsafe {
        r_comm.recv(&[RecvBuffer {
            data: dst.as_mut_ptr(),
            size: dst.len(),
            tag: 0,
            mr: dst_mr.clone(),
        }])
    }
    .expect("recv")
    .expect("recv request");

    let send_req = loop {
        match unsafe { s_comm.send(src.as_ptr(), src.len(), 0, &src_mr) }.expect("send") {
            Some(req) => break req,
            None => continue,
        }
    };

    assert_eq!(wait_done(&send_req, "rendezvous send"), SIZE);
    assert_eq!(wait_done(&recv_req, "rendezvous recv"), SIZE);
    assert_eq!(src, dst);
}

#[test]
fn test_message_ordering_per_pair() {
    let Some(plugin) = init_plugin() else { return };
    let (s_comm, r_comm, _l_comm) = establish(&plugin);

    const COUNT: usize = 8;
    const SIZE: usize = 16 * 1024;

    let mut srcs: Vec<Vec<u8>> = (0..COUNT)
        .map(|i| vec![i as u8 + 1; SIZE])
        .collect();
    let mut dsts: Vec<Vec<u8>> = (0..COUNT).map(|_| vec![0u8; SIZE]).collect();

    let src_mrs: Vec<_> = srcs
        .iter_mut()
        .map(|b| unsafe {
            s_comm
                .register_memory(b.as_mut_ptr(), b.len(), BufferType::Host)
                .expect("register send buffer")
        })
        .collect();
    let dst_mrs: Vec<_> = dsts
        .iter_mut()
        .map(|b| unsafe {
            r_comm
                .register_memory(b.as_mut_ptr(), b.len(), BufferType::Host)
                .expect("register recv buffer")
        })
        .collect();

    let mut recv_reqs = Vec::new();
    for i in 0..COUNT {
        let req = loop {
            match unsafe {
                r_comm.recv(&[RecvBuffer {
                    data: dsts[i].as_mut_ptr(),
                    size: SIZE,
                    tag: 0,
                    mr: dst_mrs[i].clone(),
                }])
            }
            .expect("recv")
            {
                Some(req) => break req,
                None => continue,
            }
        };
        recv_reqs.push(req);
    }

    let mut send_reqs = Vec::new();
    for i in 0..COUNT {
        let req = loop {
            match unsafe { s_comm.send(srcs[i].as_ptr(), SIZE, 0, &src_mrs[i]) }.expect("send") {
                Some(req) => break req,
                None => continue,
            }
        };
        send_reqs.push(req);
    }

    // Completion order at the receiver matches posting order per pair.
    for (i, req) in recv_reqs.iter().enumerate() {
        assert_eq!(wait_done(req, "ordered recv"), SIZE);
        assert_eq!(dsts[i], srcs[i], "message {} corrupted", i);
    }
    for req in &send_reqs {
        assert_eq!(wait_done(req, "ordered send"), SIZE);
    }
}
