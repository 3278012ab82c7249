use std::{collections::VecDeque, net::SocketAddr};

use mio::net::TcpStream;

use crate::{
    frame::HEADER_LEN,
    notifier::EventFlags,
};

/// Receive-side phase of the framing state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecvState {
    /// Waiting for the first byte of a header.
    HdrInit,
    /// Header partially received.
    HdrPartial,
    /// Header validated, waiting for the first body byte.
    BodyInit,
    /// Body partially received.
    BodyPartial,
}

/// Read-side behaviour bound to a pooled record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    /// The record shadows a listening socket; readable means "accept".
    Acceptor,
    /// The record owns an accepted socket; readable means "parse frames".
    Reader,
}

/// A complete (or in-assembly) message crossing thread boundaries.
///
/// `sequence` is the owning connection's generation at the moment the
/// envelope was created. Every downstream consumer compares it against the
/// connection's current sequence and silently drops the envelope on
/// mismatch; that equality check is the sole defense against acting on a
/// recycled session.
pub(crate) struct Envelope {
    pub slot: usize,
    pub sequence: u64,
    /// `[header | body]`, exactly `total_len` bytes.
    pub frame: Vec<u8>,
}

/// Outbound buffer currently being written to the socket.
pub(crate) struct SendBuf {
    pub frame: Vec<u8>,
    pub cursor: usize,
}

impl SendBuf {
    pub(crate) fn new(frame: Vec<u8>) -> Self {
        Self { frame, cursor: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.frame.len() - self.cursor
    }
}

/// Per-socket state. Records live in the pool for the process lifetime;
/// the slot mutex around each record serializes reactor, sender and worker
/// access.
pub(crate) struct Conn {
    /// `None` is the unbound sentinel. Dropping the stream is the one and
    /// only close of the fd.
    pub stream: Option<TcpStream>,
    /// Back-reference into the worker listener table.
    pub listener: Option<usize>,
    pub role: Role,
    pub sequence: u64,
    pub peer_addr: Option<SocketAddr>,

    pub recv_state: RecvState,
    /// Bytes of the current header already in `header_buf`.
    pub hdr_have: usize,
    /// Bytes still needed to finish the current receive phase.
    pub recv_remaining: usize,
    pub header_buf: [u8; HEADER_LEN],
    /// In-progress inbound message. `Some` iff `recv_state` is a body phase.
    pub inbound: Option<Envelope>,

    pub send: Option<SendBuf>,
    /// Messages enqueued while a send was already in flight; drained in
    /// FIFO order by the write handler.
    pub send_backlog: VecDeque<Envelope>,
    /// Outstanding write-readiness arms. Non-zero means the reactor owns
    /// the rest of the write.
    pub send_armed: u32,

    /// Shadow of the flags currently programmed in the notifier.
    pub flags: EventFlags,
}

impl Conn {
    pub(crate) fn unbound() -> Self {
        Self {
            stream: None,
            listener: None,
            role: Role::Reader,
            sequence: 0,
            peer_addr: None,
            recv_state: RecvState::HdrInit,
            hdr_have: 0,
            recv_remaining: HEADER_LEN,
            header_buf: [0; HEADER_LEN],
            inbound: None,
            send: None,
            send_backlog: VecDeque::new(),
            send_armed: 0,
            flags: EventFlags::empty(),
        }
    }

    /// Binds a freshly accepted socket to this record.
    pub(crate) fn bind_stream(&mut self, stream: TcpStream, peer: SocketAddr, listener: usize) {
        self.stream = Some(stream);
        self.listener = Some(listener);
        self.role = Role::Reader;
        self.peer_addr = Some(peer);
        self.reset_recv();
        self.clear_send();
        self.flags = EventFlags::empty();
    }

    pub(crate) fn reset_recv(&mut self) {
        self.recv_state = RecvState::HdrInit;
        self.hdr_have = 0;
        self.recv_remaining = HEADER_LEN;
        self.inbound = None;
    }

    pub(crate) fn clear_send(&mut self) {
        self.send = None;
        self.send_backlog.clear();
        self.send_armed = 0;
    }
}
