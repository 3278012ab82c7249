use std::{
    collections::VecDeque,
    io::{self, Write},
    os::fd::AsRawFd,
    sync::Mutex,
};

use mio::Token;
use sluice_utils::Semaphore;
use tracing::{debug, warn};

use crate::{
    conn::{Conn, Envelope, SendBuf},
    notifier::{Action, Combine, EventFlags, Notifier},
};

/// Outbound FIFO shared by the worker threads (producers) and the sender
/// thread (consumer). The semaphore carries one permit per pushed message
/// plus the shutdown wakeups.
pub(crate) struct SendQueue {
    queue: Mutex<VecDeque<Envelope>>,
    sem: Semaphore,
}

impl SendQueue {
    pub(crate) fn new() -> Self {
        Self { queue: Mutex::new(VecDeque::new()), sem: Semaphore::new(0) }
    }

    pub(crate) fn push(&self, env: Envelope) {
        self.queue.lock().unwrap().push_back(env);
        self.sem.post();
    }

    pub(crate) fn try_pop(&self) -> Option<Envelope> {
        self.queue.lock().unwrap().pop_front()
    }

    /// Blocks until at least one message (or shutdown wakeup) was posted.
    pub(crate) fn wait(&self) {
        self.sem.wait();
    }

    /// Shutdown: release `n` blocked waiters.
    pub(crate) fn wake(&self, n: usize) {
        self.sem.post_n(n);
    }

    /// Teardown: frees everything still queued, returns the count.
    pub(crate) fn drain(&self) -> usize {
        let mut queue = self.queue.lock().unwrap();
        let dropped = queue.len();
        queue.clear();
        dropped
    }
}

enum WriteStep {
    /// Current buffer fully written.
    Done,
    /// Short write; cursor advanced.
    Partial,
    Blocked,
    Retry,
    PeerClosed,
    Failed(io::Error),
}

fn write_step(conn: &mut Conn) -> WriteStep {
    let Conn { stream, send, .. } = conn;
    let (Some(stream), Some(buf)) = (stream.as_mut(), send.as_mut()) else {
        return WriteStep::Done;
    };
    match stream.write(&buf.frame[buf.cursor..]) {
        Ok(0) => WriteStep::PeerClosed,
        Ok(n) if n == buf.remaining() => WriteStep::Done,
        Ok(n) => {
            buf.cursor += n;
            WriteStep::Partial
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => WriteStep::Blocked,
        Err(e) if e.kind() == io::ErrorKind::Interrupted => WriteStep::Retry,
        Err(e) => WriteStep::Failed(e),
    }
}

/// Writes the connection's current buffer and backlog until the socket
/// blocks or everything is out. Invoked by the sender thread for fresh
/// messages and by the reactor's write handler to resume after a
/// write-readiness event; the caller holds the slot lock either way.
///
/// A short write or `WouldBlock` arms `WRITABLE`; the arm is dropped only
/// once current buffer and backlog are both drained, so per-connection
/// bytes go out in enqueue order.
pub(crate) fn drive_send(slot: usize, conn: &mut Conn, notifier: &Notifier) {
    loop {
        if conn.send.is_none() {
            match conn.send_backlog.pop_front() {
                Some(env) => conn.send = Some(SendBuf::new(env.frame)),
                None => break,
            }
        }
        if conn.stream.is_none() {
            conn.clear_send();
            return;
        }
        match write_step(conn) {
            WriteStep::Done => conn.send = None,
            WriteStep::Partial | WriteStep::Blocked => {
                arm(slot, conn, notifier);
                return;
            }
            WriteStep::Retry => {}
            WriteStep::PeerClosed => {
                warn!(slot, "send: peer closed the socket mid-write");
                fail_send(slot, conn, notifier);
                return;
            }
            WriteStep::Failed(e) => {
                warn!(slot, %e, "send: write failed");
                fail_send(slot, conn, notifier);
                return;
            }
        }
    }
    disarm(slot, conn, notifier);
}

fn arm(slot: usize, conn: &mut Conn, notifier: &Notifier) {
    if conn.send_armed > 0 {
        return;
    }
    let Some(fd) = conn.stream.as_ref().map(AsRawFd::as_raw_fd) else { return };
    match notifier.update(fd, Token(slot), Action::Modify(Combine::Or), EventFlags::WRITABLE, conn)
    {
        Ok(()) => conn.send_armed += 1,
        Err(e) => warn!(slot, %e, "send: couldn't arm write readiness"),
    }
}

fn disarm(slot: usize, conn: &mut Conn, notifier: &Notifier) {
    if conn.send_armed == 0 {
        return;
    }
    if let Some(fd) = conn.stream.as_ref().map(AsRawFd::as_raw_fd) {
        if let Err(e) =
            notifier.update(fd, Token(slot), Action::Modify(Combine::AndNot), EventFlags::WRITABLE, conn)
        {
            debug!(slot, %e, "send: couldn't disarm write readiness");
        }
    }
    conn.send_armed -= 1;
}

fn fail_send(slot: usize, conn: &mut Conn, notifier: &Notifier) {
    disarm(slot, conn, notifier);
    conn.clear_send();
}
