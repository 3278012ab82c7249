use std::{
    io::{self, Read},
    net::SocketAddr,
    os::fd::{AsRawFd, FromRawFd, IntoRawFd, RawFd},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use mio::{
    Events, Poll, Token,
    event::Event,
    net::{TcpListener, TcpStream},
};
use sluice_utils::broken_invariant;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
    conn::{Conn, Envelope, RecvState, Role},
    frame::{FrameHeader, HEADER_LEN},
    listener::ListenSock,
    notifier::{Action, EventFlags, Notifier},
    pool::{ConnPool, RECYCLE_SCAN_INTERVAL},
    sendq::{SendQueue, drive_send},
    workers::{Handler, WorkerPool},
};

/// Upper bound on readiness events drained per wakeup.
const EVENTS_CAPACITY: usize = 512;
/// The run loop wakes at least this often to observe the quit flag.
const POLL_TICK: Duration = Duration::from_millis(500);

/// Engine knobs for one worker process.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Client connection records per worker. The pool itself is sized
    /// `worker_connections + listener count` so listener-bound records
    /// never eat into client capacity.
    pub worker_connections: usize,
    /// Minimum time a torn-down record spends on the recycle list.
    pub recycle_dwell: Duration,
    /// Worker thread pool size.
    pub worker_threads: usize,
    /// Kernel SO_SNDBUF/SO_RCVBUF override for accepted sockets.
    pub socket_buf_size: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            worker_connections: 1024,
            recycle_dwell: Duration::from_secs(60),
            worker_threads: 4,
            socket_buf_size: None,
        }
    }
}

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("couldn't open listener on port {port}: {source}")]
    Listen { port: u16, source: io::Error },
    #[error(transparent)]
    Io(#[from] io::Error),
}

struct BoundListener {
    port: u16,
    listener: TcpListener,
    #[allow(dead_code)]
    slot: usize,
}

enum ReadDispatch {
    Accept(usize),
    Read,
    Stale,
}

/// One worker process's engine: pool, notifier, listeners and the three
/// thread groups (workers, sender, recycler). The reactor itself runs on
/// the thread that calls [`Server::run`].
pub struct Server {
    pool: Arc<ConnPool>,
    notifier: Arc<Notifier>,
    poll: Poll,
    events: Events,
    listeners: Vec<BoundListener>,
    sendq: Arc<SendQueue>,
    workers: WorkerPool,
    quit: Arc<AtomicBool>,
    sender: JoinHandle<()>,
    recycler: JoinHandle<()>,
    socket_buf_size: Option<usize>,
}

impl Server {
    /// Builds the worker-side runtime around pre-opened listening sockets.
    /// Each listener fd is duplicated, so the caller keeps its own copy.
    pub fn bind(
        cfg: &ServerConfig,
        socks: &[ListenSock],
        handler: Arc<dyn Handler>,
        quit: Arc<AtomicBool>,
    ) -> Result<Self, ServerError> {
        let pool =
            Arc::new(ConnPool::new(cfg.worker_connections + socks.len(), cfg.recycle_dwell));
        let poll = Poll::new()?;
        let notifier = Arc::new(Notifier::new(poll.registry().try_clone()?));
        let sendq = Arc::new(SendQueue::new());

        let mut listeners = Vec::with_capacity(socks.len());
        for (idx, sock) in socks.iter().enumerate() {
            let listener = unsafe { TcpListener::from_raw_fd(sock.dup()?.into_raw_fd()) };
            let slot = pool.checkout().expect("pool is sized for every listener");
            {
                let mut conn = pool.slot(slot).lock().unwrap();
                conn.role = Role::Acceptor;
                conn.listener = Some(idx);
                notifier.update(
                    listener.as_raw_fd(),
                    Token(slot),
                    Action::Add,
                    EventFlags::READABLE,
                    &mut conn,
                )?;
            }
            listeners.push(BoundListener { port: sock.port(), listener, slot });
        }

        let workers = WorkerPool::spawn(
            cfg.worker_threads,
            handler,
            Arc::clone(&pool),
            Arc::clone(&sendq),
            Arc::clone(&quit),
        )?;

        let sender = {
            let pool = Arc::clone(&pool);
            let notifier = Arc::clone(&notifier);
            let sendq = Arc::clone(&sendq);
            let quit = Arc::clone(&quit);
            thread::Builder::new()
                .name("sluice-sender".into())
                .spawn(move || sender_loop(&pool, &notifier, &sendq, &quit))?
        };
        let recycler = {
            let pool = Arc::clone(&pool);
            let quit = Arc::clone(&quit);
            thread::Builder::new()
                .name("sluice-recycle".into())
                .spawn(move || recycle_loop(&pool, &quit))?
        };

        Ok(Self {
            pool,
            notifier,
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            listeners,
            sendq,
            workers,
            quit,
            sender,
            recycler,
            socket_buf_size: cfg.socket_buf_size,
        })
    }

    /// Ports actually bound, in configuration order. Useful when a port was
    /// configured as 0.
    pub fn ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.listeners.iter().map(|l| l.port)
    }

    /// Runs the reactor until the quit flag flips.
    pub fn run(&mut self) -> Result<(), ServerError> {
        info!(
            connections = self.pool.capacity(),
            listeners = self.listeners.len(),
            "worker event loop running"
        );
        while !self.quit.load(Ordering::Relaxed) {
            self.poll_once(Some(POLL_TICK))?;
        }
        Ok(())
    }

    /// One reactor pass. `None` blocks until events arrive; `Some(ZERO)`
    /// polls. Returns the number of events dispatched.
    pub fn poll_once(&mut self, timeout: Option<Duration>) -> Result<usize, ServerError> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                debug!("poll interrupted by a signal");
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        }

        if self.events.is_empty() && timeout.is_none() {
            // An indefinite wait has nothing to time out on.
            broken_invariant!("notifier woke with no events while blocking indefinitely");
            return Ok(0);
        }

        let mut handled = 0;
        for ev in self.events.iter() {
            handled += 1;
            self.on_event(ev);
        }
        Ok(handled)
    }

    /// Orderly teardown: wake and join every thread, then drain the queues.
    /// The notifier must outlive the sender thread, so `self` is consumed
    /// and dropped only after the joins.
    pub fn shutdown(self) {
        self.quit.store(true, Ordering::Relaxed);

        self.sendq.wake(1);
        let _ = self.sender.join();
        self.workers.join();
        let _ = self.recycler.join();

        let dropped = self.sendq.drain();
        if dropped > 0 {
            debug!(dropped, "shutdown: dropped unsent messages");
        }
        debug!(
            free = self.pool.free_count(),
            recycling = self.pool.recycle_len(),
            "worker shutdown complete"
        );
    }

    fn on_event(&self, ev: &Event) {
        let slot = ev.token().0;
        if slot >= self.pool.capacity() {
            broken_invariant!("event for unknown token {slot}");
            return;
        }

        if ev.is_readable() || ev.is_read_closed() || ev.is_error() {
            let dispatch = {
                let conn = self.pool.slot(slot).lock().unwrap();
                match conn.role {
                    Role::Acceptor => {
                        conn.listener.map_or(ReadDispatch::Stale, ReadDispatch::Accept)
                    }
                    Role::Reader if conn.stream.is_some() => ReadDispatch::Read,
                    Role::Reader => ReadDispatch::Stale,
                }
            };
            match dispatch {
                ReadDispatch::Accept(idx) => self.on_acceptable(idx),
                ReadDispatch::Read => self.on_readable(slot),
                ReadDispatch::Stale => debug!(slot, "stale readable event ignored"),
            }
        }

        if ev.is_writable() {
            if ev.is_read_closed() || ev.is_error() {
                // Writable delivered together with a peer-close: never
                // attempt the send, just drop the arm and make sure the
                // record is torn down.
                let mut conn = self.pool.slot(slot).lock().unwrap();
                conn.send_armed = conn.send_armed.saturating_sub(1);
                if conn.stream.is_some() {
                    self.close_conn(slot, &mut conn);
                }
            } else {
                self.on_writable(slot);
            }
        }
    }

    fn on_acceptable(&self, listener_idx: usize) {
        let bound = &self.listeners[listener_idx];
        loop {
            match bound.listener.accept() {
                Ok((stream, peer)) => self.bind_accepted(listener_idx, stream, peer),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::ConnectionAborted => {
                    debug!(port = bound.port, "accept: connection aborted by peer");
                }
                Err(e) => {
                    warn!(port = bound.port, %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn bind_accepted(&self, listener_idx: usize, stream: TcpStream, peer: SocketAddr) {
        let Some(slot) = self.pool.checkout() else {
            // Soft failure: dropping the stream closes the fd.
            warn!(%peer, "accept: connection pool exhausted, closing");
            return;
        };
        let _ = stream.set_nodelay(true);
        if let Some(size) = self.socket_buf_size {
            set_socket_buf_size(stream.as_raw_fd(), size);
        }
        let fd = stream.as_raw_fd();

        let mut conn = self.pool.slot(slot).lock().unwrap();
        conn.bind_stream(stream, peer, listener_idx);
        match self.notifier.update(fd, Token(slot), Action::Add, EventFlags::READABLE, &mut conn) {
            Ok(()) => debug!(%peer, slot, "client connected"),
            Err(e) => {
                error!(%peer, %e, "accept: couldn't register the client socket");
                self.pool.defer_release(slot, &mut conn);
            }
        }
    }

    /// Drains the socket through the framing state machine until it blocks
    /// or the connection dies.
    fn on_readable(&self, slot: usize) {
        let cell = self.pool.slot(slot);
        let mut conn = cell.lock().unwrap();
        loop {
            if conn.stream.is_none() {
                return;
            }
            match recv_step(&mut conn) {
                RecvOutcome::Data(n) => self.advance_recv(slot, &mut conn, n),
                RecvOutcome::WouldBlock => return,
                RecvOutcome::Closed => {
                    debug!(slot, "peer closed the connection");
                    self.close_conn(slot, &mut conn);
                    return;
                }
                RecvOutcome::Failed(e) => {
                    if e.kind() == io::ErrorKind::ConnectionReset {
                        debug!(slot, "connection reset by peer");
                    } else {
                        warn!(slot, %e, "recv failed");
                    }
                    self.close_conn(slot, &mut conn);
                    return;
                }
            }
        }
    }

    /// Applies `n` received bytes to the state machine.
    fn advance_recv(&self, slot: usize, conn: &mut Conn, n: usize) {
        conn.recv_remaining -= n;
        match conn.recv_state {
            RecvState::HdrInit | RecvState::HdrPartial => {
                conn.hdr_have += n;
                if conn.recv_remaining == 0 {
                    self.on_header(slot, conn);
                } else {
                    conn.recv_state = RecvState::HdrPartial;
                }
            }
            RecvState::BodyInit | RecvState::BodyPartial => {
                if conn.recv_remaining == 0 {
                    self.deliver(conn);
                } else {
                    conn.recv_state = RecvState::BodyPartial;
                }
            }
        }
    }

    /// Header complete: validate, then allocate the envelope and move to
    /// the body phase. A framing violation discards the header and resets
    /// the machine without closing the connection.
    fn on_header(&self, slot: usize, conn: &mut Conn) {
        match FrameHeader::decode(&conn.header_buf) {
            Err(e) => {
                debug!(slot, %e, "framing violation, header discarded");
                conn.reset_recv();
            }
            Ok(header) => {
                let mut frame = vec![0_u8; header.total_len as usize];
                frame[..HEADER_LEN].copy_from_slice(&conn.header_buf);
                let env = Envelope { slot, sequence: conn.sequence, frame };
                if header.body_len() == 0 {
                    self.workers.dispatch(env);
                    conn.reset_recv();
                } else {
                    conn.inbound = Some(env);
                    conn.recv_state = RecvState::BodyInit;
                    conn.recv_remaining = header.body_len();
                }
            }
        }
    }

    fn deliver(&self, conn: &mut Conn) {
        let env = conn.inbound.take().expect("body phase implies an inbound buffer");
        self.workers.dispatch(env);
        conn.reset_recv();
    }

    fn on_writable(&self, slot: usize) {
        let mut conn = self.pool.slot(slot).lock().unwrap();
        if conn.stream.is_none() {
            return;
        }
        drive_send(slot, &mut conn, &self.notifier);
    }

    fn close_conn(&self, slot: usize, conn: &mut Conn) {
        if let Some(stream) = conn.stream.as_ref() {
            let fd = stream.as_raw_fd();
            // Best effort: a closed fd falls out of the notifier anyway.
            let _ = self.notifier.update(fd, Token(slot), Action::Del, EventFlags::empty(), conn);
        }
        self.pool.defer_release(slot, conn);
    }
}

enum RecvOutcome {
    Data(usize),
    WouldBlock,
    Closed,
    Failed(io::Error),
}

/// One non-blocking read into the buffer of the current receive phase.
/// `Interrupted` retries in place; it changes no state.
fn recv_step(conn: &mut Conn) -> RecvOutcome {
    let Conn { stream, recv_state, hdr_have, recv_remaining, header_buf, inbound, .. } = conn;
    let Some(stream) = stream.as_mut() else {
        return RecvOutcome::WouldBlock;
    };
    let buf: &mut [u8] = match recv_state {
        RecvState::HdrInit | RecvState::HdrPartial => &mut header_buf[*hdr_have..HEADER_LEN],
        RecvState::BodyInit | RecvState::BodyPartial => {
            let env = inbound.as_mut().expect("body phase implies an inbound buffer");
            let total = env.frame.len();
            &mut env.frame[total - *recv_remaining..]
        }
    };
    loop {
        match stream.read(buf) {
            Ok(0) => return RecvOutcome::Closed,
            Ok(n) => return RecvOutcome::Data(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return RecvOutcome::WouldBlock,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return RecvOutcome::Failed(e),
        }
    }
}

fn sender_loop(
    pool: &ConnPool,
    notifier: &Notifier,
    queue: &SendQueue,
    quit: &AtomicBool,
) {
    loop {
        queue.wait();
        if quit.load(Ordering::Relaxed) {
            break;
        }
        while let Some(env) = queue.try_pop() {
            let mut conn = pool.slot(env.slot).lock().unwrap();
            if conn.sequence != env.sequence {
                debug!(slot = env.slot, "sender: dropped stale message");
                continue;
            }
            if conn.send.is_some() || conn.send_armed > 0 {
                // The reactor owns the socket until the armed write drains;
                // park behind it to keep per-connection FIFO.
                conn.send_backlog.push_back(env);
                continue;
            }
            conn.send = Some(crate::conn::SendBuf::new(env.frame));
            drive_send(env.slot, &mut conn, notifier);
        }
    }
    debug!("sender thread exiting");
}

fn recycle_loop(pool: &ConnPool, quit: &AtomicBool) {
    while !quit.load(Ordering::Relaxed) {
        thread::sleep(RECYCLE_SCAN_INTERVAL);
        pool.release_expired(Instant::now());
    }
}

/// Sets kernel SO_SNDBUF and SO_RCVBUF on an accepted socket.
fn set_socket_buf_size(fd: RawFd, size: usize) {
    let size = size as libc::c_int;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            &size as *const _ as *const libc::c_void,
            core::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &size as *const _ as *const libc::c_void,
            core::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}
