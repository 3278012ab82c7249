use std::{
    collections::VecDeque,
    io,
    net::SocketAddr,
    sync::{
        Arc, Condvar, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread::{self, JoinHandle},
    time::Instant,
};

use tracing::{debug, error, warn};

use crate::{
    conn::Envelope,
    frame::{self, FrameHeader, HEADER_LEN},
    pool::ConnPool,
    sendq::SendQueue,
};

/// A fully framed inbound message handed to the application.
pub struct Request<'a> {
    pub header: FrameHeader,
    pub body: &'a [u8],
    pub peer_addr: Option<SocketAddr>,
}

/// Application reply; framed and queued for the originating connection.
pub struct Reply {
    pub msg_code: u16,
    pub crc32: u32,
    pub body: Vec<u8>,
}

/// Application seam. Implementations run on worker threads and must not
/// block on reactor-owned state.
pub trait Handler: Send + Sync + 'static {
    fn on_message(&self, req: Request<'_>) -> Option<Reply>;
}

struct WorkerSlot {
    cv: Condvar,
    /// True while this thread's condvar sits in the idle list; keeps a
    /// spuriously woken thread from listing itself twice.
    queued: AtomicBool,
}

struct Inner {
    queue: Mutex<VecDeque<Envelope>>,
    idle: Mutex<VecDeque<usize>>,
    slots: Vec<WorkerSlot>,
    busy: AtomicUsize,
    last_saturated: Mutex<Option<Instant>>,
    quit: Arc<AtomicBool>,
}

/// Fixed-size pool of request-processing threads.
///
/// One shared inbound queue, one condition variable per thread; an enqueue
/// wakes exactly one idle thread. Stale envelopes are freed without ever
/// reaching the application handler.
pub(crate) struct WorkerPool {
    inner: Arc<Inner>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn spawn(
        size: usize,
        handler: Arc<dyn Handler>,
        pool: Arc<ConnPool>,
        sendq: Arc<SendQueue>,
        quit: Arc<AtomicBool>,
    ) -> io::Result<Self> {
        let inner = Arc::new(Inner {
            queue: Mutex::new(VecDeque::new()),
            idle: Mutex::new(VecDeque::new()),
            slots: (0..size)
                .map(|_| WorkerSlot { cv: Condvar::new(), queued: AtomicBool::new(false) })
                .collect(),
            busy: AtomicUsize::new(0),
            last_saturated: Mutex::new(None),
            quit,
        });

        let mut handles = Vec::with_capacity(size);
        for id in 0..size {
            let inner = Arc::clone(&inner);
            let handler = Arc::clone(&handler);
            let pool = Arc::clone(&pool);
            let sendq = Arc::clone(&sendq);
            handles.push(
                thread::Builder::new()
                    .name(format!("sluice-worker-{id}"))
                    .spawn(move || worker_loop(id, &inner, handler.as_ref(), &pool, &sendq))?,
            );
        }
        Ok(Self { inner, handles })
    }

    /// Queues a decoded message and signals exactly one waiting thread.
    pub(crate) fn dispatch(&self, env: Envelope) {
        self.inner.queue.lock().unwrap().push_back(env);
        let id = self.inner.idle.lock().unwrap().pop_front();
        if let Some(id) = id {
            let slot = &self.inner.slots[id];
            slot.queued.store(false, Ordering::Relaxed);
            slot.cv.notify_one();
        }
    }

    /// Joins every thread. The caller has already flipped the quit flag.
    pub(crate) fn join(self) {
        let Self { inner, handles } = self;
        for slot in &inner.slots {
            slot.cv.notify_all();
        }
        for handle in handles {
            let _ = handle.join();
        }
        let dropped = inner.queue.lock().unwrap().len();
        if dropped > 0 {
            debug!(dropped, "workers: dropped unprocessed messages at shutdown");
        }
    }
}

fn worker_loop(
    id: usize,
    inner: &Inner,
    handler: &dyn Handler,
    pool: &ConnPool,
    sendq: &SendQueue,
) {
    loop {
        let env = {
            let mut queue = inner.queue.lock().unwrap();
            loop {
                if inner.quit.load(Ordering::Relaxed) {
                    return;
                }
                if let Some(env) = queue.pop_front() {
                    break env;
                }
                let me = &inner.slots[id];
                if !me.queued.swap(true, Ordering::Relaxed) {
                    inner.idle.lock().unwrap().push_back(id);
                }
                queue = me.cv.wait(queue).unwrap();
            }
        };

        let busy = inner.busy.fetch_add(1, Ordering::AcqRel) + 1;
        if busy == inner.slots.len() {
            *inner.last_saturated.lock().unwrap() = Some(Instant::now());
            warn!(threads = busy, "workers: every thread is busy");
        }
        process(&env, handler, pool, sendq);
        inner.busy.fetch_sub(1, Ordering::AcqRel);
    }
}

fn process(env: &Envelope, handler: &dyn Handler, pool: &ConnPool, sendq: &SendQueue) {
    // Staleness gate: the session this message belongs to may have been
    // torn down while the message sat in the queue.
    let peer_addr = {
        let conn = pool.slot(env.slot).lock().unwrap();
        if conn.sequence != env.sequence {
            debug!(slot = env.slot, "workers: dropped stale message");
            return;
        }
        conn.peer_addr
    };

    let header = match FrameHeader::decode(env.frame[..HEADER_LEN].try_into().unwrap()) {
        Ok(header) => header,
        Err(e) => {
            sluice_utils::broken_invariant!("workers: queued frame with invalid header: {e}");
            return;
        }
    };

    let reply = handler.on_message(Request { header, body: &env.frame[HEADER_LEN..], peer_addr });
    if let Some(reply) = reply {
        match frame::encode_frame(reply.msg_code, reply.crc32, &reply.body) {
            Ok(frame) => {
                sendq.push(Envelope { slot: env.slot, sequence: env.sequence, frame });
            }
            Err(e) => error!(slot = env.slot, %e, "workers: reply dropped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        thread::sleep,
        time::{Duration, Instant},
    };

    use super::*;

    struct Echo {
        calls: Mutex<Vec<Vec<u8>>>,
    }

    impl Handler for Echo {
        fn on_message(&self, req: Request<'_>) -> Option<Reply> {
            self.calls.lock().unwrap().push(req.body.to_vec());
            Some(Reply { msg_code: req.header.msg_code, crc32: req.header.crc32, body: req.body.to_vec() })
        }
    }

    fn wait_for<T>(deadline: Duration, mut probe: impl FnMut() -> Option<T>) -> T {
        let start = Instant::now();
        loop {
            if let Some(v) = probe() {
                return v;
            }
            assert!(start.elapsed() < deadline, "probe timed out");
            sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn dispatch_runs_the_handler_and_queues_the_reply() {
        let pool = Arc::new(ConnPool::new(1, Duration::from_secs(0)));
        let slot = pool.checkout().unwrap();
        let sequence = pool.slot(slot).lock().unwrap().sequence;

        let handler = Arc::new(Echo { calls: Mutex::new(Vec::new()) });
        let sendq = Arc::new(SendQueue::new());
        let quit = Arc::new(AtomicBool::new(false));
        let workers = WorkerPool::spawn(
            2,
            Arc::clone(&handler) as Arc<dyn Handler>,
            Arc::clone(&pool),
            Arc::clone(&sendq),
            Arc::clone(&quit),
        )
        .unwrap();

        let frame = frame::encode_frame(9, 0, b"ping").unwrap();
        workers.dispatch(Envelope { slot, sequence, frame: frame.clone() });

        let reply = wait_for(Duration::from_secs(2), || sendq.try_pop());
        assert_eq!(reply.slot, slot);
        assert_eq!(reply.sequence, sequence);
        assert_eq!(reply.frame, frame);
        assert_eq!(handler.calls.lock().unwrap().len(), 1);

        quit.store(true, Ordering::Relaxed);
        workers.join();
    }

    #[test]
    fn stale_message_never_reaches_the_handler() {
        let pool = Arc::new(ConnPool::new(1, Duration::from_secs(0)));
        let slot = pool.checkout().unwrap();
        let sequence = pool.slot(slot).lock().unwrap().sequence;

        let handler = Arc::new(Echo { calls: Mutex::new(Vec::new()) });
        let sendq = Arc::new(SendQueue::new());
        let quit = Arc::new(AtomicBool::new(false));
        let workers = WorkerPool::spawn(
            1,
            Arc::clone(&handler) as Arc<dyn Handler>,
            Arc::clone(&pool),
            Arc::clone(&sendq),
            Arc::clone(&quit),
        )
        .unwrap();

        let frame = frame::encode_frame(9, 0, b"old session").unwrap();
        workers.dispatch(Envelope { slot, sequence: sequence + 1, frame });

        sleep(Duration::from_millis(100));
        assert!(handler.calls.lock().unwrap().is_empty());
        assert!(sendq.try_pop().is_none());

        quit.store(true, Ordering::Relaxed);
        workers.join();
    }
}
