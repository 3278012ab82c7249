#![allow(dead_code)]

use std::{
    io::{Read, Write},
    net::TcpStream,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use sluice_net::{
    Handler, ListenSock, Reply, Request, Server, ServerConfig,
    frame::{self, FrameHeader, HEADER_LEN},
};

/// Echoes every frame back unchanged.
pub struct Echo;

impl Handler for Echo {
    fn on_message(&self, req: Request<'_>) -> Option<Reply> {
        Some(Reply {
            msg_code: req.header.msg_code,
            crc32: req.header.crc32,
            body: req.body.to_vec(),
        })
    }
}

/// A live worker runtime on an ephemeral loopback port.
pub struct TestServer {
    pub port: u16,
    quit: Arc<AtomicBool>,
    reactor: JoinHandle<()>,
}

impl TestServer {
    pub fn start(cfg: &ServerConfig) -> Self {
        Self::start_with(cfg, Arc::new(Echo))
    }

    pub fn start_with(cfg: &ServerConfig, handler: Arc<dyn Handler>) -> Self {
        let socks = ListenSock::open_all(&[0]).expect("loopback listener");
        let port = socks[0].port();
        let quit = Arc::new(AtomicBool::new(false));
        let mut server =
            Server::bind(cfg, &socks, handler, Arc::clone(&quit)).expect("server bind");
        let reactor = thread::spawn(move || {
            server.run().expect("reactor run");
            server.shutdown();
        });
        Self { port, quit, reactor }
    }

    pub fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(("127.0.0.1", self.port)).expect("connect");
        stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        stream
    }

    pub fn stop(self) {
        self.quit.store(true, Ordering::Relaxed);
        self.reactor.join().expect("reactor thread");
    }
}

pub fn send_frame(stream: &mut TcpStream, msg_code: u16, body: &[u8]) {
    let frame = frame::encode_frame(msg_code, 0, body).unwrap();
    stream.write_all(&frame).unwrap();
}

pub fn read_frame(stream: &mut TcpStream) -> (FrameHeader, Vec<u8>) {
    let mut hdr = [0_u8; HEADER_LEN];
    stream.read_exact(&mut hdr).unwrap();
    let header = FrameHeader::decode(&hdr).unwrap();
    let mut body = vec![0_u8; header.body_len()];
    stream.read_exact(&mut body).unwrap();
    (header, body)
}
