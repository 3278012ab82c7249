mod support;

use std::{io::Write, time::Duration};

use sluice_net::{
    ServerConfig,
    frame::{self, HEADER_LEN, MAX_FRAME_LEN},
};
use support::{TestServer, read_frame};

fn server() -> TestServer {
    TestServer::start(&ServerConfig {
        worker_connections: 8,
        recycle_dwell: Duration::from_secs(60),
        worker_threads: 2,
        socket_buf_size: None,
    })
}

fn raw_header(total_len: u16) -> [u8; HEADER_LEN] {
    let mut header = [0_u8; HEADER_LEN];
    header[..2].copy_from_slice(&total_len.to_be_bytes());
    header
}

#[test]
fn oversize_frame_is_discarded_and_the_connection_survives() {
    let server = server();
    let mut client = server.connect();

    client.write_all(&raw_header((MAX_FRAME_LEN + 1) as u16)).unwrap();
    let valid = frame::encode_frame(5, 0, b"still here").unwrap();
    client.write_all(&valid).unwrap();

    let (header, body) = read_frame(&mut client);
    assert_eq!(header.msg_code, 5);
    assert_eq!(body, b"still here");

    server.stop();
}

#[test]
fn undersize_total_len_is_discarded_and_the_connection_survives() {
    let server = server();
    let mut client = server.connect();

    client.write_all(&raw_header(3)).unwrap();
    let valid = frame::encode_frame(6, 0, b"recovered").unwrap();
    client.write_all(&valid).unwrap();

    let (header, body) = read_frame(&mut client);
    assert_eq!(header.msg_code, 6);
    assert_eq!(body, b"recovered");

    server.stop();
}

/// Forces an RST (instead of a graceful FIN) when the stream drops.
fn set_linger_zero(stream: &std::net::TcpStream) {
    use std::os::fd::AsRawFd;
    let linger = libc::linger { l_onoff: 1, l_linger: 0 };
    let rc = unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            &linger as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::linger>() as libc::socklen_t,
        )
    };
    assert_eq!(rc, 0);
}

#[test]
fn abrupt_reset_mid_frame_is_survived() {
    let server = server();

    {
        let mut doomed = server.connect();
        set_linger_zero(&doomed);
        // Header promising a body that never comes.
        let header = frame::encode_frame(9, 0, b"xxxxxxxx").unwrap();
        doomed.write_all(&header[..HEADER_LEN + 3]).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        // Dropping the stream now sends an RST mid-frame.
    }

    // The worker keeps serving other clients.
    let mut client = server.connect();
    support::send_frame(&mut client, 7, b"alive");
    let (header, body) = read_frame(&mut client);
    assert_eq!(header.msg_code, 7);
    assert_eq!(body, b"alive");

    server.stop();
}
