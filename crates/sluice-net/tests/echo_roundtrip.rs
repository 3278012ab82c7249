mod support;

use std::{io::Write, thread, time::Duration};

use sluice_net::{ServerConfig, frame};
use support::{TestServer, read_frame, send_frame};

fn small_server() -> TestServer {
    TestServer::start(&ServerConfig {
        worker_connections: 16,
        recycle_dwell: Duration::from_secs(60),
        worker_threads: 1,
        socket_buf_size: None,
    })
}

#[test]
fn frame_chunked_one_byte_at_a_time_arrives_whole() {
    let server = small_server();
    let mut client = server.connect();

    let body: Vec<u8> = (0..192).map(|i| i as u8).collect();
    let frame = frame::encode_frame(3, 0xabcd, &body).unwrap();
    assert_eq!(frame.len(), 200);
    for byte in &frame {
        client.write_all(std::slice::from_ref(byte)).unwrap();
        thread::sleep(Duration::from_micros(200));
    }

    let (header, echoed) = read_frame(&mut client);
    assert_eq!(header.msg_code, 3);
    assert_eq!(header.crc32, 0xabcd);
    assert_eq!(echoed, body);

    server.stop();
}

#[test]
fn header_only_frame_round_trips() {
    let server = small_server();
    let mut client = server.connect();

    send_frame(&mut client, 42, b"");
    let (header, body) = read_frame(&mut client);
    assert_eq!(header.msg_code, 42);
    assert!(body.is_empty());

    server.stop();
}

#[test]
fn pipelined_frames_come_back_in_order() {
    let server = small_server();
    let mut client = server.connect();

    let mut expected = Vec::new();
    let mut wire = Vec::new();
    for i in 0..10_u16 {
        let body = format!("request-{i}").into_bytes();
        wire.extend_from_slice(&frame::encode_frame(i, 0, &body).unwrap());
        expected.push((i, body));
    }
    client.write_all(&wire).unwrap();

    for (code, body) in expected {
        let (header, echoed) = read_frame(&mut client);
        assert_eq!(header.msg_code, code);
        assert_eq!(echoed, body);
    }

    server.stop();
}

#[test]
fn two_clients_are_served_independently() {
    let server = small_server();
    let mut a = server.connect();
    let mut b = server.connect();

    send_frame(&mut a, 1, b"from-a");
    send_frame(&mut b, 2, b"from-b");

    let (ha, body_a) = read_frame(&mut a);
    let (hb, body_b) = read_frame(&mut b);
    assert_eq!((ha.msg_code, body_a.as_slice()), (1, b"from-a".as_slice()));
    assert_eq!((hb.msg_code, body_b.as_slice()), (2, b"from-b".as_slice()));

    server.stop();
}
