//! End-to-end: loop + server + plain std TCP clients.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;

use loopnet_reactor::{EventLoop, LoopHandle, PollDriver};
use loopnet_tcp::TcpServer;

fn start_loop() -> (LoopHandle, thread::JoinHandle<()>) {
    let mut el = EventLoop::new(Box::new(PollDriver::new())).unwrap();
    let handle = el.handle();
    let join = thread::spawn(move || el.run().unwrap());
    (handle, join)
}

fn echo_server(handle: &LoopHandle) -> std::sync::Arc<TcpServer> {
    let server = TcpServer::bind(handle.clone(), 0).unwrap();
    server.set_on_message(Box::new(|conn, bytes| {
        // Echo straight back. Called on the loop thread, so a direct
        // write is legal here.
        let _ = conn.write(Bytes::copy_from_slice(bytes), None);
    }));
    server.start();
    server
}

#[test]
fn test_echo_round_trip() {
    let (handle, join) = start_loop();
    let server = echo_server(&handle);

    let mut client = TcpStream::connect(("127.0.0.1", server.port())).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();

    client.write_all(b"hello loopnet").unwrap();
    let mut back = vec![0u8; 13];
    client.read_exact(&mut back).unwrap();
    assert_eq!(&back, b"hello loopnet");

    // Second round on the same connection.
    client.write_all(b"again").unwrap();
    let mut back = vec![0u8; 5];
    client.read_exact(&mut back).unwrap();
    assert_eq!(&back, b"again");

    handle.stop();
    join.join().unwrap();
}

#[test]
fn test_client_disconnect_retires_connection() {
    let (handle, join) = start_loop();
    let server = echo_server(&handle);

    let mut client = TcpStream::connect(("127.0.0.1", server.port())).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    client.write_all(b"ping").unwrap();
    let mut back = vec![0u8; 4];
    client.read_exact(&mut back).unwrap();
    assert_eq!(server.connection_count(), 1);

    drop(client);

    // EOF → shutdown handshake → close → registry entry removed.
    let deadline = Instant::now() + Duration::from_secs(2);
    while server.connection_count() != 0 {
        assert!(Instant::now() < deadline, "connection was not retired");
        thread::sleep(Duration::from_millis(10));
    }

    handle.stop();
    join.join().unwrap();
}

#[test]
fn test_two_concurrent_clients() {
    let (handle, join) = start_loop();
    let server = echo_server(&handle);
    let port = server.port();

    let workers: Vec<_> = (0..2)
        .map(|i| {
            thread::spawn(move || {
                let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
                client
                    .set_read_timeout(Some(Duration::from_secs(2)))
                    .unwrap();
                let msg = format!("client-{}", i);
                client.write_all(msg.as_bytes()).unwrap();
                let mut back = vec![0u8; msg.len()];
                client.read_exact(&mut back).unwrap();
                assert_eq!(back, msg.as_bytes());
            })
        })
        .collect();

    for w in workers {
        w.join().unwrap();
    }

    handle.stop();
    join.join().unwrap();
}
