use std::{
    io::{Read, Write},
    net::TcpStream,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use eddy::TcpServer;

const PORT: u16 = 24801;

fn connect_with_retry(port: u16) -> TcpStream {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match TcpStream::connect(("127.0.0.1", port)) {
            Ok(stream) => return stream,
            Err(err) => {
                assert!(Instant::now() < deadline, "couldn't connect: {err}");
                thread::sleep(Duration::from_millis(10));
            }
        }
    }
}

#[test]
fn echo_then_close() {
    let closed = Arc::new(AtomicUsize::new(0));
    let closed_hook = closed.clone();

    thread::spawn(move || {
        let mut server = TcpServer::new(PORT);
        server.set_message_callback(|conn, buf| {
            let data = buf.read_string(buf.readable_len());
            conn.send(data.as_bytes());
            conn.shutdown();
        });
        server.set_closed_callback(move |_conn| {
            closed_hook.fetch_add(1, Ordering::Relaxed);
        });
        server.start()
    });

    let mut stream = connect_with_retry(PORT);
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream.write_all(b"hello").unwrap();

    // The peer must deliver exactly the echo, then EOF.
    let mut got = Vec::new();
    stream.read_to_end(&mut got).unwrap();
    assert_eq!(got, b"hello");

    let deadline = Instant::now() + Duration::from_secs(5);
    while closed.load(Ordering::Relaxed) == 0 {
        assert!(Instant::now() < deadline, "closed callback never fired");
        thread::sleep(Duration::from_millis(10));
    }
    thread::sleep(Duration::from_millis(300));
    assert_eq!(closed.load(Ordering::Relaxed), 1, "closed callback must fire exactly once");
}

#[test]
fn repeated_shutdown_is_idempotent() {
    const PORT2: u16 = 24807;
    let closed = Arc::new(AtomicUsize::new(0));
    let closed_hook = closed.clone();

    thread::spawn(move || {
        let mut server = TcpServer::new(PORT2);
        server.set_message_callback(|conn, buf| {
            buf.consume(buf.readable_len());
            conn.shutdown();
            conn.shutdown();
            conn.shutdown();
        });
        server.set_closed_callback(move |_conn| {
            closed_hook.fetch_add(1, Ordering::Relaxed);
        });
        server.start()
    });

    let mut stream = connect_with_retry(PORT2);
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream.write_all(b"bye").unwrap();

    let mut got = Vec::new();
    stream.read_to_end(&mut got).unwrap();
    assert!(got.is_empty());

    let deadline = Instant::now() + Duration::from_secs(5);
    while closed.load(Ordering::Relaxed) == 0 {
        assert!(Instant::now() < deadline, "closed callback never fired");
        thread::sleep(Duration::from_millis(10));
    }
    thread::sleep(Duration::from_millis(300));
    assert_eq!(closed.load(Ordering::Relaxed), 1);
}
