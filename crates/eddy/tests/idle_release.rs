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

/// A silent client gets reaped at roughly the configured idle timeout.
#[test]
fn silent_connection_is_reaped() {
    const PORT: u16 = 24802;
    let closed = Arc::new(AtomicUsize::new(0));
    let closed_hook = closed.clone();

    thread::spawn(move || {
        let mut server = TcpServer::new(PORT);
        server.set_thread_count(1);
        server.enable_inactive_release(2);
        server.set_message_callback(|_conn, buf| buf.consume(buf.readable_len()));
        server.set_closed_callback(move |_conn| {
            closed_hook.fetch_add(1, Ordering::Relaxed);
        });
        server.start()
    });

    let mut stream = connect_with_retry(PORT);
    let connected_at = Instant::now();
    stream.set_read_timeout(Some(Duration::from_secs(8))).unwrap();

    // Send nothing; the read should end in EOF once the reaper fires.
    let mut buf = [0u8; 16];
    let n = stream.read(&mut buf).expect("expected EOF, got a read error");
    assert_eq!(n, 0, "expected EOF from the idle reaper");

    let elapsed = connected_at.elapsed();
    assert!(elapsed >= Duration::from_secs(1), "reaped too early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(6), "reaped too late: {elapsed:?}");

    let deadline = Instant::now() + Duration::from_secs(2);
    while closed.load(Ordering::Relaxed) == 0 {
        assert!(Instant::now() < deadline, "closed callback never fired");
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(closed.load(Ordering::Relaxed), 1);
}

/// Steady traffic keeps refreshing the idle timer; the reaper only
/// fires once the client goes quiet.
#[test]
fn activity_defers_the_reaper() {
    const PORT: u16 = 24803;
    let closed = Arc::new(AtomicUsize::new(0));
    let closed_hook = closed.clone();

    thread::spawn(move || {
        let mut server = TcpServer::new(PORT);
        server.set_thread_count(1);
        server.enable_inactive_release(2);
        server.set_message_callback(|_conn, buf| buf.consume(buf.readable_len()));
        server.set_closed_callback(move |_conn| {
            closed_hook.fetch_add(1, Ordering::Relaxed);
        });
        server.start()
    });

    let mut stream = connect_with_retry(PORT);
    let started_at = Instant::now();

    // One byte per second for five seconds; every write must land on a
    // live connection.
    for _ in 0..5 {
        stream.write_all(b".").expect("connection reaped during activity");
        thread::sleep(Duration::from_secs(1));
    }
    assert_eq!(closed.load(Ordering::Relaxed), 0, "reaped while active");

    stream.set_read_timeout(Some(Duration::from_secs(8))).unwrap();
    let mut buf = [0u8; 16];
    let n = stream.read(&mut buf).expect("expected EOF after going quiet");
    assert_eq!(n, 0);

    let elapsed = started_at.elapsed();
    assert!(elapsed >= Duration::from_secs(5), "reaped before the quiet period: {elapsed:?}");

    let deadline = Instant::now() + Duration::from_secs(2);
    while closed.load(Ordering::Relaxed) == 0 {
        assert!(Instant::now() < deadline, "closed callback never fired");
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(closed.load(Ordering::Relaxed), 1);
}
