use std::{
    net::TcpStream,
    sync::{Arc, Mutex},
    thread::{self, ThreadId},
    time::{Duration, Instant},
};

use eddy::TcpServer;

const PORT: u16 = 24804;

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

/// With two workers, consecutive connections land on alternating loop
/// threads, and every callback for one connection stays on its loop.
#[test]
fn connections_alternate_over_worker_loops() {
    let seen: Arc<Mutex<Vec<ThreadId>>> = Arc::new(Mutex::new(Vec::new()));
    let on_connected = seen.clone();

    thread::spawn(move || {
        let mut server = TcpServer::new(PORT);
        server.set_thread_count(2);
        server.set_connected_callback(move |_conn| {
            on_connected.lock().unwrap().push(thread::current().id());
        });
        server.set_message_callback(|_conn, buf| buf.consume(buf.readable_len()));
        server.start()
    });

    let mut streams = Vec::new();
    for i in 0..4 {
        streams.push(connect_with_retry(PORT));
        // Wait for this connection's placement before opening the next,
        // so the recorded order matches the accept order.
        let deadline = Instant::now() + Duration::from_secs(5);
        while seen.lock().unwrap().len() <= i {
            assert!(Instant::now() < deadline, "connected callback {i} never fired");
            thread::sleep(Duration::from_millis(5));
        }
    }

    let ids = seen.lock().unwrap().clone();
    assert_eq!(ids.len(), 4);
    assert_ne!(ids[0], ids[1], "both workers should host connections");
    assert_eq!(ids[0], ids[2], "placement should wrap around");
    assert_eq!(ids[1], ids[3], "placement should wrap around");
}
