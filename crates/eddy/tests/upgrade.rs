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

use eddy::{Context, TcpServer};

const PORT: u16 = 24806;

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

/// Upgrading inside a message callback routes the next inbound bytes to
/// the new callback set without re-firing `connected`.
#[test]
fn upgrade_swaps_the_callback_set() {
    let v1_messages = Arc::new(AtomicUsize::new(0));
    let v2_connected = Arc::new(AtomicUsize::new(0));

    let v1_hits = v1_messages.clone();
    let v2_conn_hits = v2_connected.clone();

    thread::spawn(move || {
        let mut server = TcpServer::new(PORT);
        server.set_message_callback(move |conn, buf| {
            v1_hits.fetch_add(1, Ordering::Relaxed);
            buf.consume(buf.readable_len());

            let v2_conn_hits = v2_conn_hits.clone();
            conn.upgrade(
                Context::new(2u32),
                move |_conn| {
                    v2_conn_hits.fetch_add(1, Ordering::Relaxed);
                },
                |conn, buf| {
                    let version = *conn.context().get::<u32>();
                    let data = buf.read_string(buf.readable_len());
                    conn.send(format!("v{version}:{data}").as_bytes());
                },
                |_conn| {},
                |_conn| {},
            );
            conn.send(b"ok");
        });
        server.start()
    });

    let mut stream = connect_with_retry(PORT);
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    stream.write_all(b"a").unwrap();
    let mut ack = [0u8; 2];
    stream.read_exact(&mut ack).unwrap();
    assert_eq!(&ack, b"ok");

    // The reply proves the upgrade completed, so this lands on v2.
    stream.write_all(b"b").unwrap();
    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"v2:b");

    assert_eq!(v1_messages.load(Ordering::Relaxed), 1, "old message callback ran again");
    assert_eq!(v2_connected.load(Ordering::Relaxed), 0, "connected must not re-fire on upgrade");
}
