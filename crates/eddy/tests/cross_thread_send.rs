use std::{
    io::{Read, Write},
    net::TcpStream,
    sync::{Arc, Mutex},
    thread::{self, ThreadId},
    time::{Duration, Instant},
};

use eddy::{Connection, TcpServer};

const PORT: u16 = 24805;

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

/// `send` from a foreign thread wakes the idle loop and the bytes reach
/// the peer; callbacks keep running on the owning loop thread only.
#[test]
fn send_from_background_thread() {
    let slot: Arc<Mutex<Option<Arc<Connection>>>> = Arc::new(Mutex::new(None));
    let loop_thread: Arc<Mutex<Option<ThreadId>>> = Arc::new(Mutex::new(None));
    let message_thread: Arc<Mutex<Option<ThreadId>>> = Arc::new(Mutex::new(None));

    let on_connected_slot = slot.clone();
    let on_connected_thread = loop_thread.clone();
    let on_message_thread = message_thread.clone();

    thread::spawn(move || {
        let mut server = TcpServer::new(PORT);
        server.set_thread_count(2);
        server.set_connected_callback(move |conn| {
            *on_connected_thread.lock().unwrap() = Some(thread::current().id());
            *on_connected_slot.lock().unwrap() = Some(conn.clone());
        });
        server.set_message_callback(move |conn, buf| {
            *on_message_thread.lock().unwrap() = Some(thread::current().id());
            let data = buf.read_string(buf.readable_len());
            conn.send(data.as_bytes());
        });
        server.start()
    });

    let mut stream = connect_with_retry(PORT);
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    // Grab the server-side handle published by the connected callback.
    let conn = {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(conn) = slot.lock().unwrap().clone() {
                break conn;
            }
            assert!(Instant::now() < deadline, "connected callback never fired");
            thread::sleep(Duration::from_millis(5));
        }
    };

    // The owning loop is parked in poll; this send must wake it.
    let sender = thread::spawn(move || conn.send(b"X"));
    sender.join().unwrap();

    let mut byte = [0u8; 1];
    stream.read_exact(&mut byte).unwrap();
    assert_eq!(&byte, b"X");

    // A round trip through the message callback stays on the loop.
    stream.write_all(b"ping").unwrap();
    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"ping");

    let loop_id = loop_thread.lock().unwrap().expect("connected callback recorded no thread");
    let msg_id = message_thread.lock().unwrap().expect("message callback recorded no thread");
    assert_eq!(loop_id, msg_id, "callbacks must stay on the owning loop thread");
    assert_ne!(thread::current().id(), loop_id);
}
