//! Executor length-framing, end to end against a real TCP socket.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;

use nx_remote_controller_daemon::config::DaemonConfig;
use nx_remote_controller_daemon::connstate::ConnState;
use nx_remote_controller_daemon::executor;

fn test_config() -> DaemonConfig {
    let mut config = DaemonConfig::default();
    // `cat` always exists and happily sits on a stdin pipe, standing in for
    // the real input-injection helper the daemon would chroot-spawn.
    config.input_injector_command = vec!["cat".to_string()];
    config
}

#[test]
fn echo_command_is_length_framed() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let config = test_config();

    let server_thread = std::thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let state = Arc::new(ConnState::new());
        // The session ends when the client disconnects, which surfaces as
        // a read error here; that's expected and not asserted on.
        let _ = executor::handle(stream, state, &config);
    });

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"$echo hello\n").unwrap();

    let mut len_buf = [0u8; 4];
    client.read_exact(&mut len_buf).unwrap();
    let len = u32::from_be_bytes(len_buf) as usize;
    assert_eq!(len, 6);

    let mut body = vec![0u8; len];
    client.read_exact(&mut body).unwrap();
    assert_eq!(&body, b"hello\n");

    let mut terminator = [0u8; 4];
    client.read_exact(&mut terminator).unwrap();
    assert_eq!(u32::from_be_bytes(terminator), 0);

    drop(client);
    // The worker thread's loop will error out once the socket closes; we
    // don't join it, the thread exits on its own.
    std::mem::drop(server_thread);
}
