//! Minimal client for the adb server smart-socket protocol, used to check the
//! local daemon without spawning the CLI.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::time::Duration;

pub fn encode_request(payload: &str) -> String {
    format!("{:04x}{payload}", payload.len())
}

/// Sends `host:version` to the daemon on `port` and returns the protocol version.
pub fn query_server_version(port: u16, timeout: Duration) -> Result<u32, String> {
    let address = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let mut stream = TcpStream::connect_timeout(&address, timeout)
        .map_err(|err| format!("adb server unreachable on port {port}: {err}"))?;
    stream
        .set_read_timeout(Some(timeout))
        .and_then(|_| stream.set_write_timeout(Some(timeout)))
        .map_err(|err| format!("failed to configure adb server socket: {err}"))?;

    stream
        .write_all(encode_request("host:version").as_bytes())
        .map_err(|err| format!("failed to write to adb server: {err}"))?;

    let mut status = [0u8; 4];
    stream
        .read_exact(&mut status)
        .map_err(|err| format!("failed to read adb server status: {err}"))?;
    if &status != b"OKAY" {
        return Err(format!(
            "adb server answered {}",
            String::from_utf8_lossy(&status)
        ));
    }

    let length = read_hex4(&mut stream)?;
    let mut payload = vec![0u8; length as usize];
    stream
        .read_exact(&mut payload)
        .map_err(|err| format!("failed to read adb server payload: {err}"))?;
    let text = String::from_utf8_lossy(&payload);
    u32::from_str_radix(text.trim(), 16).map_err(|_| format!("unexpected version payload: {text}"))
}

fn read_hex4(stream: &mut TcpStream) -> Result<u32, String> {
    let mut raw = [0u8; 4];
    stream
        .read_exact(&mut raw)
        .map_err(|err| format!("failed to read adb server length: {err}"))?;
    let text = String::from_utf8_lossy(&raw);
    u32::from_str_radix(&text, 16).map_err(|_| format!("invalid length prefix: {text}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn encodes_length_prefix() {
        assert_eq!(encode_request("host:version"), "000chost:version");
        assert_eq!(encode_request("host:devices-l"), "000ehost:devices-l");
    }

    #[test]
    fn reads_version_from_fake_server() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let server = thread::spawn(move || {
            let (mut socket, _) = listener.accept().expect("accept");
            let mut request = [0u8; 16];
            socket.read_exact(&mut request).expect("request");
            assert_eq!(&request, b"000chost:version");
            socket.write_all(b"OKAY00040029").expect("reply");
        });
        let version = query_server_version(port, Duration::from_secs(2)).expect("version");
        server.join().expect("join");
        assert_eq!(version, 0x29);
    }

    #[test]
    fn failure_status_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let server = thread::spawn(move || {
            let (mut socket, _) = listener.accept().expect("accept");
            let mut request = [0u8; 16];
            let _ = socket.read_exact(&mut request);
            socket.write_all(b"FAIL0004nope").expect("reply");
        });
        let err = query_server_version(port, Duration::from_secs(2)).expect_err("fail");
        server.join().expect("join");
        assert!(err.contains("FAIL"));
    }

    #[test]
    fn closed_port_is_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);
        assert!(query_server_version(port, Duration::from_millis(300)).is_err());
    }
}
