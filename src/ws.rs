//! Minimal RFC 6455 client-side framing
//!
//! Shared by the CDP transport (Chrome DevTools socket) and the streaming
//! transcription client. Client frames are always masked; text, binary,
//! ping/pong and close opcodes are the only ones either peer uses.

use std::io::{Read, Write};
use std::net::TcpStream;

pub const OPCODE_TEXT: u8 = 0x1;
pub const OPCODE_BINARY: u8 = 0x2;
pub const OPCODE_CLOSE: u8 = 0x8;
pub const OPCODE_PING: u8 = 0x9;
pub const OPCODE_PONG: u8 = 0xA;

/// Write a single masked frame with the given opcode
pub fn write_frame(stream: &mut TcpStream, opcode: u8, data: &[u8]) -> std::io::Result<()> {
    let len = data.len();
    let mut frame = Vec::with_capacity(14 + len);

    // FIN + opcode
    frame.push(0x80 | opcode);

    // Mask bit set (client must mask), then length
    if len < 126 {
        frame.push(0x80 | len as u8);
    } else if len < 65536 {
        frame.push(0x80 | 126);
        frame.push((len >> 8) as u8);
        frame.push(len as u8);
    } else {
        frame.push(0x80 | 127);
        for i in (0..8).rev() {
            frame.push((len >> (i * 8)) as u8);
        }
    }

    // Random masking key per frame (RFC 6455 compliance)
    let mask: [u8; 4] = rand::random();
    frame.extend_from_slice(&mask);

    // Masked payload
    for (i, byte) in data.iter().enumerate() {
        frame.push(byte ^ mask[i % 4]);
    }

    stream.write_all(&frame)?;
    stream.flush()?;
    Ok(())
}

/// Write an empty close frame
pub fn write_close(stream: &mut TcpStream) -> std::io::Result<()> {
    let frame = [0x80 | OPCODE_CLOSE, 0x80, 0, 0, 0, 0];
    stream.write_all(&frame)?;
    stream.flush()?;
    Ok(())
}

/// Write an empty pong frame
pub fn write_pong(stream: &mut TcpStream) -> std::io::Result<()> {
    let frame = [0x80 | OPCODE_PONG, 0x80, 0, 0, 0, 0];
    stream.write_all(&frame)?;
    stream.flush()?;
    Ok(())
}

/// Read a frame, returns (opcode, payload)
pub fn read_frame(stream: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header)?;

    let opcode = header[0] & 0x0F;
    let masked = (header[1] & 0x80) != 0;
    let mut len = (header[1] & 0x7F) as usize;

    if len == 126 {
        let mut ext = [0u8; 2];
        stream.read_exact(&mut ext)?;
        len = ((ext[0] as usize) << 8) | (ext[1] as usize);
    } else if len == 127 {
        let mut ext = [0u8; 8];
        stream.read_exact(&mut ext)?;
        len = 0;
        for byte in ext.iter() {
            len = (len << 8) | (*byte as usize);
        }
    }

    let mask = if masked {
        let mut m = [0u8; 4];
        stream.read_exact(&mut m)?;
        Some(m)
    } else {
        None
    };

    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload)?;

    if let Some(mask) = mask {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= mask[i % 4];
        }
    }

    Ok((opcode, payload))
}

/// Split a `ws://host:port/path` URL into (host:port, /path)
pub fn split_url(ws_url: &str) -> (String, String) {
    let url = ws_url
        .trim_start_matches("ws://")
        .trim_start_matches("wss://");
    match url.split_once('/') {
        Some((host_port, path)) => (host_port.to_string(), format!("/{}", path)),
        None => (url.to_string(), "/".to_string()),
    }
}

/// Perform the client upgrade handshake on a freshly connected stream
pub fn client_handshake(stream: &mut TcpStream, host_port: &str, path: &str) -> std::io::Result<()> {
    let key = base64::Engine::encode(
        &base64::engine::general_purpose::STANDARD,
        rand::random::<[u8; 16]>(),
    );

    let handshake = format!(
        "GET {} HTTP/1.1\r\n\
         Host: {}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         \r\n",
        path, host_port, key
    );

    stream.write_all(handshake.as_bytes())?;

    // Read the response headers up to the blank line, byte by byte, so a
    // frame the server sends in the same segment is never consumed here
    let mut response = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !response.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte)?;
        response.push(byte[0]);
        if response.len() > 16 * 1024 {
            return Err(std::io::Error::other("oversized handshake response"));
        }
    }

    let response = String::from_utf8_lossy(&response);
    let status_line = response.lines().next().unwrap_or("");
    if !status_line.contains("101") {
        return Err(std::io::Error::other(format!(
            "WebSocket handshake failed: {}",
            status_line
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_url_with_path() {
        let (host, path) = split_url("ws://127.0.0.1:9222/devtools/browser/abc");
        assert_eq!(host, "127.0.0.1:9222");
        assert_eq!(path, "/devtools/browser/abc");
    }

    #[test]
    fn split_url_bare_host() {
        let (host, path) = split_url("ws://10.0.0.5:10095");
        assert_eq!(host, "10.0.0.5:10095");
        assert_eq!(path, "/");
    }

    #[test]
    fn split_url_secure_scheme() {
        let (host, path) = split_url("wss://asr.internal:443/stream");
        assert_eq!(host, "asr.internal:443");
        assert_eq!(path, "/stream");
    }

    #[test]
    fn handshake_leaves_following_frame_intact() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf);

            // Upgrade response and the first frame in one segment
            let mut segment =
                b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n"
                    .to_vec();
            segment.push(0x80 | OPCODE_TEXT);
            segment.push(2); // server frames are unmasked
            segment.extend_from_slice(b"hi");
            stream.write_all(&segment).unwrap();

            // Hold until the client is done
            let _ = stream.read(&mut buf);
        });

        let mut stream = TcpStream::connect(addr).unwrap();
        client_handshake(&mut stream, &addr.to_string(), "/").unwrap();

        let (opcode, payload) = read_frame(&mut stream).unwrap();
        assert_eq!(opcode, OPCODE_TEXT);
        assert_eq!(payload, b"hi");

        drop(stream);
        server.join().unwrap();
    }

    #[test]
    fn handshake_rejects_non_upgrade_status() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf);
            stream
                .write_all(b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n")
                .unwrap();
        });

        let mut stream = TcpStream::connect(addr).unwrap();
        assert!(client_handshake(&mut stream, &addr.to_string(), "/").is_err());
        server.join().unwrap();
    }
}
