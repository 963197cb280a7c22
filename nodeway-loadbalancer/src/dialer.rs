//! Outbound connections to backend servers

use std::io;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::http_proxy::{self, HttpProxy};

/// Upper bound on a proxy's CONNECT response head
const MAX_CONNECT_RESPONSE: usize = 8 * 1024;

/// Connect to `address`, through the installed HTTP proxy if there is one.
pub async fn dial(address: &str, timeout: Duration) -> io::Result<TcpStream> {
    let connect = async {
        match http_proxy::configured() {
            Some(proxy) => connect_via_proxy(proxy, address).await,
            None => TcpStream::connect(address).await,
        }
    };

    tokio::time::timeout(timeout, connect)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("dial {address} timed out")))?
}

/// Open a tunnel to `address` with `CONNECT`.
pub(crate) async fn connect_via_proxy(proxy: &HttpProxy, address: &str) -> io::Result<TcpStream> {
    let mut stream = TcpStream::connect(&proxy.address).await?;

    let mut request = format!("CONNECT {address} HTTP/1.1\r\nHost: {address}\r\n");
    if let Some(credentials) = &proxy.authorization {
        request.push_str(&format!("Proxy-Authorization: Basic {credentials}\r\n"));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;

    let head = read_response_head(&mut stream).await?;
    let status = parse_status(&head).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("malformed CONNECT response from proxy {}", proxy.address),
        )
    })?;
    if status != 200 {
        return Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            format!("proxy {} refused CONNECT {address}: status {status}", proxy.address),
        ));
    }

    Ok(stream)
}

/// Read up to the blank line ending the response head, one byte at a time
/// so no tunnelled bytes are consumed.
async fn read_response_head(stream: &mut TcpStream) -> io::Result<String> {
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if stream.read(&mut byte).await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "proxy closed connection during CONNECT",
            ));
        }
        head.push(byte[0]);
        if head.len() > MAX_CONNECT_RESPONSE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "CONNECT response head too large",
            ));
        }
    }
    Ok(String::from_utf8_lossy(&head).into_owned())
}

/// Status code from `HTTP/1.x <code> <reason>`
fn parse_status(head: &str) -> Option<u16> {
    let status_line = head.lines().next()?;
    let mut parts = status_line.split_whitespace();
    if !parts.next()?.starts_with("HTTP/") {
        return None;
    }
    parts.next()?.parse().ok()
}
