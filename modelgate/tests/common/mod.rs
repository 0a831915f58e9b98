#![allow(dead_code)]

use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

pub fn sse(event: &str, data: &str) -> String {
    format!("event: {event}\ndata: {data}\n\n")
}

pub fn data(json: &str) -> String {
    format!("data: {json}\n\n")
}

/// What the raw server does once it has read a request.
#[derive(Clone)]
pub enum Script {
    /// Write each piece separately, pausing between them, then close.
    Pieces(Vec<Vec<u8>>),
    /// Write the pieces, then keep the connection open without writing
    /// until the client goes away.
    PiecesThenHang(Vec<Vec<u8>>),
}

/// A one-connection-at-a-time HTTP/1.1 server with full control over how
/// the response body is split across writes. Returns its base URL.
pub async fn raw_server(content_type: &'static str, script: Script) -> String {
    raw_server_with_close(content_type, script).await.0
}

/// Like [`raw_server`], also reporting each connection once it is finished
/// with, either because the script ended or the client hung up.
pub async fn raw_server_with_close(
    content_type: &'static str,
    script: Script,
) -> (String, mpsc::UnboundedReceiver<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (closed_tx, closed_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let script = script.clone();
            let closed = closed_tx.clone();
            tokio::spawn(async move {
                serve(socket, content_type, script).await;
                let _ = closed.send(());
            });
        }
    });
    (format!("http://{addr}"), closed_rx)
}

async fn serve(mut socket: TcpStream, content_type: &str, script: Script) {
    read_request(&mut socket).await;
    let head = format!(
        "HTTP/1.1 200 OK\r\ncontent-type: {content_type}\r\nconnection: close\r\n\r\n"
    );
    if socket.write_all(head.as_bytes()).await.is_err() {
        return;
    }
    let (pieces, hang) = match script {
        Script::Pieces(p) => (p, false),
        Script::PiecesThenHang(p) => (p, true),
    };
    for piece in pieces {
        if socket.write_all(&piece).await.is_err() || socket.flush().await.is_err() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(15)).await;
    }
    if hang {
        // The client sends nothing more; a read returns only once it hangs up.
        let mut rest = [0u8; 1];
        let _ = tokio::time::timeout(Duration::from_secs(3600), socket.read(&mut rest)).await;
        return;
    }
    let _ = socket.shutdown().await;
}

/// Consume headers and a `content-length` body.
async fn read_request(socket: &mut TcpStream) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };
    let head = String::from_utf8_lossy(&buf[..header_end]).to_ascii_lowercase();
    let length = head
        .lines()
        .find_map(|l| l.strip_prefix("content-length:"))
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);
    while buf.len() < header_end + length {
        match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
}

/// Split `bytes` into pieces at the given offsets.
pub fn split_at(bytes: &[u8], cuts: &[usize]) -> Vec<Vec<u8>> {
    let mut pieces = Vec::new();
    let mut start = 0;
    for &cut in cuts {
        pieces.push(bytes[start..cut].to_vec());
        start = cut;
    }
    pieces.push(bytes[start..].to_vec());
    pieces
}
