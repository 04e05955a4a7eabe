//! Shared helpers for tests: canned providers and tiny in-process HTTP
//! servers standing in for real LLM endpoints.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::core::provider::Provider;

pub fn sample_provider() -> Provider {
    Provider {
        name: "demo".into(),
        display_name: "Demo".into(),
        base_url: "https://demo.example/v1".into(),
        api_key: "sk-demo".into(),
        default_model: "demo-mini".into(),
        models: Vec::new(),
        mode: None,
        supports_vision: false,
        system_prompt_style: None,
        lists_models: true,
        free_model_suffix: None,
        auto_model: None,
        builtin: false,
    }
}

/// One step of a scripted SSE response.
pub enum SseAction {
    /// Write one `data:` line carrying this payload.
    Event(String),
    /// Injected delay between increments.
    Delay(Duration),
    /// Drop the connection mid-body, simulating an upstream failure.
    Abort,
}

/// Serve a single streaming request with a scripted SSE body, using
/// chunked transfer encoding so an abort registers as a broken body rather
/// than a clean close. Returns the provider base URL.
pub async fn spawn_sse_server(actions: Vec<SseAction>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let Ok((mut socket, _)) = listener.accept().await else {
            return;
        };
        if read_http_request(&mut socket).await.is_err() {
            return;
        }

        let head = "HTTP/1.1 200 OK\r\n\
                    Content-Type: text/event-stream\r\n\
                    Transfer-Encoding: chunked\r\n\r\n";
        if socket.write_all(head.as_bytes()).await.is_err() {
            return;
        }

        for action in actions {
            match action {
                SseAction::Event(payload) => {
                    let frame = format!("data: {payload}\n\n");
                    if write_chunk(&mut socket, &frame).await.is_err() {
                        return;
                    }
                }
                SseAction::Delay(duration) => tokio::time::sleep(duration).await,
                SseAction::Abort => return,
            }
        }

        let _ = socket.write_all(b"0\r\n\r\n").await;
        let _ = socket.flush().await;
    });

    format!("http://{addr}/v1")
}

/// Serve any number of requests with a fixed JSON response. Returns the
/// provider base URL.
pub async fn spawn_json_server(status: u16, body: String) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let body = body.clone();
            tokio::spawn(async move {
                if read_http_request(&mut socket).await.is_err() {
                    return;
                }
                let response = format!(
                    "HTTP/1.1 {status} Scripted\r\n\
                     Content-Type: application/json\r\n\
                     Content-Length: {}\r\n\
                     Connection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.flush().await;
            });
        }
    });

    format!("http://{addr}/v1")
}

async fn read_http_request(socket: &mut TcpStream) -> std::io::Result<()> {
    let mut buf: Vec<u8> = Vec::new();
    let mut tmp = [0u8; 1024];

    let header_end = loop {
        let n = socket.read(&mut tmp).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&tmp[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let headers = String::from_utf8_lossy(&buf[..header_end]).to_ascii_lowercase();
    let content_length = headers
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(0);

    let mut body_read = buf.len() - header_end;
    while body_read < content_length {
        let n = socket.read(&mut tmp).await?;
        if n == 0 {
            break;
        }
        body_read += n;
    }
    Ok(())
}

async fn write_chunk(socket: &mut TcpStream, data: &str) -> std::io::Result<()> {
    let frame = format!("{:X}\r\n{data}\r\n", data.len());
    socket.write_all(frame.as_bytes()).await?;
    socket.flush().await
}
