use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Auxiliary;
use crate::endpoint::wire::SipCodec;
use crate::endpoint::Message;

/// Mock SIP server over TCP.
///
/// Every request received is queued for the test to inspect; when an
/// automatic reply code is configured the server answers it immediately.
pub struct MockServer {
    name: String,
    bind: String,
    auto_reply: Option<u16>,
    local: Mutex<Option<SocketAddr>>,
    token: CancellationToken,
    task: AsyncMutex<Option<JoinHandle<()>>>,
    tx: mpsc::UnboundedSender<Message>,
    rx: AsyncMutex<mpsc::UnboundedReceiver<Message>>,
}

impl MockServer {
    pub fn new(name: &str, bind: &str) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            name: name.to_string(),
            bind: bind.to_string(),
            auto_reply: None,
            local: Mutex::new(None),
            token: CancellationToken::new(),
            task: AsyncMutex::new(None),
            tx,
            rx: AsyncMutex::new(rx),
        }
    }

    /// Answer every request with `code`.
    pub fn replying(mut self, code: u16) -> Self {
        self.auto_reply = Some(code);
        self
    }

    /// Bound address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local.lock().ok().and_then(|l| *l)
    }

    /// Next request the server received.
    pub async fn next_request(&self, timeout: Duration) -> Result<Message> {
        let mut rx = self.rx.lock().await;
        tokio::time::timeout(timeout, rx.recv())
            .await
            .map_err(|_| anyhow!("{}: no request within {:?}", self.name, timeout))?
            .ok_or_else(|| anyhow!("{}: server stopped", self.name))
    }
}

async fn serve_connection(
    stream: TcpStream,
    auto_reply: Option<u16>,
    tx: mpsc::UnboundedSender<Message>,
    token: CancellationToken,
) {
    let mut framed = Framed::new(stream, SipCodec);
    loop {
        let next = tokio::select! {
            _ = token.cancelled() => return,
            next = framed.next() => next,
        };
        let msg = match next {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                warn!("mock server dropped connection: {}", e);
                return;
            }
            None => return,
        };
        if msg.method().is_none() {
            continue;
        }
        if let Some(code) = auto_reply {
            let reply = Message {
                start_line: format!("SIP/2.0 {code} Mock"),
                headers: msg
                    .headers
                    .iter()
                    .filter(|(n, _)| {
                        ["Via", "From", "To", "Call-ID", "CSeq"]
                            .iter()
                            .any(|k| n.eq_ignore_ascii_case(k))
                    })
                    .cloned()
                    .collect(),
                body: String::new(),
            };
            if let Err(e) = framed.send(reply).await {
                warn!("mock server reply failed: {}", e);
            }
        }
        debug!(line = %msg.start_line, "mock server received");
        if tx.send(msg).is_err() {
            return;
        }
    }
}

#[async_trait::async_trait]
impl Auxiliary for MockServer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.bind)
            .await
            .with_context(|| format!("{}: failed to bind {}", self.name, self.bind))?;
        let local = listener.local_addr()?;
        if let Ok(mut slot) = self.local.lock() {
            *slot = Some(local);
        }
        info!(server = %self.name, %local, "mock server listening");

        let token = self.token.clone();
        let tx = self.tx.clone();
        let auto_reply = self.auto_reply;
        let handle = tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = token.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "mock server accepted");
                        tokio::spawn(serve_connection(
                            stream,
                            auto_reply,
                            tx.clone(),
                            token.child_token(),
                        ));
                    }
                    Err(e) => warn!("mock server accept failed: {}", e),
                }
            }
        });
        *self.task.lock().await = Some(handle);
        Ok(())
    }

    async fn terminate(&self) -> Result<()> {
        self.token.cancel();
        if let Some(handle) = self.task.lock().await.take() {
            handle.await.context("mock server task panicked")?;
        }
        info!(server = %self.name, "mock server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn queues_and_answers_requests() {
        let server = MockServer::new("mock-as", "127.0.0.1:0").replying(200);
        server.start().await.unwrap();
        let addr = server.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"MESSAGE sip:as@example.net SIP/2.0\r\nCall-ID: c1\r\nCSeq: 1 MESSAGE\r\nContent-Length: 0\r\n\r\n")
            .await
            .unwrap();

        let req = server.next_request(Duration::from_secs(5)).await.unwrap();
        assert_eq!(req.method(), Some("MESSAGE"));

        let mut buf = vec![0u8; 1024];
        let n = client.read(&mut buf).await.unwrap();
        let reply = String::from_utf8_lossy(&buf[..n]);
        assert!(reply.starts_with("SIP/2.0 200 Mock\r\n"));
        assert!(reply.contains("Call-ID: c1"));

        server.terminate().await.unwrap();
    }
}
