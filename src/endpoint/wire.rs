//! Minimal plain-text SIP connection over TCP or UDP.
//!
//! Enough to register and exchange simple requests against a proxy that does
//! not challenge; anything richer belongs in a full signalling stack plugged
//! in through [`SignallingClient`].

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tokio::sync::Mutex;
use tokio_util::codec::{Decoder, Encoder, Framed};
use tokio_util::udp::UdpFramed;
use tracing::{debug, info};

use super::{Expect, Identity, Message, SendOptions, SignallingClient, SignallingConnection};
use crate::config::Transport;
use crate::error::EndpointError;

/// Largest message accepted from the wire: 64 KB.
const MAX_MESSAGE_SIZE: usize = 65_536;

/// Frames SIP messages: header block terminated by a blank line, then
/// `Content-Length` bytes of body.
#[derive(Debug, Default)]
pub struct SipCodec;

fn parse_head(head: &str) -> Result<(String, Vec<(String, String)>), EndpointError> {
    let mut lines = head.split("\r\n");
    let start_line = lines
        .next()
        .filter(|l| !l.is_empty())
        .ok_or_else(|| EndpointError::Malformed("empty start line".into()))?
        .to_string();
    let mut headers = Vec::new();
    for line in lines.filter(|l| !l.is_empty()) {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| EndpointError::Malformed(format!("bad header line '{line}'")))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    Ok((start_line, headers))
}

impl Decoder for SipCodec {
    type Item = Message;
    type Error = EndpointError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, EndpointError> {
        // Keep-alive CRLFs between messages.
        while src.starts_with(b"\r\n") {
            src.advance(2);
        }
        let Some(end) = src.windows(4).position(|w| w == b"\r\n\r\n") else {
            if src.len() > MAX_MESSAGE_SIZE {
                return Err(EndpointError::Malformed("header block too large".into()));
            }
            return Ok(None);
        };
        let head = std::str::from_utf8(&src[..end])
            .map_err(|e| EndpointError::Malformed(e.to_string()))?;
        let (start_line, headers) = parse_head(head)?;
        let body_len = headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case("Content-Length") || n == "l")
            .map(|(_, v)| v.parse::<usize>())
            .transpose()
            .map_err(|e| EndpointError::Malformed(format!("Content-Length: {e}")))?
            .unwrap_or(0);
        if body_len > MAX_MESSAGE_SIZE {
            return Err(EndpointError::Malformed("body too large".into()));
        }
        let total = end + 4 + body_len;
        if src.len() < total {
            return Ok(None);
        }
        let frame = src.split_to(total);
        let body = String::from_utf8_lossy(&frame[end + 4..]).into_owned();
        Ok(Some(Message {
            start_line,
            headers,
            body,
        }))
    }
}

impl Encoder<Message> for SipCodec {
    type Error = EndpointError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), EndpointError> {
        dst.extend_from_slice(item.start_line.as_bytes());
        dst.extend_from_slice(b"\r\n");
        for (name, value) in item
            .headers
            .iter()
            .filter(|(n, _)| !n.eq_ignore_ascii_case("Content-Length"))
        {
            dst.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        dst.extend_from_slice(format!("Content-Length: {}\r\n\r\n", item.body.len()).as_bytes());
        dst.extend_from_slice(item.body.as_bytes());
        Ok(())
    }
}

enum Link {
    Tcp(Framed<TcpStream, SipCodec>),
    Udp {
        framed: UdpFramed<SipCodec>,
        peer: SocketAddr,
    },
}

impl Link {
    async fn send(&mut self, msg: Message) -> Result<(), EndpointError> {
        match self {
            Link::Tcp(framed) => framed.send(msg).await,
            Link::Udp { framed, peer } => framed.send((msg, *peer)).await,
        }
    }

    async fn next(&mut self) -> Option<Result<Message, EndpointError>> {
        match self {
            Link::Tcp(framed) => framed.next().await,
            Link::Udp { framed, .. } => framed.next().await.map(|r| r.map(|(m, _)| m)),
        }
    }
}

struct State {
    link: Link,
    cseq: u32,
    last_request: Option<Message>,
}

/// One connection per endpoint, owned for the lifetime of the handle.
pub struct WireConnection {
    identity: Identity,
    transport: Transport,
    local: SocketAddr,
    call_id: String,
    tag: String,
    branch_seq: AtomicU32,
    state: Mutex<State>,
}

impl WireConnection {
    fn via(&self) -> String {
        let branch = self.branch_seq.fetch_add(1, Ordering::Relaxed);
        format!(
            "SIP/2.0/{} {};branch=z9hG4bK{}-{}",
            self.transport, self.local, self.tag, branch
        )
    }

    fn request(&self, method: &str, cseq: u32, opts: SendOptions) -> Message {
        let target = opts.target.unwrap_or_else(|| self.identity.sip_uri.clone());
        let request_uri = if method == "REGISTER" {
            format!("sip:{}", self.identity.domain())
        } else {
            target.clone()
        };
        let mut headers = vec![
            ("Via".to_string(), self.via()),
            ("Max-Forwards".to_string(), "70".to_string()),
            (
                "From".to_string(),
                format!("<{}>;tag={}", self.identity.sip_uri, self.tag),
            ),
            ("To".to_string(), format!("<{target}>")),
            ("Call-ID".to_string(), self.call_id.clone()),
            ("CSeq".to_string(), format!("{cseq} {method}")),
            (
                "Contact".to_string(),
                format!(
                    "<sip:{}@{};transport={}>",
                    self.identity.username,
                    self.local,
                    self.transport.to_string().to_lowercase()
                ),
            ),
        ];
        headers.extend(opts.headers);
        Message {
            start_line: format!("{method} {request_uri} SIP/2.0"),
            headers,
            body: opts.body.unwrap_or_default(),
        }
    }

    fn response(code: u16, request: &Message, opts: SendOptions) -> Message {
        let mut headers: Vec<(String, String)> = request
            .headers
            .iter()
            .filter(|(n, _)| {
                ["Via", "From", "To", "Call-ID", "CSeq"]
                    .iter()
                    .any(|k| n.eq_ignore_ascii_case(k))
            })
            .cloned()
            .collect();
        headers.extend(opts.headers);
        Message {
            start_line: format!("SIP/2.0 {code} {}", reason_phrase(code)),
            headers,
            body: opts.body.unwrap_or_default(),
        }
    }
}

fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Trying",
        180 => "Ringing",
        200 => "OK",
        202 => "Accepted",
        404 => "Not Found",
        408 => "Request Timeout",
        480 => "Temporarily Unavailable",
        486 => "Busy Here",
        487 => "Request Terminated",
        603 => "Decline",
        _ => "Unknown",
    }
}

#[async_trait::async_trait]
impl SignallingConnection for WireConnection {
    async fn send(&self, message_type: &str, opts: SendOptions) -> Result<(), EndpointError> {
        let mut state = self.state.lock().await;
        let msg = match message_type.parse::<u16>() {
            Ok(code) => {
                let request = state.last_request.as_ref().ok_or_else(|| {
                    EndpointError::Malformed(format!("no request to answer with {code}"))
                })?;
                Self::response(code, request, opts)
            }
            Err(_) => {
                state.cseq += 1;
                self.request(&message_type.to_ascii_uppercase(), state.cseq, opts)
            }
        };
        state.link.send(msg).await
    }

    async fn receive(
        &self,
        expected: &Expect,
        timeout: Duration,
    ) -> Result<Message, EndpointError> {
        let mut state = self.state.lock().await;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let next = tokio::time::timeout_at(deadline, state.link.next())
                .await
                .map_err(|_| EndpointError::NoMessage(expected.to_string()))?;
            let msg = next.ok_or_else(|| EndpointError::Closed(expected.to_string()))??;
            if msg.method().is_some() {
                state.last_request = Some(msg.clone());
            }
            if expected.matches(&msg) {
                return Ok(msg);
            }
            // Provisional responses are absorbed while waiting for something else.
            if msg.status().is_some_and(|c| c < 200) {
                debug!(line = %msg.start_line, "skipping provisional");
                continue;
            }
            return Err(EndpointError::Unexpected {
                expected: expected.to_string(),
                received: msg.start_line,
            });
        }
    }

    async fn terminate(&self) -> Result<(), EndpointError> {
        let mut state = self.state.lock().await;
        if let Link::Tcp(framed) = &mut state.link {
            SinkExt::<Message>::close(framed).await?;
        }
        Ok(())
    }
}

/// Connects [`WireConnection`]s to the deployment's proxy.
#[derive(Debug, Default, Clone)]
pub struct WireClient;

#[async_trait::async_trait]
impl SignallingClient for WireClient {
    async fn connect(
        &self,
        identity: &Identity,
        transport: Transport,
        registrar: &str,
    ) -> Result<Box<dyn SignallingConnection>, EndpointError> {
        let connect_err = |source| EndpointError::Connect {
            addr: registrar.to_string(),
            source,
        };
        let peer = lookup_host(registrar)
            .await
            .map_err(connect_err)?
            .next()
            .ok_or_else(|| {
                connect_err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "no address resolved",
                ))
            })?;

        let (link, local) = match transport {
            Transport::Tcp => {
                let stream = TcpStream::connect(peer).await.map_err(connect_err)?;
                let local = stream.local_addr()?;
                (Link::Tcp(Framed::new(stream, SipCodec)), local)
            }
            Transport::Udp => {
                let bind = if peer.is_ipv4() {
                    SocketAddr::from(([0u8; 4], 0))
                } else {
                    SocketAddr::from(([0u16; 8], 0))
                };
                let socket = UdpSocket::bind(bind).await.map_err(connect_err)?;
                socket.connect(peer).await.map_err(connect_err)?;
                let local = socket.local_addr()?;
                (
                    Link::Udp {
                        framed: UdpFramed::new(socket, SipCodec),
                        peer,
                    },
                    local,
                )
            }
        };
        info!(uri = %identity.sip_uri, %transport, %peer, %local, "signalling connection up");

        let tag = uuid::Uuid::new_v4().simple().to_string();
        Ok(Box::new(WireConnection {
            identity: identity.clone(),
            transport,
            local,
            call_id: format!("{}@{}", &tag[..16], local.ip()),
            tag: tag[16..].to_string(),
            branch_seq: AtomicU32::new(1),
            state: Mutex::new(State {
                link,
                cseq: 0,
                last_request: None,
            }),
        }))
    }
}
