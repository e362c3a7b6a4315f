//! Endpoint handles: a provisioned identity plus its signalling connection.
//!
//! The signalling client itself is a collaborator behind [`SignallingClient`];
//! handles add lifecycle bookkeeping (terminate-once, message log) and carry
//! the back-reference to a shared private identity.

pub mod wire;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::Transport;
use crate::error::EndpointError;

/// Default wait for an expected message.
pub const RECEIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Credentials of a provisioned subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub username: String,
    pub password: String,
    /// Public identity / address of record, e.g. `sip:6505550001@example.net`.
    pub sip_uri: String,
    pub private_id: String,
    #[serde(default)]
    pub pstn: bool,
}

impl Identity {
    pub fn domain(&self) -> &str {
        self.sip_uri.rsplit('@').next().unwrap_or_default()
    }
}

/// What a `receive` call waits for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expect {
    Request(String),
    Response(u16),
}

impl Expect {
    pub fn request(method: &str) -> Self {
        Expect::Request(method.to_ascii_uppercase())
    }

    pub fn matches(&self, msg: &Message) -> bool {
        match self {
            Expect::Request(method) => msg.method() == Some(method.as_str()),
            Expect::Response(code) => msg.status() == Some(*code),
        }
    }
}

impl std::fmt::Display for Expect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Expect::Request(m) => write!(f, "{m}"),
            Expect::Response(c) => write!(f, "{c} response"),
        }
    }
}

/// Parameters of an outgoing message. `message_type` passed alongside is a
/// method name (`INVITE`) for requests or a status code (`200`) for responses
/// to the last request received.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub target: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl SendOptions {
    pub fn to(target: impl Into<String>) -> Self {
        Self {
            target: Some(target.into()),
            ..Default::default()
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// A parsed signalling message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    pub start_line: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Message {
    pub fn method(&self) -> Option<&str> {
        if self.start_line.starts_with("SIP/2.0") {
            None
        } else {
            self.start_line.split_whitespace().next()
        }
    }

    pub fn status(&self) -> Option<u16> {
        let rest = self.start_line.strip_prefix("SIP/2.0 ")?;
        rest.split_whitespace().next()?.parse().ok()
    }

    /// First header with the given name, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[async_trait::async_trait]
pub trait SignallingConnection: Send + Sync {
    async fn send(&self, message_type: &str, opts: SendOptions) -> Result<(), EndpointError>;

    async fn receive(&self, expected: &Expect, timeout: Duration)
        -> Result<Message, EndpointError>;

    async fn terminate(&self) -> Result<(), EndpointError>;
}

/// Factory for signalling connections.
#[async_trait::async_trait]
pub trait SignallingClient: Send + Sync {
    async fn connect(
        &self,
        identity: &Identity,
        transport: Transport,
        registrar: &str,
    ) -> Result<Box<dyn SignallingConnection>, EndpointError>;
}

/// How an endpoint relates to the identity it uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// Provisioned for this endpoint alone.
    Primary,
    /// Provisioned as an extra public identity sharing `parent`'s private id.
    Associated { parent: Arc<Identity> },
    /// A further connection for an identity owned by another endpoint.
    Binding { parent: Arc<Identity> },
}

pub struct Endpoint {
    identity: Arc<Identity>,
    origin: Origin,
    transport: Transport,
    conn: Box<dyn SignallingConnection>,
    terminated: AtomicBool,
    log: Mutex<Vec<String>>,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("uri", &self.identity.sip_uri)
            .field("origin", &self.origin)
            .field("transport", &self.transport)
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

impl Endpoint {
    pub fn new(
        identity: Arc<Identity>,
        origin: Origin,
        transport: Transport,
        conn: Box<dyn SignallingConnection>,
    ) -> Self {
        Self {
            identity,
            origin,
            transport,
            conn,
            terminated: AtomicBool::new(false),
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn identity(&self) -> &Arc<Identity> {
        &self.identity
    }

    pub fn uri(&self) -> &str {
        &self.identity.sip_uri
    }

    pub fn username(&self) -> &str {
        &self.identity.username
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    /// True when terminating this endpoint must also delete its identity.
    pub fn owns_identity(&self) -> bool {
        !matches!(self.origin, Origin::Binding { .. })
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    fn ensure_live(&self) -> Result<(), EndpointError> {
        if self.is_terminated() {
            return Err(EndpointError::Terminated(self.identity.sip_uri.clone()));
        }
        Ok(())
    }

    fn record(&self, line: String) {
        if let Ok(mut log) = self.log.lock() {
            log.push(format!("{} {}", chrono::Utc::now().to_rfc3339(), line));
        }
    }

    /// Messages sent and received so far, oldest first.
    pub fn message_log(&self) -> Vec<String> {
        self.log.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub async fn send(&self, message_type: &str, opts: SendOptions) -> Result<(), EndpointError> {
        self.ensure_live()?;
        debug!(uri = %self.identity.sip_uri, %message_type, "sending");
        self.record(format!(">> {message_type} {}", opts.target.as_deref().unwrap_or("")));
        self.conn.send(message_type, opts).await
    }

    pub async fn receive(&self, expected: &Expect) -> Result<Message, EndpointError> {
        self.receive_within(expected, RECEIVE_TIMEOUT).await
    }

    pub async fn receive_within(
        &self,
        expected: &Expect,
        timeout: Duration,
    ) -> Result<Message, EndpointError> {
        self.ensure_live()?;
        debug!(uri = %self.identity.sip_uri, %expected, "waiting");
        match self.conn.receive(expected, timeout).await {
            Ok(msg) => {
                self.record(format!("<< {}", msg.start_line));
                Ok(msg)
            }
            Err(e) => {
                self.record(format!("!! {expected}: {e}"));
                Err(e)
            }
        }
    }

    /// REGISTER and wait for the 200.
    pub async fn register(&self) -> Result<(), EndpointError> {
        let opts = SendOptions::to(self.identity.sip_uri.clone()).header("Expires", "3600");
        self.send("REGISTER", opts).await?;
        self.receive(&Expect::Response(200)).await.map(|_| ())
    }

    /// REGISTER with `Expires: 0` and wait for the 200.
    pub async fn unregister(&self) -> Result<(), EndpointError> {
        self.send("REGISTER", SendOptions::to(self.identity.sip_uri.clone()).header("Expires", "0"))
            .await?;
        self.receive(&Expect::Response(200)).await.map(|_| ())
    }

    /// Close the connection. Returns `false` if already terminated.
    pub async fn terminate(&self) -> Result<bool, EndpointError> {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        debug!(uri = %self.identity.sip_uri, "terminating endpoint");
        self.conn.terminate().await?;
        Ok(true)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Connection that answers every receive from a scripted queue.
    #[derive(Default)]
    pub(crate) struct ScriptedConnection {
        pub inbound: Mutex<VecDeque<Message>>,
        pub sent: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait::async_trait]
    impl SignallingConnection for ScriptedConnection {
        async fn send(&self, message_type: &str, _opts: SendOptions) -> Result<(), EndpointError> {
            self.sent.lock().unwrap().push(message_type.to_string());
            Ok(())
        }

        async fn receive(&self, expected: &Expect, _t: Duration) -> Result<Message, EndpointError> {
            match self.inbound.lock().unwrap().pop_front() {
                Some(m) if expected.matches(&m) => Ok(m),
                Some(m) => Err(EndpointError::Unexpected {
                    expected: expected.to_string(),
                    received: m.start_line,
                }),
                None => Err(EndpointError::NoMessage(expected.to_string())),
            }
        }

        async fn terminate(&self) -> Result<(), EndpointError> {
            Ok(())
        }
    }

    pub(crate) fn identity(user: &str) -> Arc<Identity> {
        Arc::new(Identity {
            username: user.to_string(),
            password: "secret".to_string(),
            sip_uri: format!("sip:{user}@example.net"),
            private_id: format!("{user}@example.net"),
            pstn: false,
        })
    }

    fn ok_response() -> Message {
        Message {
            start_line: "SIP/2.0 200 OK".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn message_accessors() {
        let req = Message {
            start_line: "INVITE sip:bob@example.net SIP/2.0".into(),
            headers: vec![("Call-ID".into(), "abc".into())],
            body: String::new(),
        };
        assert_eq!(req.method(), Some("INVITE"));
        assert_eq!(req.status(), None);
        assert_eq!(req.header("call-id"), Some("abc"));
        assert_eq!(ok_response().status(), Some(200));
        assert_eq!(ok_response().method(), None);
        assert!(Expect::request("invite").matches(&req));
    }

    #[tokio::test]
    async fn register_then_terminate_once() {
        let conn = ScriptedConnection::default();
        conn.inbound.lock().unwrap().push_back(ok_response());
        let sent = conn.sent.clone();
        let ep = Endpoint::new(identity("alice"), Origin::Primary, Transport::Tcp, Box::new(conn));

        ep.register().await.unwrap();
        assert_eq!(*sent.lock().unwrap(), vec!["REGISTER".to_string()]);
        assert_eq!(ep.message_log().len(), 2);

        assert!(ep.terminate().await.unwrap());
        assert!(!ep.terminate().await.unwrap());
        let err = ep.send("INVITE", SendOptions::default()).await.unwrap_err();
        assert!(matches!(err, EndpointError::Terminated(_)));
    }

    #[test]
    fn bindings_do_not_own_identity() {
        let parent = identity("alice");
        let ep = Endpoint::new(
            parent.clone(),
            Origin::Binding { parent },
            Transport::Udp,
            Box::new(ScriptedConnection::default()),
        );
        assert!(!ep.owns_identity());
        assert_eq!(ep.identity().domain(), "example.net");
    }
}
