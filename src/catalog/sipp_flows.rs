use std::time::Duration;

use crate::sipp::{SippStep, SippTest};

const INVITE: &str = r#"
INVITE sip:[service]@[remote_ip]:[remote_port] SIP/2.0
Via: SIP/2.0/[transport] [local_ip]:[local_port];branch=z9hG4bK-[label]
From: <sip:caller@[local_ip]>;tag=[pid]SIPpTag00[call_number]
To: <sip:[service]@[remote_ip]:[remote_port]>
Call-ID: [call_id]
CSeq: 1 INVITE
Contact: <sip:caller@[local_ip]:[local_port]>
Max-Forwards: 70
Content-Type: application/sdp
Content-Length: [len]

v=0
o=- 0 0 IN IP[local_ip_type] [local_ip]
s=-
c=IN IP[media_ip_type] [media_ip]
t=0 0
m=audio [media_port] RTP/AVP 0
"#;

const RINGING: &str = r#"
SIP/2.0 180 Ringing
[last_Via:]
[last_From:]
[last_To:];tag=[pid]SIPpTag01[call_number]
[last_Call-ID:]
[last_CSeq:]
Content-Length: 0
"#;

const OK_INVITE: &str = r#"
SIP/2.0 200 OK
[last_Via:]
[last_From:]
[last_To:];tag=[pid]SIPpTag01[call_number]
[last_Call-ID:]
[last_CSeq:]
Contact: <sip:callee@[local_ip]:[local_port]>
Content-Type: application/sdp
Content-Length: [len]

v=0
o=- 0 0 IN IP[local_ip_type] [local_ip]
s=-
c=IN IP[media_ip_type] [media_ip]
t=0 0
m=audio [media_port] RTP/AVP 0
"#;

const ACK: &str = r#"
ACK sip:[service]@[remote_ip]:[remote_port] SIP/2.0
Via: SIP/2.0/[transport] [local_ip]:[local_port];branch=z9hG4bK-[label]
[last_From:]
[last_To:]
[last_Call-ID:]
CSeq: 1 ACK
Max-Forwards: 70
Content-Length: 0
"#;

const BYE: &str = r#"
BYE sip:[service]@[remote_ip]:[remote_port] SIP/2.0
Via: SIP/2.0/[transport] [local_ip]:[local_port];branch=z9hG4bK-[label]
[last_From:]
[last_To:]
[last_Call-ID:]
CSeq: 2 BYE
Max-Forwards: 70
Content-Length: 0
"#;

const OK_PLAIN: &str = r#"
SIP/2.0 200 OK
[last_Via:]
[last_From:]
[last_To:]
[last_Call-ID:]
[last_CSeq:]
Content-Length: 0
"#;

const MESSAGE: &str = r#"
MESSAGE sip:[service]@[remote_ip]:[remote_port] SIP/2.0
Via: SIP/2.0/[transport] [local_ip]:[local_port];branch=z9hG4bK-[label]
From: <sip:sender@[local_ip]>;tag=[pid]SIPpTag00[call_number]
To: <sip:[service]@[remote_ip]:[remote_port]>
Call-ID: [call_id]
CSeq: 1 MESSAGE
Max-Forwards: 70
Content-Type: text/plain
Content-Length: [len]

ping
"#;

pub(super) fn basic_call() -> SippTest {
    SippTest::new(
        "Basic Call - SIPp",
        vec![
            SippStep::send("caller", "callee", INVITE),
            SippStep::optional("callee", "caller", RINGING),
            SippStep::send("callee", "caller", OK_INVITE),
            SippStep::send("caller", "callee", ACK),
            SippStep::pause("caller", 1000),
            SippStep::send("caller", "callee", BYE),
            SippStep::send("callee", "caller", OK_PLAIN),
        ],
    )
    .with_timeout(Duration::from_secs(30))
}

pub(super) fn message() -> SippTest {
    SippTest::new(
        "SIPp - MESSAGE",
        vec![
            SippStep::send("sender", "receiver", MESSAGE),
            SippStep::send("receiver", "sender", OK_PLAIN),
        ],
    )
}
