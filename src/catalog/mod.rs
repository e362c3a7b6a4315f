//! Built-in test definitions.
//!
//! Call-flow content is data for the engine; these cover one definition per
//! variant and the identity shapes (associated identities, extra bindings)
//! teardown ordering depends on.

mod calls;
mod registration;
mod sipp_flows;

pub use self::calls::{BasicCall, MockAsMessage, UnknownNumber};
pub use self::registration::{
    AssociatedIdentities, BasicRegistration, MultipleBindings, PstnRegistration,
};

use anyhow::Result;

use crate::registry::Registry;

/// Minimal audio offer used by call flows.
pub(crate) const SDP_OFFER: &str = "v=0\r\no=- 0 0 IN IP4 0.0.0.0\r\ns=-\r\nc=IN IP4 0.0.0.0\r\nt=0 0\r\nm=audio 8000 RTP/AVP 0\r\na=rtpmap:0 PCMU/8000\r\n";

/// Every built-in definition, registered in display order.
pub fn registry() -> Result<Registry> {
    let mut registry = Registry::new();
    registry.register(BasicRegistration)?;
    registry.register(MultipleBindings)?;
    registry.register(AssociatedIdentities)?;
    registry.register(PstnRegistration)?;
    registry.register(BasicCall)?;
    registry.register(UnknownNumber)?;
    registry.register(MockAsMessage)?;
    registry.register(sipp_flows::basic_call())?;
    registry.register(sipp_flows::message())?;
    Ok(registry)
}
