//! sipcheck -- live test orchestration for SIP/IMS deployments.
//!
//! Tests provision subscriber identities, drive concurrent signalling
//! scenarios against the deployment (natively or through SIPp), and always
//! release what they provisioned, whatever the outcome.

pub mod auxiliary;
pub mod barrier;
pub mod catalog;
pub mod config;
pub mod definition;
pub mod endpoint;
pub mod error;
pub mod provision;
pub mod registry;
pub mod report;
pub mod sipp;
pub mod stats;
