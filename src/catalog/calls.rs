use std::sync::Arc;
use std::time::Duration;

use super::SDP_OFFER;
use crate::auxiliary::MockServer;
use crate::barrier::Barrier;
use crate::check;
use crate::definition::{RunContext, TestCase, Variant};
use crate::endpoint::{Expect, SendOptions};
use crate::error::ScenarioError;

/// Caller and callee on separate units; the hang-up waits for both sides to
/// see the call answered.
pub struct BasicCall;

#[async_trait::async_trait]
impl TestCase for BasicCall {
    fn name(&self) -> &str {
        "Basic Call - Mainline"
    }

    async fn setup(&self, run: &mut RunContext) -> Result<(), ScenarioError> {
        let caller = run.add_endpoint(false).await?;
        let callee = run.add_endpoint(false).await?;
        caller.register().await?;
        callee.register().await?;

        let answered = Arc::new(Barrier::named("call answered", 2));
        let callee_uri = callee.uri().to_string();

        let barrier = answered.clone();
        run.add_scenario("caller", move |ctx| async move {
            let invite = SendOptions::to(callee_uri.clone())
                .header("Content-Type", "application/sdp")
                .body(SDP_OFFER);
            ctx.send(&caller, "INVITE", invite).await?;
            ctx.receive(&caller, Expect::Response(180)).await?;
            let ok = ctx.receive(&caller, Expect::Response(200)).await?;
            check!(!ok.body.is_empty(), "200 OK to INVITE carried no SDP answer");
            ctx.send(&caller, "ACK", SendOptions::to(callee_uri.clone())).await?;
            ctx.wait(&barrier).await;
            ctx.send(&caller, "BYE", SendOptions::to(callee_uri)).await?;
            ctx.receive(&caller, Expect::Response(200)).await?;
            Ok(())
        });

        run.add_scenario("callee", move |ctx| async move {
            let invite = ctx.receive(&callee, Expect::request("INVITE")).await?;
            check!(
                invite.header("Content-Type") == Some("application/sdp"),
                "INVITE arrived without SDP"
            );
            ctx.send(&callee, "180", SendOptions::default()).await?;
            let answer = SendOptions::default()
                .header("Content-Type", "application/sdp")
                .body(SDP_OFFER);
            ctx.send(&callee, "200", answer).await?;
            ctx.receive(&callee, Expect::request("ACK")).await?;
            ctx.wait(&answered).await;
            ctx.receive(&callee, Expect::request("BYE")).await?;
            ctx.send(&callee, "200", SendOptions::default()).await?;
            Ok(())
        });
        Ok(())
    }
}

/// INVITE to a number nobody owns. The 404 is a literal expectation about
/// the deployment's routing.
pub struct UnknownNumber;

#[async_trait::async_trait]
impl TestCase for UnknownNumber {
    fn name(&self) -> &str {
        "Unknown Number"
    }

    async fn setup(&self, run: &mut RunContext) -> Result<(), ScenarioError> {
        let caller = run.add_endpoint(false).await?;
        caller.register().await?;
        let target = format!("sip:6505559999@{}", run.environment().deployment.domain);
        run.add_scenario("caller", move |ctx| async move {
            let invite = SendOptions::to(target)
                .header("Content-Type", "application/sdp")
                .body(SDP_OFFER);
            ctx.send(&caller, "INVITE", invite).await?;
            ctx.receive(&caller, Expect::Response(404)).await?;
            Ok(())
        });
        Ok(())
    }
}

/// Originating MESSAGE routed through the mock application server.
pub struct MockAsMessage;

#[async_trait::async_trait]
impl TestCase for MockAsMessage {
    fn name(&self) -> &str {
        "Mock AS - MESSAGE"
    }

    fn variant(&self) -> Variant {
        Variant::AppServer
    }

    async fn setup(&self, run: &mut RunContext) -> Result<(), ScenarioError> {
        let bind = run
            .environment()
            .deployment
            .app_server
            .clone()
            .ok_or_else(|| ScenarioError::skip("No application server configured"))?;
        let mock = Arc::new(MockServer::new("mock-as", &bind).replying(200));
        run.add_auxiliary(mock.clone());

        let sender = run.add_endpoint(false).await?;
        sender.register().await?;
        let to = sender.uri().to_string();

        run.add_scenario("sender", move |ctx| async move {
            let message = SendOptions::to(to)
                .header("Content-Type", "text/plain")
                .body("ping");
            ctx.send(&sender, "MESSAGE", message).await?;
            ctx.receive(&sender, Expect::Response(200)).await?;
            ctx.note("waiting for the AS to see the request");
            let seen = mock.next_request(Duration::from_secs(5)).await?;
            check!(
                seen.method() == Some("MESSAGE"),
                "AS saw {} instead of MESSAGE",
                seen.start_line
            );
            Ok(())
        });
        Ok(())
    }
}
