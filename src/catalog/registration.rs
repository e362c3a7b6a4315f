use crate::check;
use crate::definition::{RunContext, TestCase, Variant};
use crate::error::ScenarioError;

pub struct BasicRegistration;

#[async_trait::async_trait]
impl TestCase for BasicRegistration {
    fn name(&self) -> &str {
        "Basic Registration"
    }

    async fn setup(&self, run: &mut RunContext) -> Result<(), ScenarioError> {
        let ep = run.add_endpoint(false).await?;
        run.add_scenario("subscriber", move |ctx| async move {
            ctx.note("registering");
            ep.register().await?;
            ctx.note("unregistering");
            ep.unregister().await?;
            Ok(())
        });
        Ok(())
    }
}

/// Two devices registering the same identity.
pub struct MultipleBindings;

#[async_trait::async_trait]
impl TestCase for MultipleBindings {
    fn name(&self) -> &str {
        "Multiple Bindings"
    }

    async fn setup(&self, run: &mut RunContext) -> Result<(), ScenarioError> {
        let first = run.add_endpoint(false).await?;
        let second = run.add_binding(&first).await?;
        check!(
            first.uri() == second.uri(),
            "binding registered a different identity: {} vs {}",
            first.uri(),
            second.uri()
        );
        for (role, ep) in [("device-1", first), ("device-2", second)] {
            run.add_scenario(role, move |ctx| async move {
                ctx.note("registering binding");
                ep.register().await?;
                Ok(())
            });
        }
        Ok(())
    }
}

/// A second public identity sharing the first one's private id.
pub struct AssociatedIdentities;

#[async_trait::async_trait]
impl TestCase for AssociatedIdentities {
    fn name(&self) -> &str {
        "Associated Identities"
    }

    async fn setup(&self, run: &mut RunContext) -> Result<(), ScenarioError> {
        let primary = run.add_endpoint(false).await?;
        let associated = run.add_associated_endpoint(&primary).await?;
        check!(
            primary.identity().private_id == associated.identity().private_id,
            "associated identity has its own private id"
        );
        run.add_scenario("subscriber", move |ctx| async move {
            primary.register().await?;
            ctx.note("primary registered");
            associated.register().await?;
            ctx.note("associated registered");
            Ok(())
        });
        Ok(())
    }
}

pub struct PstnRegistration;

#[async_trait::async_trait]
impl TestCase for PstnRegistration {
    fn name(&self) -> &str {
        "PSTN Registration"
    }

    fn variant(&self) -> Variant {
        Variant::Pstn
    }

    async fn setup(&self, run: &mut RunContext) -> Result<(), ScenarioError> {
        let ep = run.add_endpoint(true).await?;
        check!(ep.identity().pstn, "provisioned line is not PSTN-enabled");
        run.add_scenario("pstn-line", move |_ctx| async move {
            ep.register().await?;
            Ok(())
        });
        Ok(())
    }
}
