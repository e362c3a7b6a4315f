use std::time::Duration;

use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{ProvisionedNumber, Provisioner};
use crate::endpoint::Identity;
use crate::error::ProvisionError;

const API_KEY_HEADER: &str = "NGV-API-Key";

/// REST client for the provisioning API.
///
/// Numbers live under `/accounts/<account>/numbers/`, where the account is
/// `live-tests@<domain>`.
pub struct HttpProvisioner {
    client: Client,
    base: Url,
    domain: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct CreateRequest<'a> {
    pstn: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    private_id: Option<&'a str>,
}

#[derive(Deserialize)]
struct CreatedNumber {
    sip_username: String,
    sip_password: String,
    sip_uri: String,
    private_id: String,
    #[serde(default)]
    pstn: bool,
}

#[derive(Deserialize)]
struct NumberList {
    numbers: Vec<ProvisionedNumber>,
}

impl HttpProvisioner {
    pub fn new(base: &str, domain: &str, api_key: Option<String>) -> Result<Self, ProvisionError> {
        let base = Url::parse(base).map_err(|e| {
            ProvisionError::Unavailable(format!("bad provisioning url '{base}': {e}"))
        })?;
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            client,
            base,
            domain: domain.to_string(),
            api_key,
        })
    }

    fn account(domain: &str) -> String {
        format!("live-tests@{domain}")
    }

    fn numbers_url(&self, domain: &str, number: Option<&str>) -> Result<Url, ProvisionError> {
        let account = Self::account(domain);
        let mut url = self.base.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| {
                    ProvisionError::Unavailable("provisioning url cannot be a base".into())
                })?;
            segments.pop_if_empty();
            segments.extend(["accounts", account.as_str(), "numbers"]);
            // Trailing slash for the collection itself.
            segments.push(number.unwrap_or(""));
        }
        Ok(url)
    }

    fn with_key(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.header(API_KEY_HEADER, key),
            None => req,
        }
    }
}

#[async_trait::async_trait]
impl Provisioner for HttpProvisioner {
    async fn create_identity(
        &self,
        pstn: bool,
        shared: Option<&Identity>,
    ) -> Result<Identity, ProvisionError> {
        let url = self.numbers_url(&self.domain, None)?;
        let body = CreateRequest {
            pstn,
            private_id: shared.map(|s| s.private_id.as_str()),
        };
        let resp = self.with_key(self.client.post(url)).json(&body).send().await?;
        if !resp.status().is_success() {
            return Err(ProvisionError::Status {
                action: "create number".into(),
                status: resp.status().as_u16(),
            });
        }
        let created: CreatedNumber = resp.json().await?;
        debug!(uri = %created.sip_uri, pstn, "provisioned identity");
        Ok(Identity {
            username: created.sip_username,
            password: created.sip_password,
            sip_uri: created.sip_uri,
            private_id: created.private_id,
            pstn: created.pstn,
        })
    }

    async fn delete_identity(&self, identity: &Identity) -> Result<(), ProvisionError> {
        let url = self.numbers_url(identity.domain(), Some(&identity.sip_uri))?;
        let resp = self.with_key(self.client.delete(url)).send().await?;
        if !resp.status().is_success() {
            warn!(
                uri = %identity.sip_uri,
                status = resp.status().as_u16(),
                "failed to delete identity"
            );
        }
        Ok(())
    }

    async fn list_identities(
        &self,
        domain: &str,
    ) -> Result<Vec<ProvisionedNumber>, ProvisionError> {
        let url = self.numbers_url(domain, None)?;
        let resp = self.with_key(self.client.get(url)).send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !resp.status().is_success() {
            return Err(ProvisionError::Status {
                action: "list numbers".into(),
                status: resp.status().as_u16(),
            });
        }
        let list: NumberList = resp.json().await?;
        Ok(list.numbers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn number_urls_nest_under_account() {
        let p = HttpProvisioner::new("http://ellis.example.net/", "example.net", None).unwrap();
        let list = p.numbers_url("example.net", None).unwrap();
        assert_eq!(
            list.as_str(),
            "http://ellis.example.net/accounts/live-tests@example.net/numbers/"
        );
        let one = p
            .numbers_url("example.net", Some("sip:6505550001@example.net"))
            .unwrap();
        assert_eq!(
            one.as_str(),
            "http://ellis.example.net/accounts/live-tests@example.net/numbers/sip:6505550001@example.net"
        );
    }

    #[test]
    fn rejects_bad_base() {
        assert!(matches!(
            HttpProvisioner::new("not a url", "example.net", None),
            Err(ProvisionError::Unavailable(_))
        ));
    }
}
