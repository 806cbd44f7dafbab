//! Outbound delivery routing.
//!
//! One provider endpoint per channel; the payload shape is the lowest
//! common denominator (`to` + `text`) every relay we target accepts. A
//! channel without a configured endpoint fails delivery, which sends the
//! message to the dead letter queue rather than dropping it.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use liaison_agent::context::DeliveryAdapter;
use liaison_core::config::ChannelsConfig;
use liaison_core::domain::session::{ChannelKind, ContactId};

#[derive(Clone)]
pub struct ProviderEndpoint {
    pub url: String,
    pub token: Option<SecretString>,
}

#[derive(Clone, Default)]
pub struct ChannelRouter {
    http: reqwest::Client,
    whatsapp: Option<ProviderEndpoint>,
    sms: Option<ProviderEndpoint>,
    email: Option<ProviderEndpoint>,
    web_chat: Option<ProviderEndpoint>,
}

impl ChannelRouter {
    pub fn from_config(config: &ChannelsConfig) -> Self {
        let endpoint = |url: &Option<String>, token: &Option<SecretString>| {
            url.as_ref().map(|url| ProviderEndpoint { url: url.clone(), token: token.clone() })
        };

        Self {
            http: reqwest::Client::new(),
            whatsapp: endpoint(&config.whatsapp_endpoint, &config.whatsapp_token),
            sms: endpoint(&config.sms_endpoint, &config.sms_token),
            email: endpoint(&config.email_endpoint, &None),
            web_chat: endpoint(&config.web_chat_endpoint, &None),
        }
    }

    fn endpoint(&self, channel: ChannelKind) -> Option<&ProviderEndpoint> {
        match channel {
            ChannelKind::Whatsapp => self.whatsapp.as_ref(),
            ChannelKind::Sms => self.sms.as_ref(),
            ChannelKind::Email => self.email.as_ref(),
            ChannelKind::WebChat => self.web_chat.as_ref(),
            ChannelKind::Test => None,
        }
    }

    pub fn is_configured(&self, channel: ChannelKind) -> bool {
        self.endpoint(channel).is_some()
    }
}

#[async_trait]
impl DeliveryAdapter for ChannelRouter {
    async fn deliver(
        &self,
        channel: ChannelKind,
        recipient: &ContactId,
        text: &str,
    ) -> Result<String> {
        if !channel.delivers() {
            return Ok(format!("test-{}", Uuid::new_v4()));
        }

        let endpoint = self.endpoint(channel).ok_or_else(|| {
            anyhow!("no provider endpoint configured for channel {}", channel.as_str())
        })?;

        let mut request = self
            .http
            .post(&endpoint.url)
            .json(&json!({ "to": recipient.0, "text": text }));
        if let Some(token) = &endpoint.token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            bail!("channel provider for {} returned {}", channel.as_str(), status);
        }

        let message_id = match response.json::<Value>().await {
            Ok(body) => body
                .get("message_id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            Err(_) => Uuid::new_v4().to_string(),
        };

        info!(
            event_name = "message_delivered",
            channel = channel.as_str(),
            message_id = %message_id,
        );
        Ok(message_id)
    }
}

#[cfg(test)]
mod tests {
    use liaison_agent::context::DeliveryAdapter;
    use liaison_core::config::ChannelsConfig;
    use liaison_core::domain::session::{ChannelKind, ContactId};

    use super::ChannelRouter;

    fn recipient() -> ContactId {
        ContactId("+15550001".to_string())
    }

    #[tokio::test]
    async fn test_channel_returns_a_synthetic_id_without_any_endpoint() {
        let router = ChannelRouter::from_config(&ChannelsConfig::default());

        let id = router
            .deliver(ChannelKind::Test, &recipient(), "hello")
            .await
            .expect("test delivery");
        assert!(id.starts_with("test-"));
    }

    #[tokio::test]
    async fn unconfigured_channel_fails_delivery() {
        let router = ChannelRouter::from_config(&ChannelsConfig::default());
        assert!(!router.is_configured(ChannelKind::Whatsapp));

        let error = router
            .deliver(ChannelKind::Whatsapp, &recipient(), "hello")
            .await
            .expect_err("must fail");
        assert!(error.to_string().contains("whatsapp"));
    }

    #[test]
    fn configuration_maps_endpoints_to_their_channels() {
        let router = ChannelRouter::from_config(&ChannelsConfig {
            whatsapp_endpoint: Some("https://relay.example/whatsapp".to_string()),
            sms_endpoint: Some("https://relay.example/sms".to_string()),
            ..ChannelsConfig::default()
        });

        assert!(router.is_configured(ChannelKind::Whatsapp));
        assert!(router.is_configured(ChannelKind::Sms));
        assert!(!router.is_configured(ChannelKind::Email));
        assert!(!router.is_configured(ChannelKind::Test));
    }
}
