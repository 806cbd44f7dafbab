//! Operator fan-out across the org's configured alert targets.
//!
//! Targets are independent: a dead chat webhook must not keep the push
//! alert from going out. The ids of the notifications that made it are
//! returned so escalation episodes can correlate later clicks.

use anyhow::Result;
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use liaison_agent::context::{Notifier, OperatorNotice};
use liaison_core::config::NotificationConfig;
use liaison_core::domain::escalation::Urgency;
use liaison_core::domain::session::OrgId;

use crate::blocks::notice_message;

#[derive(Clone)]
struct ChatTarget {
    url: String,
    token: Option<SecretString>,
}

#[derive(Clone)]
struct PushTarget {
    endpoint: String,
    token: Option<SecretString>,
}

#[derive(Clone)]
struct EmailTarget {
    endpoint: String,
    from: String,
}

#[derive(Clone, Default)]
pub struct FanoutNotifier {
    http: reqwest::Client,
    chat: Option<ChatTarget>,
    push: Option<PushTarget>,
    email: Option<EmailTarget>,
}

impl FanoutNotifier {
    pub fn from_config(config: &NotificationConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            chat: config.chat_webhook_url.as_ref().map(|url| ChatTarget {
                url: url.clone(),
                token: config.chat_token.clone(),
            }),
            push: config.push_endpoint.as_ref().map(|endpoint| PushTarget {
                endpoint: endpoint.clone(),
                token: config.push_token.clone(),
            }),
            email: match (&config.email_endpoint, &config.email_from) {
                (Some(endpoint), Some(from)) => {
                    Some(EmailTarget { endpoint: endpoint.clone(), from: from.clone() })
                }
                _ => None,
            },
        }
    }

    pub fn target_count(&self) -> usize {
        usize::from(self.chat.is_some())
            + usize::from(self.push.is_some())
            + usize::from(self.email.is_some())
    }

    async fn send_chat(&self, target: &ChatTarget, notice: &OperatorNotice) -> Result<String> {
        let card = notice_message(notice);
        let mut request = self.http.post(&target.url).json(&card);
        if let Some(token) = &target.token {
            request = request.bearer_auth(token.expose_secret());
        }
        request.send().await?.error_for_status()?;
        Ok(format!("chat-{}", Uuid::new_v4()))
    }

    async fn send_push(&self, target: &PushTarget, notice: &OperatorNotice) -> Result<String> {
        let mut request = self.http.post(&target.endpoint).json(&json!({
            "title": notice.title,
            "body": notice.body,
            "priority": match notice.urgency {
                Urgency::High => "high",
                _ => "default",
            },
        }));
        if let Some(token) = &target.token {
            request = request.bearer_auth(token.expose_secret());
        }
        request.send().await?.error_for_status()?;
        Ok(format!("push-{}", Uuid::new_v4()))
    }

    async fn send_email(&self, target: &EmailTarget, notice: &OperatorNotice) -> Result<String> {
        self.http
            .post(&target.endpoint)
            .json(&json!({
                "from": target.from,
                "subject": notice.title,
                "text": notice.body,
            }))
            .send()
            .await?
            .error_for_status()?;
        Ok(format!("email-{}", Uuid::new_v4()))
    }
}

#[async_trait]
impl Notifier for FanoutNotifier {
    async fn notify_operators(
        &self,
        org_id: &OrgId,
        notice: &OperatorNotice,
    ) -> Result<Vec<String>> {
        let mut refs = Vec::new();

        if let Some(target) = &self.chat {
            match self.send_chat(target, notice).await {
                Ok(id) => refs.push(id),
                Err(error) => {
                    warn!(event_name = "chat_notify_failed", org_id = %org_id.0, error = %error);
                }
            }
        }
        if let Some(target) = &self.push {
            match self.send_push(target, notice).await {
                Ok(id) => refs.push(id),
                Err(error) => {
                    warn!(event_name = "push_notify_failed", org_id = %org_id.0, error = %error);
                }
            }
        }
        if let Some(target) = &self.email {
            match self.send_email(target, notice).await {
                Ok(id) => refs.push(id),
                Err(error) => {
                    warn!(event_name = "email_notify_failed", org_id = %org_id.0, error = %error);
                }
            }
        }

        if self.target_count() == 0 {
            warn!(
                event_name = "no_notification_targets",
                org_id = %org_id.0,
                title = %notice.title,
            );
        }

        Ok(refs)
    }
}

#[cfg(test)]
mod tests {
    use liaison_agent::context::{Notifier, OperatorNotice};
    use liaison_core::config::NotificationConfig;
    use liaison_core::domain::escalation::Urgency;
    use liaison_core::domain::session::OrgId;

    use super::FanoutNotifier;

    fn notice() -> OperatorNotice {
        OperatorNotice {
            title: "Human needed".to_string(),
            body: "Customer waiting".to_string(),
            urgency: Urgency::Normal,
            actions: Vec::new(),
        }
    }

    #[test]
    fn config_without_endpoints_yields_zero_targets() {
        let notifier = FanoutNotifier::from_config(&NotificationConfig {
            chat_webhook_url: None,
            chat_token: None,
            push_endpoint: None,
            push_token: None,
            email_endpoint: None,
            email_from: None,
        });
        assert_eq!(notifier.target_count(), 0);
    }

    #[test]
    fn email_requires_both_endpoint_and_sender() {
        let notifier = FanoutNotifier::from_config(&NotificationConfig {
            chat_webhook_url: None,
            chat_token: None,
            push_endpoint: None,
            push_token: None,
            email_endpoint: Some("https://mail.example/send".to_string()),
            email_from: None,
        });
        assert_eq!(notifier.target_count(), 0);
    }

    #[tokio::test]
    async fn fan_out_with_no_targets_succeeds_with_no_refs() {
        let notifier = FanoutNotifier::default();
        let refs = notifier
            .notify_operators(&OrgId("org-1".to_string()), &notice())
            .await
            .expect("fan-out");
        assert!(refs.is_empty());
    }
}
