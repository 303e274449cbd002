//! Twilio SMS gateway backend
//!
//! Speaks the Twilio Messages REST endpoint with basic auth. Twilio rejects
//! bodies over 1600 characters after transcoding, so the length check is
//! done here rather than in the limiter.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, error};

use super::sms::SmsBackend;
use crate::config::TwilioConfig;

/// Twilio message body limit (characters, post-transcoding)
const MAX_MESSAGE_CHARS: usize = 1600;

pub struct TwilioBackend {
    client: Client,
    config: TwilioConfig,
    is_setup: AtomicBool,
}

impl TwilioBackend {
    pub fn new(config: TwilioConfig) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            config,
            is_setup: AtomicBool::new(false),
        }
    }

    fn messages_url(&self) -> String {
        format!(
            "https://api.twilio.com/2010-04-01/Accounts/{}/Messages",
            self.config.account_sid
        )
    }
}

#[async_trait]
impl SmsBackend for TwilioBackend {
    fn setup(&self) -> anyhow::Result<()> {
        if self.is_setup.load(Ordering::SeqCst) {
            return Ok(());
        }

        if self.config.account_sid.is_empty() {
            anyhow::bail!("twilio account sid not set");
        }
        if self.config.auth_token.is_empty() {
            anyhow::bail!("twilio auth token not set");
        }
        if self.config.from.is_empty() {
            anyhow::bail!("twilio 'from' number not set");
        }
        if self.config.to.is_empty() {
            anyhow::bail!("twilio 'to' number not set");
        }

        self.is_setup.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn teardown(&self) {
        self.is_setup.store(false, Ordering::SeqCst);
    }

    async fn send(&self, message: &str) -> anyhow::Result<()> {
        if !self.is_setup.load(Ordering::SeqCst) {
            anyhow::bail!("twilio backend not yet set up");
        }

        let char_count = message.chars().count();
        if char_count > MAX_MESSAGE_CHARS {
            anyhow::bail!(
                "message body must have {MAX_MESSAGE_CHARS} or fewer characters, got {char_count}"
            );
        }

        let params = [
            ("To", self.config.to.as_str()),
            ("From", self.config.from.as_str()),
            ("Body", message),
        ];

        let response = self
            .client
            .post(self.messages_url())
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .form(&params)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            debug!("twilio message sent");
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            error!("twilio message failed with status {status}: {body}");
            anyhow::bail!("twilio rejected message with status {status}")
        }
    }
}
