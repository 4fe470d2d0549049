//! Webhook status/error alerting.
//!
//! Posts embed records to the configured status and error webhooks. Delivery
//! is fire-and-forget: failures are logged and never retried, and nothing in
//! the core ever blocks on a post. Test mode disables the sink wholesale so a
//! test run has no outward network side effects.

use std::time::Duration;

use chrono::Utc;
use serde::Serialize;

use crate::config::Config;

/// Status embed palette.
pub const COLOR_ONLINE: u32 = 0x39ffb0;
pub const COLOR_WARNING: u32 = 0xfff53a;
pub const COLOR_ERROR: u32 = 0xff0000;

const POST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug, Serialize)]
pub struct Embed {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub timestamp: String,
    pub color: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub footer: Option<EmbedFooter>,
}

#[derive(Clone, Debug, Serialize)]
pub struct EmbedFooter {
    pub text: String,
}

impl Embed {
    pub fn new(title: impl Into<String>, color: u32) -> Self {
        Self {
            title: title.into(),
            description: None,
            timestamp: Utc::now().to_rfc3339(),
            color,
            footer: None,
        }
    }

    pub fn description(mut self, text: impl Into<String>) -> Self {
        self.description = Some(text.into());
        self
    }

    pub fn footer(mut self, text: impl Into<String>) -> Self {
        self.footer = Some(EmbedFooter { text: text.into() });
        self
    }
}

#[derive(Clone)]
pub struct Alerter {
    http: reqwest::Client,
    status_url: Option<String>,
    error_url: Option<String>,
    enabled: bool,
}

impl Alerter {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(POST_TIMEOUT)
                .build()
                .expect("reqwest client build"),
            status_url: cfg.status_webhook_url.clone(),
            error_url: cfg.error_webhook_url.clone(),
            enabled: !cfg.test_mode,
        }
    }

    pub fn status(&self, embed: Embed) {
        self.post(self.status_url.clone(), embed);
    }

    pub fn error(&self, title: impl Into<String>, description: Option<String>, code: Option<String>) {
        let mut embed = Embed::new(title, COLOR_ERROR);
        embed.description = description;
        if let Some(code) = code {
            embed = embed.footer(format!("Code {code}"));
        }
        self.post(self.error_url.clone(), embed);
    }

    fn post(&self, url: Option<String>, embed: Embed) {
        if !self.enabled {
            return;
        }
        let Some(url) = url else {
            return;
        };

        let http = self.http.clone();
        tokio::spawn(async move {
            let body = serde_json::json!({ "embeds": [embed] });
            let sent = http
                .post(&url)
                .json(&body)
                .send()
                .await
                .and_then(|resp| resp.error_for_status());
            if let Err(error) = sent {
                tracing::warn!(%error, "webhook delivery failed");
            }
        });
    }
}
