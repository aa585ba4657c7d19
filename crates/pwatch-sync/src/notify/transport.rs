use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::config::{EmailConfig, EmailProvider};

pub const RESEND_ENDPOINT: &str = "https://api.resend.com/emails";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub html: String,
    pub text: String,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("email request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("email provider rejected message with status {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("{0}")]
    Other(String),
}

/// Outbound message channel. One implementation is chosen at startup.
#[async_trait]
pub trait EmailTransport: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<(), TransportError>;
}

/// Writes messages to the log instead of sending them.
#[derive(Debug, Clone)]
pub struct LogTransport {
    from: String,
}

impl LogTransport {
    pub fn new(from: impl Into<String>) -> Self {
        Self { from: from.into() }
    }
}

#[async_trait]
impl EmailTransport for LogTransport {
    async fn send(&self, message: &EmailMessage) -> Result<(), TransportError> {
        info!(
            from = %self.from,
            to = %message.to,
            subject = %message.subject,
            body = %message.text,
            "email (log transport)"
        );
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct ResendRequest<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    html: &'a str,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct ResendErrorBody {
    message: Option<String>,
}

/// Hosted email API.
#[derive(Debug, Clone)]
pub struct ResendTransport {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    from: String,
}

impl ResendTransport {
    pub fn new(api_key: impl Into<String>, from: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .context("building email client")?;
        Ok(Self {
            client,
            endpoint: RESEND_ENDPOINT.to_string(),
            api_key: api_key.into(),
            from: from.into(),
        })
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl EmailTransport for ResendTransport {
    async fn send(&self, message: &EmailMessage) -> Result<(), TransportError> {
        let body = ResendRequest {
            from: &self.from,
            to: [&message.to],
            subject: &message.subject,
            html: &message.html,
            text: &message.text,
        };
        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let raw = resp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ResendErrorBody>(&raw)
            .ok()
            .and_then(|b| b.message)
            .unwrap_or(raw);
        Err(TransportError::Rejected {
            status: status.as_u16(),
            message,
        })
    }
}

pub fn transport_from_config(email: &EmailConfig) -> anyhow::Result<Arc<dyn EmailTransport>> {
    match email.provider {
        EmailProvider::Log => Ok(Arc::new(LogTransport::new(email.from.clone()))),
        EmailProvider::Resend => {
            let key = email
                .resend_api_key
                .clone()
                .context("RESEND_API_KEY is required when EMAIL_PROVIDER=resend")?;
            Ok(Arc::new(ResendTransport::new(key, email.from.clone())?))
        }
    }
}

/// Keeps every accepted message in memory; recipients listed in
/// `failing` are rejected.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<EmailMessage>>,
    failing: Mutex<HashSet<String>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_for(&self, to: impl Into<String>) {
        self.failing
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(to.into());
    }

    pub fn recover(&self, to: &str) {
        self.failing
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(to);
    }

    pub fn sent(&self) -> Vec<EmailMessage> {
        self.sent.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait]
impl EmailTransport for RecordingTransport {
    async fn send(&self, message: &EmailMessage) -> Result<(), TransportError> {
        let rejected = self
            .failing
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(&message.to);
        if rejected {
            return Err(TransportError::Other(format!(
                "mailbox unavailable: {}",
                message.to
            )));
        }
        self.sent
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(message.clone());
        Ok(())
    }
}
