//! Outbound delivery of actions
//!
//! The dispatcher only knows the [`Delivery`] trait; production picks
//! [`HttpDelivery`] or [`LogDelivery`] through [`DeliveryTarget`].

use crate::state_machine::Action;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("Delivery failed: {0}")]
    Transport(String),
    #[error("Delivery refused with HTTP {0}")]
    Refused(u16),
}

/// Sink for non-NOOP actions
#[async_trait]
pub trait Delivery: Send + Sync {
    async fn deliver(&self, action: &Action) -> Result<(), DeliveryError>;
}

#[async_trait]
impl<T: Delivery + ?Sized> Delivery for Arc<T> {
    async fn deliver(&self, action: &Action) -> Result<(), DeliveryError> {
        (**self).deliver(action).await
    }
}

// ============================================================================
// Production implementations
// ============================================================================

/// POSTs each action as JSON to a callback URL
pub struct HttpDelivery {
    client: reqwest::Client,
    url: String,
}

impl HttpDelivery {
    pub fn new(url: String, timeout: Duration) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("relaybot/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl Delivery for HttpDelivery {
    async fn deliver(&self, action: &Action) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(&self.url)
            .json(action)
            .send()
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::Refused(status.as_u16()));
        }
        Ok(())
    }
}

/// Writes actions to the log instead of sending them anywhere
pub struct LogDelivery;

#[async_trait]
impl Delivery for LogDelivery {
    async fn deliver(&self, action: &Action) -> Result<(), DeliveryError> {
        tracing::info!(
            conv_id = %action.conversation_id,
            kind = ?action.kind,
            payload = %action.payload,
            "Outbound action"
        );
        Ok(())
    }
}

/// Delivery chosen at startup
pub enum DeliveryTarget {
    Http(HttpDelivery),
    Log(LogDelivery),
}

impl DeliveryTarget {
    pub fn from_url(url: Option<&str>, timeout: Duration) -> Result<Self, DeliveryError> {
        match url {
            Some(url) => Ok(DeliveryTarget::Http(HttpDelivery::new(url.to_string(), timeout)?)),
            None => Ok(DeliveryTarget::Log(LogDelivery)),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DeliveryTarget::Http(_) => "http",
            DeliveryTarget::Log(_) => "log",
        }
    }
}

#[async_trait]
impl Delivery for DeliveryTarget {
    async fn deliver(&self, action: &Action) -> Result<(), DeliveryError> {
        match self {
            DeliveryTarget::Http(d) => d.deliver(action).await,
            DeliveryTarget::Log(d) => d.deliver(action).await,
        }
    }
}
