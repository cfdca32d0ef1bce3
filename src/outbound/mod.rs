//! Outbound delivery to the destination platform.
//!
//! The delivery engine only sees the [`OutboundSender`] trait; the WhatsApp
//! Cloud API implementation lives in [`whatsapp`].

pub mod whatsapp;

use std::time::Duration;

use async_trait::async_trait;

use crate::common::types::Payload;

pub use whatsapp::WhatsAppSender;

/// Result of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    /// Expected to succeed on retry. A `retry_after` hint marks an explicit
    /// rate-limit response.
    TransientFailure {
        reason: String,
        retry_after: Option<Duration>,
    },
    /// Retrying cannot succeed (invalid recipient, rejected content, auth).
    PermanentFailure { reason: String },
}

impl SendOutcome {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::TransientFailure {
            reason: reason.into(),
            retry_after: None,
        }
    }

    pub fn rate_limited(reason: impl Into<String>, retry_after: Duration) -> Self {
        Self::TransientFailure {
            reason: reason.into(),
            retry_after: Some(retry_after),
        }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::PermanentFailure {
            reason: reason.into(),
        }
    }
}

/// Performs the actual send call against the destination platform.
#[async_trait]
pub trait OutboundSender: Send + Sync {
    async fn send(&self, recipient: &str, payload: &Payload) -> SendOutcome;
}
