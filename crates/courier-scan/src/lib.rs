//! # courier-scan
//!
//! Malware scan boundary. The only external trust boundary in the
//! attachment pipeline: an attachment is never marked usable unless the
//! scanner said clean, the scanner was administratively disabled, or an
//! operator explicitly chose fail-open.

pub mod clamav;

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use clamav::ClamAvScanner;

/// Scan verdict categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScanStatus {
    Clean,
    Infected,
    Failed,
    Skipped,
}

/// Verdict plus the daemon's raw reply (or the failure reason).
#[derive(Debug, Clone)]
pub struct ScanOutcome {
    pub status: ScanStatus,
    pub message: String,
}

impl ScanOutcome {
    pub fn new(status: ScanStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

/// Scanner seam. Errors fold into the outcome: the caller branches on the
/// verdict, never on transport detail.
#[async_trait]
pub trait VirusScanner: Send + Sync {
    async fn scan(&self, path: &Path) -> ScanOutcome;
}

/// Scanner double returning a fixed reply, for tests and local wiring.
pub struct StaticScanner {
    reply: String,
}

impl StaticScanner {
    pub fn with_reply(reply: impl Into<String>) -> Self {
        Self { reply: reply.into() }
    }

    pub fn clean() -> Self {
        Self::with_reply("stream: OK")
    }

    pub fn infected(signature: &str) -> Self {
        Self::with_reply(format!("stream: {signature} FOUND"))
    }
}

#[async_trait]
impl VirusScanner for StaticScanner {
    async fn scan(&self, _path: &Path) -> ScanOutcome {
        ScanOutcome::new(clamav::classify_reply(&self.reply), self.reply.clone())
    }
}
