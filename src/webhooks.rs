// Copyright (C) 2025, 2026 Poolpay Developers (see AUTHORS)
//
// This file is part of Poolpay
//
// Poolpay is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Poolpay is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// Poolpay. If not, see <https://www.gnu.org/licenses/>.

//! Outbound webhook notifications for payout lifecycle events.
//!
//! Delivery is best effort: a failed or unreachable endpoint is logged and
//! never affects the payout itself.

use crate::rpc::TransactionOutput;
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Clone, Serialize)]
struct WebhookEvent<'a> {
    event: &'a str,
    pool: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    payout_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    transaction_hash: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    recipients: Option<&'a [TransactionOutput]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    total_shares: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    urls: Vec<String>,
    pool_name: String,
}

impl WebhookNotifier {
    pub fn new(urls: Vec<String>, pool_name: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            urls,
            pool_name: pool_name.to_string(),
        }
    }

    pub async fn payout_started(
        &self,
        payout_id: Option<i64>,
        recipients: &[TransactionOutput],
        total_shares: u64,
    ) {
        self.post(WebhookEvent {
            event: "payout_started",
            pool: &self.pool_name,
            payout_id,
            transaction_hash: None,
            recipients: Some(recipients),
            total_shares: Some(total_shares),
            message: None,
        })
        .await;
    }

    pub async fn payout_success(
        &self,
        payout_id: Option<i64>,
        transaction_hash: &str,
        recipients: &[TransactionOutput],
        total_shares: u64,
    ) {
        self.post(WebhookEvent {
            event: "payout_success",
            pool: &self.pool_name,
            payout_id,
            transaction_hash: Some(transaction_hash),
            recipients: Some(recipients),
            total_shares: Some(total_shares),
            message: None,
        })
        .await;
    }

    pub async fn payout_error(&self, payout_id: Option<i64>, message: &str) {
        self.post(WebhookEvent {
            event: "payout_error",
            pool: &self.pool_name,
            payout_id,
            transaction_hash: None,
            recipients: None,
            total_shares: None,
            message: Some(message),
        })
        .await;
    }

    async fn post(&self, event: WebhookEvent<'_>) {
        for url in &self.urls {
            if let Err(e) = self.client.post(url).json(&event).send().await {
                warn!("Webhook delivery to {} failed: {}", url, e);
            }
        }
    }
}
