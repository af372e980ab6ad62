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

use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct PoolConfig {
    /// Pool name, used in payout transaction memos and webhook payloads
    pub name: String,
    /// The chain account payouts are sent from
    pub account_name: String,
    /// Window in seconds used for the share rate status query
    pub recent_share_cutoff: u64,
    /// Percent of the confirmed account balance paid out per direct payout
    pub balance_percent_payout: u64,
    /// Minimum seconds between payout attempts, successful or not
    pub attempt_payout_interval: u64,
    /// Minimum seconds between successful payouts
    pub successful_payout_interval: u64,
    /// Duration of one payout period in seconds
    pub payout_period_duration: u64,
    /// Maximum distinct addresses included in one payout transaction
    #[serde(default = "default_max_addresses_per_payout")]
    pub max_addresses_per_payout: u32,
    /// Disable payout submission while still recording shares
    #[serde(default = "default_enable_payouts")]
    pub enable_payouts: bool,
    /// Seconds between payout period rollover checks
    #[serde(default = "default_rollover_tick")]
    pub rollover_tick: u64,
    /// Seconds between payout attempts by the orchestrator timers
    #[serde(default = "default_payout_tick")]
    pub payout_tick: u64,
    /// Seconds between confirmation reconciliation passes
    #[serde(default = "default_confirmation_tick")]
    pub confirmation_tick: u64,
}

fn default_max_addresses_per_payout() -> u32 {
    250
}

fn default_enable_payouts() -> bool {
    true
}

fn default_rollover_tick() -> u64 {
    10
}

fn default_payout_tick() -> u64 {
    60
}

fn default_confirmation_tick() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    pub path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChainRpcConfig {
    pub url: String,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct WebhooksConfig {
    /// Endpoints notified of payout lifecycle events
    #[serde(default)]
    pub urls: Vec<String>,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct LoggingConfig {
    /// Log to file if specified
    pub file: Option<String>,
    /// Log level (defaults to "info")
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log to console (defaults to true)
    pub console: Option<bool>,
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub pool: PoolConfig,
    pub store: StoreConfig,
    pub chainrpc: ChainRpcConfig,
    #[serde(default)]
    pub webhooks: WebhooksConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    pub fn load(path: &str) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("POOLPAY").separator("_"))
            .build()?
            .try_deserialize()
    }

    pub fn with_store_path(mut self, store_path: String) -> Self {
        self.store.path = store_path;
        self
    }

    pub fn with_chainrpc_url(mut self, url: String) -> Self {
        self.chainrpc.url = url;
        self
    }

    pub fn with_pool_name(mut self, name: String) -> Self {
        self.pool.name = name;
        self
    }

    pub fn with_account_name(mut self, account_name: String) -> Self {
        self.pool.account_name = account_name;
        self
    }

    pub fn with_balance_percent_payout(mut self, percent: u64) -> Self {
        self.pool.balance_percent_payout = percent;
        self
    }

    pub fn with_payout_period_duration(mut self, duration: u64) -> Self {
        self.pool.payout_period_duration = duration;
        self
    }

    pub fn with_attempt_payout_interval(mut self, interval: u64) -> Self {
        self.pool.attempt_payout_interval = interval;
        self
    }

    pub fn with_successful_payout_interval(mut self, interval: u64) -> Self {
        self.pool.successful_payout_interval = interval;
        self
    }

    pub fn with_enable_payouts(mut self, enable_payouts: bool) -> Self {
        self.pool.enable_payouts = enable_payouts;
        self
    }

    pub fn with_webhook_urls(mut self, urls: Vec<String>) -> Self {
        self.webhooks.urls = urls;
        self
    }
}
