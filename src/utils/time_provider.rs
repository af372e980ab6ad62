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

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of unix-second timestamps, abstracted so tests can drive the
/// clock deterministically
pub trait TimeProvider: Send + Sync {
    fn seconds_since_epoch(&self) -> u64;
}

#[derive(Debug, Clone, Default)]
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn seconds_since_epoch(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// Manually advanced clock for tests
#[derive(Debug, Clone, Default)]
pub struct TestTimeProvider {
    now: Arc<AtomicU64>,
}

impl TestTimeProvider {
    pub fn new(start: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start)),
        }
    }

    pub fn set_time(&self, seconds: u64) {
        self.now.store(seconds, Ordering::SeqCst);
    }

    pub fn advance(&self, seconds: u64) {
        self.now.fetch_add(seconds, Ordering::SeqCst);
    }
}

impl TimeProvider for TestTimeProvider {
    fn seconds_since_epoch(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
