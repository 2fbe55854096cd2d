//! Storage quota monitoring.

use serde::Serialize;
use std::sync::Arc;

use crate::persistence::{StorageUsage, Store};

/// Storage pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaLevel {
    /// Below the warning threshold.
    Normal,
    /// At or above the warning threshold.
    Warning,
    /// At or above the danger threshold.
    Danger,
}

/// Classifies store usage against two thresholds.
pub struct QuotaMonitor {
    store: Arc<dyn Store>,
    warning: f64,
    danger: f64,
}

impl QuotaMonitor {
    /// Create a monitor. Thresholds are usage ratios (0.0 - 1.0).
    pub fn new(store: Arc<dyn Store>, warning: f64, danger: f64) -> Self {
        Self {
            store,
            warning,
            danger,
        }
    }

    /// Current usage.
    pub fn usage(&self) -> StorageUsage {
        self.store.usage()
    }

    /// Level for the current usage.
    pub fn level(&self) -> QuotaLevel {
        self.level_for(self.usage().ratio())
    }

    /// Level for a usage ratio.
    pub fn level_for(&self, ratio: f64) -> QuotaLevel {
        if ratio >= self.danger {
            QuotaLevel::Danger
        } else if ratio >= self.warning {
            QuotaLevel::Warning
        } else {
            QuotaLevel::Normal
        }
    }
}
