//! Resource-based write gating.
//!
//! Before accepting a put or update, the feed handler consults a write
//! filter. Removes are exempt by contract: they can only reduce resource
//! use. The concrete signal feeding the filter (attribute address space,
//! disk, memory) is external; [`AttributeUsageFilter`] is the standard
//! implementation driven by a usage fraction against a configured limit.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Snapshot of the filter's decision and the message clients see when
/// rejected.
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptState {
    /// Whether writes are accepted.
    pub accepted: bool,
    /// Rejection message; empty when accepting.
    pub message: String,
}

/// The gate the feed handler consults for puts and updates.
pub trait ResourceWriteFilter: Send + Sync {
    /// Cheap accept check.
    fn accept_write_operation(&self) -> bool;

    /// Accept check plus rejection message.
    fn accept_state(&self) -> AcceptState;
}

/// Limits for [`AttributeUsageFilter`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimitConfig {
    /// Reject writes when attribute address-space usage exceeds this
    /// fraction.
    pub attribute_address_space_limit: f64,
}

impl Default for ResourceLimitConfig {
    fn default() -> Self {
        ResourceLimitConfig {
            attribute_address_space_limit: 0.9,
        }
    }
}

struct FilterState {
    config: ResourceLimitConfig,
    usage: f64,
}

/// Standard write filter: compares reported attribute address-space usage
/// against the configured limit.
pub struct AttributeUsageFilter {
    state: Mutex<FilterState>,
}

impl AttributeUsageFilter {
    /// A filter that accepts everything until usage is reported.
    pub fn new(config: ResourceLimitConfig) -> Self {
        AttributeUsageFilter {
            state: Mutex::new(FilterState { config, usage: 0.0 }),
        }
    }

    /// Install new limits (config application path).
    pub fn set_config(&self, config: ResourceLimitConfig) {
        self.state.lock().config = config;
    }

    /// Report current usage as a fraction of address space.
    pub fn set_usage(&self, usage: f64) {
        self.state.lock().usage = usage;
    }
}

impl Default for AttributeUsageFilter {
    fn default() -> Self {
        Self::new(ResourceLimitConfig::default())
    }
}

impl ResourceWriteFilter for AttributeUsageFilter {
    fn accept_write_operation(&self) -> bool {
        let state = self.state.lock();
        state.usage <= state.config.attribute_address_space_limit
    }

    fn accept_state(&self) -> AcceptState {
        let state = self.state.lock();
        if state.usage <= state.config.attribute_address_space_limit {
            AcceptState {
                accepted: true,
                message: String::new(),
            }
        } else {
            AcceptState {
                accepted: false,
                message: format!(
                    "attribute address space used ({:.3}) is above the limit ({:.3})",
                    state.usage, state.config.attribute_address_space_limit
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_below_limit() {
        let filter = AttributeUsageFilter::default();
        assert!(filter.accept_write_operation());
        assert!(filter.accept_state().accepted);
        filter.set_usage(0.5);
        assert!(filter.accept_write_operation());
    }

    #[test]
    fn test_rejects_above_limit_with_message() {
        let filter = AttributeUsageFilter::default();
        filter.set_usage(0.95);
        assert!(!filter.accept_write_operation());
        let state = filter.accept_state();
        assert!(!state.accepted);
        assert!(state.message.contains("above the limit"));
    }

    #[test]
    fn test_config_change_applies_live() {
        let filter = AttributeUsageFilter::default();
        filter.set_usage(0.95);
        assert!(!filter.accept_write_operation());
        filter.set_config(ResourceLimitConfig {
            attribute_address_space_limit: 0.99,
        });
        assert!(filter.accept_write_operation());
    }
}
