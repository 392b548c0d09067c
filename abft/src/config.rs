//! Configuration of the services
//!
//! Protocol automata are configured by their constructors. Timing and retention parameters of
//! the services running them are collected here.

use core::fmt;
use std::time::Duration;

/// Configuration of the [ACS coordinator](crate::acs::coordinator)
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AcsConfig {
    /// Period of the redelivery timer. A batch is resent when it stays unacknowledged for
    /// twice the period.
    pub resend_period: Duration,
    /// Number of state indexes behind the current one whose sessions are kept alive
    pub past_instances: u32,
    /// Number of state indexes ahead of the current one for which sessions are created on
    /// receiving a message from a peer
    pub future_instances: u32,
    /// Maximum size of a proposal
    pub max_message_size: usize,
}

impl Default for AcsConfig {
    fn default() -> Self {
        Self {
            resend_period: Duration::from_millis(500),
            past_instances: 2,
            future_instances: 5,
            max_message_size: 64 * 1024,
        }
    }
}

impl AcsConfig {
    /// Sets the resend period
    pub fn with_resend_period(mut self, period: Duration) -> Self {
        self.resend_period = period;
        self
    }
    /// Sets the size of the look-behind window
    pub fn with_past_instances(mut self, past_instances: u32) -> Self {
        self.past_instances = past_instances;
        self
    }
    /// Sets the size of the look-ahead window
    pub fn with_future_instances(mut self, future_instances: u32) -> Self {
        self.future_instances = future_instances;
        self
    }
    /// Sets maximum proposal size
    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    /// Validates the config
    pub fn validate(&self) -> Result<(), InvalidConfig> {
        if self.resend_period.is_zero() {
            return Err(InvalidConfig("resend_period must be positive"));
        }
        if self.max_message_size == 0 {
            return Err(InvalidConfig("max_message_size must be positive"));
        }
        Ok(())
    }
}

/// Configuration of the [common coin service](crate::coin::service)
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CoinConfig {
    /// Period of re-broadcasting own share to peers that haven't responded yet
    pub resend_period: Duration,
    /// Coin that isn't produced within this timeout is given up
    pub give_up_timeout: Duration,
    /// Produced coin keeps answering peers for this long, then it's discarded
    pub linger_period: Duration,
}

impl Default for CoinConfig {
    fn default() -> Self {
        Self {
            resend_period: Duration::from_secs(1),
            give_up_timeout: Duration::from_secs(60 * 60),
            linger_period: Duration::from_secs(30),
        }
    }
}

impl CoinConfig {
    /// Sets the resend period
    pub fn with_resend_period(mut self, period: Duration) -> Self {
        self.resend_period = period;
        self
    }
    /// Sets the give-up timeout
    pub fn with_give_up_timeout(mut self, timeout: Duration) -> Self {
        self.give_up_timeout = timeout;
        self
    }
    /// Sets the linger period
    pub fn with_linger_period(mut self, period: Duration) -> Self {
        self.linger_period = period;
        self
    }

    /// Validates the config
    pub fn validate(&self) -> Result<(), InvalidConfig> {
        if self.resend_period.is_zero() {
            return Err(InvalidConfig("resend_period must be positive"));
        }
        if self.give_up_timeout < self.resend_period {
            return Err(InvalidConfig(
                "give_up_timeout must not be less than resend_period",
            ));
        }
        Ok(())
    }
}

/// Configuration of the [DSS node](crate::dss::node)
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DssConfig {
    /// Period of ticks driving retransmission
    pub tick_period: Duration,
    /// Unacknowledged batch is resent once it's older than this
    pub resend_period: Duration,
    /// Number of indexes behind the latest started one that are kept within a series
    pub past_instances: u32,
    /// Number of indexes ahead of the latest started one for which messages are buffered
    pub future_instances: u32,
}

impl Default for DssConfig {
    fn default() -> Self {
        Self {
            tick_period: Duration::from_secs(1),
            resend_period: Duration::from_secs(1),
            past_instances: 2,
            future_instances: 5,
        }
    }
}

impl DssConfig {
    /// Sets the tick period
    pub fn with_tick_period(mut self, period: Duration) -> Self {
        self.tick_period = period;
        self
    }
    /// Sets the resend period
    pub fn with_resend_period(mut self, period: Duration) -> Self {
        self.resend_period = period;
        self
    }
    /// Sets the size of the look-behind window
    pub fn with_past_instances(mut self, past_instances: u32) -> Self {
        self.past_instances = past_instances;
        self
    }
    /// Sets the size of the look-ahead window
    pub fn with_future_instances(mut self, future_instances: u32) -> Self {
        self.future_instances = future_instances;
        self
    }

    /// Validates the config
    pub fn validate(&self) -> Result<(), InvalidConfig> {
        if self.tick_period.is_zero() {
            return Err(InvalidConfig("tick_period must be positive"));
        }
        if self.resend_period.is_zero() {
            return Err(InvalidConfig("resend_period must be positive"));
        }
        Ok(())
    }
}

/// Config is invalid
#[derive(Debug, Clone, Copy)]
pub struct InvalidConfig(&'static str);

impl fmt::Display for InvalidConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid config: {}", self.0)
    }
}

impl std::error::Error for InvalidConfig {}
