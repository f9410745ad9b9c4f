//! Unified error handling for the trading bot
//!
//! One crate-wide error type with explicit categories, so callers can tell a
//! broker transport failure from a risk denial without string matching.

use std::fmt;
use std::io;

/// Main error type for the trading bot
#[derive(Debug)]
pub enum TradingError {
    // Configuration errors
    ConfigNotFound(String),
    ConfigParse(String),
    ConfigValidation(String),

    // Market data errors
    DataUnavailable { symbol: String, detail: String },
    StaleData { symbol: String, timeframe: String },

    // Order validation errors
    ValidationFailure(String),
    InvalidSignal(String),

    // Broker boundary errors
    BrokerRejection(String),
    BrokerTimeout(String),
    ConnectionLost(String),

    // Risk gate outcomes. RiskGateDenied is an expected, frequent result of
    // the admission gate, not an exceptional condition.
    RiskGateDenied { check: String, reason: String },
    EmergencyStop,

    // IO errors
    FileRead(String),
    FileWrite(String),

    // General errors
    Internal(String),
}

impl TradingError {
    pub fn data_unavailable(symbol: &str, detail: impl Into<String>) -> Self {
        TradingError::DataUnavailable {
            symbol: symbol.to_string(),
            detail: detail.into(),
        }
    }

    /// Check if error is retryable on a later cycle
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TradingError::BrokerTimeout(_)
                | TradingError::ConnectionLost(_)
                | TradingError::DataUnavailable { .. }
                | TradingError::StaleData { .. }
        )
    }

    /// True for gate outcomes that are part of normal operation and must not
    /// be escalated as failures.
    pub fn is_denial(&self) -> bool {
        matches!(
            self,
            TradingError::RiskGateDenied { .. } | TradingError::EmergencyStop
        )
    }

    /// Get error category for logging/metrics
    pub fn category(&self) -> &'static str {
        match self {
            TradingError::ConfigNotFound(_)
            | TradingError::ConfigParse(_)
            | TradingError::ConfigValidation(_) => "config",

            TradingError::DataUnavailable { .. } | TradingError::StaleData { .. } => "data",

            TradingError::ValidationFailure(_) | TradingError::InvalidSignal(_) => "validation",

            TradingError::BrokerRejection(_)
            | TradingError::BrokerTimeout(_)
            | TradingError::ConnectionLost(_) => "broker",

            TradingError::RiskGateDenied { .. } | TradingError::EmergencyStop => "risk",

            TradingError::FileRead(_) | TradingError::FileWrite(_) => "io",

            TradingError::Internal(_) => "internal",
        }
    }
}

impl fmt::Display for TradingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradingError::ConfigNotFound(path) => {
                write!(f, "Configuration file not found: {}", path)
            }
            TradingError::ConfigParse(msg) => {
                write!(f, "Configuration parse error: {}", msg)
            }
            TradingError::ConfigValidation(msg) => {
                write!(f, "Configuration validation error: {}", msg)
            }

            TradingError::DataUnavailable { symbol, detail } => {
                write!(f, "Market data unavailable for {}: {}", symbol, detail)
            }
            TradingError::StaleData { symbol, timeframe } => {
                write!(f, "Stale market data for {} {}", symbol, timeframe)
            }

            TradingError::ValidationFailure(msg) => {
                write!(f, "Order validation failed: {}", msg)
            }
            TradingError::InvalidSignal(msg) => {
                write!(f, "Invalid signal: {}", msg)
            }

            TradingError::BrokerRejection(msg) => {
                write!(f, "Broker rejected request: {}", msg)
            }
            TradingError::BrokerTimeout(msg) => {
                write!(f, "Broker call timed out: {}", msg)
            }
            TradingError::ConnectionLost(msg) => {
                write!(f, "Broker connection lost: {}", msg)
            }

            TradingError::RiskGateDenied { check, reason } => {
                write!(f, "Risk gate denied ({}): {}", check, reason)
            }
            TradingError::EmergencyStop => {
                write!(f, "Emergency stop active")
            }

            TradingError::FileRead(msg) => {
                write!(f, "File read error: {}", msg)
            }
            TradingError::FileWrite(msg) => {
                write!(f, "File write error: {}", msg)
            }

            TradingError::Internal(msg) => {
                write!(f, "Internal error: {}", msg)
            }
        }
    }
}

impl std::error::Error for TradingError {}

// Conversion implementations for common error types

impl From<io::Error> for TradingError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => TradingError::FileRead(err.to_string()),
            io::ErrorKind::TimedOut => TradingError::BrokerTimeout(err.to_string()),
            io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset => {
                TradingError::ConnectionLost(err.to_string())
            }
            _ => TradingError::Internal(format!("IO error: {}", err)),
        }
    }
}

impl From<reqwest::Error> for TradingError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TradingError::BrokerTimeout(err.to_string())
        } else if err.is_connect() {
            TradingError::ConnectionLost(err.to_string())
        } else if err.is_status() {
            TradingError::BrokerRejection(err.to_string())
        } else {
            TradingError::ConnectionLost(err.to_string())
        }
    }
}

impl From<serde_json::Error> for TradingError {
    fn from(err: serde_json::Error) -> Self {
        TradingError::BrokerRejection(format!("malformed payload: {}", err))
    }
}

impl From<toml::de::Error> for TradingError {
    fn from(err: toml::de::Error) -> Self {
        TradingError::ConfigParse(err.to_string())
    }
}

impl From<crate::config::ConfigError> for TradingError {
    fn from(err: crate::config::ConfigError) -> Self {
        use crate::config::ConfigError;
        match err {
            ConfigError::FileRead(msg) => TradingError::FileRead(msg),
            ConfigError::FileWrite(msg) => TradingError::FileWrite(msg),
            ConfigError::Parse(msg) => TradingError::ConfigParse(msg),
            ConfigError::Serialize(msg) => TradingError::ConfigParse(msg),
            ConfigError::Validation(msg) => TradingError::ConfigValidation(msg),
            ConfigError::UnknownField(field) => {
                TradingError::ConfigValidation(format!("unknown field: {}", field))
            }
            ConfigError::InvalidValue(msg) => TradingError::ConfigValidation(msg),
        }
    }
}

/// Result type alias using TradingError
pub type TradingResult<T> = Result<T, TradingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TradingError::DataUnavailable {
            symbol: "EURUSD".to_string(),
            detail: "no candles".to_string(),
        };
        assert!(err.to_string().contains("EURUSD"));
    }

    #[test]
    fn test_error_category() {
        let err = TradingError::ConfigValidation("test".to_string());
        assert_eq!(err.category(), "config");

        let err = TradingError::BrokerTimeout("test".to_string());
        assert_eq!(err.category(), "broker");

        let err = TradingError::EmergencyStop;
        assert_eq!(err.category(), "risk");
    }

    #[test]
    fn test_retryable() {
        assert!(TradingError::BrokerTimeout("t".to_string()).is_retryable());
        assert!(!TradingError::ValidationFailure("t".to_string()).is_retryable());
    }

    #[test]
    fn test_denial_is_not_failure() {
        let err = TradingError::RiskGateDenied {
            check: "daily_budget".to_string(),
            reason: "cap reached".to_string(),
        };
        assert!(err.is_denial());
        assert!(!TradingError::BrokerRejection("t".to_string()).is_denial());
    }

    #[test]
    fn test_io_conversion() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "test");
        let trading_err: TradingError = io_err.into();
        assert!(matches!(trading_err, TradingError::ConnectionLost(_)));
    }
}
