//! Pre-flight validation
//!
//! Runs before the engine starts trading: configuration sanity, broker
//! reachability, symbol specs for everything the strategies want to trade,
//! and coherence of the risk limits.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::broker::Broker;
use crate::config::Config;

/// Validation result with detailed findings
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub passed: bool,
    pub checks: Vec<ValidationCheck>,
}

#[derive(Debug, Clone)]
pub struct ValidationCheck {
    pub name: String,
    pub passed: bool,
    pub message: String,
    pub level: ValidationLevel,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationLevel {
    Critical, // Must pass for trading to start
    Warning,  // Should pass, but trading can continue
    Info,     // Informational only
}

impl ValidationResult {
    pub fn new() -> Self {
        ValidationResult {
            passed: true,
            checks: Vec::new(),
        }
    }

    pub fn add_check(&mut self, check: ValidationCheck) {
        if !check.passed && check.level == ValidationLevel::Critical {
            self.passed = false;
        }
        self.checks.push(check);
    }

    pub fn critical_failures(&self) -> Vec<&ValidationCheck> {
        self.checks
            .iter()
            .filter(|c| !c.passed && c.level == ValidationLevel::Critical)
            .collect()
    }

    pub fn warnings(&self) -> Vec<&ValidationCheck> {
        self.checks
            .iter()
            .filter(|c| !c.passed && c.level == ValidationLevel::Warning)
            .collect()
    }

    pub fn display(&self) {
        info!("🔍 Pre-flight Validation");
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

        for check in &self.checks {
            let icon = if check.passed {
                "✅"
            } else {
                match check.level {
                    ValidationLevel::Critical => "❌",
                    ValidationLevel::Warning => "⚠️",
                    ValidationLevel::Info => "ℹ️",
                }
            };

            info!("{} {} - {}", icon, check.name, check.message);
        }

        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

        if !self.passed {
            let failures = self.critical_failures();
            error!("❌ Validation failed: {} critical issue(s)", failures.len());
            for failure in failures {
                error!("   • {}: {}", failure.name, failure.message);
            }
        } else {
            let warnings = self.warnings();
            if !warnings.is_empty() {
                warn!("⚠️  {} warning(s) detected", warnings.len());
                for warning in warnings {
                    warn!("   • {}: {}", warning.name, warning.message);
                }
            }
            info!("✅ All critical checks passed");
        }
    }
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::new()
    }
}

/// Pre-flight validator for the trading engine
pub struct PreFlightValidator {
    config: Config,
    broker: Arc<dyn Broker>,
}

impl PreFlightValidator {
    pub fn new(config: Config, broker: Arc<dyn Broker>) -> Self {
        PreFlightValidator { config, broker }
    }

    /// Run full validation suite
    pub async fn validate_all(&self) -> ValidationResult {
        let mut result = ValidationResult::new();

        result.add_check(self.check_config());
        result.add_check(self.check_strategies());
        result.add_check(self.check_risk_limits());
        result.add_check(self.check_broker_connectivity().await);

        for check in self.check_symbol_specs().await {
            result.add_check(check);
        }

        result
    }

    fn check_config(&self) -> ValidationCheck {
        match self.config.validate() {
            Ok(()) => ValidationCheck {
                name: "Configuration".to_string(),
                passed: true,
                message: "configuration is valid".to_string(),
                level: ValidationLevel::Critical,
            },
            Err(e) => ValidationCheck {
                name: "Configuration".to_string(),
                passed: false,
                message: e.to_string(),
                level: ValidationLevel::Critical,
            },
        }
    }

    fn check_strategies(&self) -> ValidationCheck {
        let enabled = self.config.enabled_strategies().count();
        ValidationCheck {
            name: "Strategies".to_string(),
            passed: enabled > 0,
            message: if enabled > 0 {
                format!("{} strategies enabled", enabled)
            } else {
                "no strategies enabled, nothing will trade".to_string()
            },
            level: ValidationLevel::Warning,
        }
    }

    fn check_risk_limits(&self) -> ValidationCheck {
        let risk = &self.config.risk;
        // A per-trade budget close to the daily budget starves the day
        // after one admission
        let trades_per_day = risk.max_daily_risk / risk.max_risk_per_trade;
        ValidationCheck {
            name: "Risk limits".to_string(),
            passed: trades_per_day >= 2.0,
            message: format!(
                "daily budget covers {:.1} trades at max risk",
                trades_per_day
            ),
            level: ValidationLevel::Warning,
        }
    }

    async fn check_broker_connectivity(&self) -> ValidationCheck {
        match self.broker.account_info().await {
            Ok(account) => ValidationCheck {
                name: "Broker connection".to_string(),
                passed: account.equity > 0.0,
                message: format!(
                    "account reachable, equity {:.2}, balance {:.2}",
                    account.equity, account.balance
                ),
                level: ValidationLevel::Critical,
            },
            Err(e) => ValidationCheck {
                name: "Broker connection".to_string(),
                passed: false,
                message: format!("account info unavailable: {}", e),
                level: ValidationLevel::Critical,
            },
        }
    }

    async fn check_symbol_specs(&self) -> Vec<ValidationCheck> {
        let mut symbols: Vec<String> = self
            .config
            .enabled_strategies()
            .flat_map(|(_, s)| s.symbols.iter().cloned())
            .collect();
        symbols.sort();
        symbols.dedup();

        let mut checks = Vec::new();
        for symbol in symbols {
            let check = match self.broker.symbol_spec(&symbol).await {
                Ok(spec) if spec.volume_step > 0.0 && spec.point > 0.0 => ValidationCheck {
                    name: format!("Symbol {}", symbol),
                    passed: true,
                    message: format!(
                        "tradeable, lot step {}, {} digits",
                        spec.volume_step, spec.digits
                    ),
                    level: ValidationLevel::Critical,
                },
                Ok(_) => ValidationCheck {
                    name: format!("Symbol {}", symbol),
                    passed: false,
                    message: "spec has non-positive step or point".to_string(),
                    level: ValidationLevel::Critical,
                },
                Err(e) => ValidationCheck {
                    name: format!("Symbol {}", symbol),
                    passed: false,
                    message: format!("spec unavailable: {}", e),
                    level: ValidationLevel::Critical,
                },
            };
            checks.push(check);
        }
        checks
    }
}
