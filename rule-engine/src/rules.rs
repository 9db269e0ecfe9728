//! Threshold rule configuration.
//!
//! Each configured rule watches one field of one device and drives two
//! alerts: an instant alert per violating event and a persistent alert
//! once `streak` consecutive events have violated.

use crate::errors::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use telemetry::TelemetryEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    FieldA,
    FieldB,
}

impl Field {
    pub fn value(self, event: &TelemetryEvent) -> f64 {
        match self {
            Field::FieldA => event.field_a,
            Field::FieldB => event.field_b,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Field::FieldA => "field_a",
            Field::FieldB => "field_b",
        }
    }

    fn short_name(self) -> &'static str {
        match self {
            Field::FieldA => "a",
            Field::FieldB => "b",
        }
    }
}

impl FromStr for Field {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "field_a" | "a" => Ok(Field::FieldA),
            "field_b" | "b" => Ok(Field::FieldB),
            other => Err(Error::Config(format!("unknown field {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    pub device_id: String,
    pub field: Field,
    pub threshold: f64,
    /// Consecutive violations that raise a persistent alert.
    pub streak: u32,
}

impl RuleConfig {
    /// The violation predicate: right device and field above threshold.
    pub fn violated_by(&self, event: &TelemetryEvent) -> bool {
        event.device_id == self.device_id && self.field.value(event) > self.threshold
    }

    pub fn applies_to(&self, event: &TelemetryEvent) -> bool {
        event.device_id == self.device_id
    }

    pub fn instant_rule_id(&self) -> String {
        format!("instant_{}", self.suffix())
    }

    pub fn persistent_rule_id(&self) -> String {
        format!("persistent_{}", self.suffix())
    }

    fn suffix(&self) -> String {
        format!(
            "{}_{}_gt_{}",
            self.device_id,
            self.field.short_name(),
            self.threshold
        )
    }
}

/// Parses `device:field:threshold:streak`. The device id may itself
/// contain colons.
impl FromStr for RuleConfig {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.trim().rsplitn(4, ':');
        let (Some(streak), Some(threshold), Some(field), Some(device_id)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::Config(format!(
                "rule {:?} is not device:field:threshold:streak",
                s
            )));
        };

        if device_id.is_empty() {
            return Err(Error::Config(format!("rule {:?} has no device", s)));
        }
        let threshold: f64 = threshold
            .trim()
            .parse()
            .ok()
            .filter(|t: &f64| t.is_finite())
            .ok_or_else(|| Error::Config(format!("rule {:?} has a bad threshold", s)))?;
        let streak: u32 = streak
            .trim()
            .parse()
            .ok()
            .filter(|n| *n >= 1)
            .ok_or_else(|| Error::Config(format!("rule {:?} needs a streak of at least 1", s)))?;

        Ok(RuleConfig {
            device_id: device_id.to_string(),
            field: field.parse()?,
            threshold,
            streak,
        })
    }
}

impl fmt::Display for RuleConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.device_id,
            self.field.as_str(),
            self.threshold,
            self.streak
        )
    }
}

/// Parses a comma-separated rule list. Empty entries are skipped.
pub fn parse_rules(s: &str) -> Result<Vec<RuleConfig>> {
    s.split(',')
        .filter(|entry| !entry.trim().is_empty())
        .map(str::parse)
        .collect()
}

/// A configured rule with its alert ids resolved once.
#[derive(Debug, Clone)]
pub struct Rule {
    pub config: RuleConfig,
    pub instant_id: String,
    pub persistent_id: String,
}

impl From<RuleConfig> for Rule {
    fn from(config: RuleConfig) -> Self {
        Self {
            instant_id: config.instant_rule_id(),
            persistent_id: config.persistent_rule_id(),
            config,
        }
    }
}
