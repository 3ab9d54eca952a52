//! Condition predicates for complex permission evaluation
//!
//! Conditions refine a grant: after base resolution grants access, every
//! condition attached to the granting permission must hold or the result is
//! demoted to denied. Evaluation is pure over a caller-supplied context.

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;

/// Comparison operator for custom key/value conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOp {
    /// Equal
    Eq,
    /// Not equal
    Ne,
    /// Greater than (numeric when both sides parse, lexical otherwise)
    Gt,
    /// Less than
    Lt,
    /// Greater or equal
    Ge,
    /// Less or equal
    Le,
    /// Substring containment
    Contains,
}

/// A predicate attached to a permission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AccessCondition {
    /// Hour-of-day window `[start_hour, end_hour)` in UTC
    TimeOfDay {
        /// Inclusive start hour, 0-23
        start_hour: u32,
        /// Exclusive end hour, 1-24
        end_hour: u32,
    },
    /// Allowed days of week
    DayOfWeek {
        /// Permitted weekdays
        days: Vec<Weekday>,
    },
    /// Client address must fall inside the CIDR block
    IpCidr {
        /// Block in `addr/prefix` notation
        cidr: String,
    },
    /// The caller must hold a role of this name in the request context
    RoleInContext {
        /// Role name to look for
        role_name: String,
    },
    /// Custom attribute comparison against the context
    Custom {
        /// Context attribute key
        key: String,
        /// Comparison operator
        op: ConditionOp,
        /// Right-hand value
        value: String,
    },
}

/// Caller-supplied facts conditions are evaluated against
#[derive(Debug, Clone, Default)]
pub struct ConditionContext {
    /// Evaluation instant; `None` means now
    pub now: Option<DateTime<Utc>>,
    /// Client IP address, when known
    pub client_ip: Option<IpAddr>,
    /// Role names the caller holds in this request context
    pub context_roles: Vec<String>,
    /// Free-form attributes for custom conditions
    pub attributes: HashMap<String, String>,
}

impl ConditionContext {
    /// Context evaluated at a fixed instant
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now: Some(now),
            ..Default::default()
        }
    }

    fn instant(&self) -> DateTime<Utc> {
        self.now.unwrap_or_else(Utc::now)
    }
}

/// Outcome of a single condition check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionResult {
    /// Human-readable description of the condition
    pub condition: String,
    /// Whether the condition held
    pub passed: bool,
    /// Why it passed or failed
    pub explanation: String,
}

impl AccessCondition {
    /// Short description used in traces
    pub fn describe(&self) -> String {
        match self {
            AccessCondition::TimeOfDay { start_hour, end_hour } => {
                format!("hour >= {start_hour} AND hour < {end_hour}")
            }
            AccessCondition::DayOfWeek { days } => {
                let names: Vec<_> = days.iter().map(|d| format!("{d:?}")).collect();
                format!("day in [{}]", names.join(", "))
            }
            AccessCondition::IpCidr { cidr } => format!("client ip in {cidr}"),
            AccessCondition::RoleInContext { role_name } => {
                format!("context holds role {role_name:?}")
            }
            AccessCondition::Custom { key, op, value } => {
                format!("{key} {op:?} {value:?}")
            }
        }
    }

    /// Evaluate the condition against a context
    pub fn evaluate(&self, ctx: &ConditionContext) -> ConditionResult {
        let (passed, explanation) = match self {
            AccessCondition::TimeOfDay { start_hour, end_hour } => {
                let hour = ctx.instant().hour();
                let passed = hour >= *start_hour && hour < *end_hour;
                (
                    passed,
                    format!("current hour is {hour:02}:00 UTC, window is [{start_hour}, {end_hour})"),
                )
            }
            AccessCondition::DayOfWeek { days } => {
                let today = ctx.instant().weekday();
                let passed = days.contains(&today);
                (passed, format!("current day is {today:?}"))
            }
            AccessCondition::IpCidr { cidr } => match (ctx.client_ip, parse_cidr(cidr)) {
                (Some(ip), Some((network, prefix))) => {
                    let passed = cidr_contains(network, prefix, ip);
                    (passed, format!("client ip {ip} against {cidr}"))
                }
                (None, _) => (false, "no client ip in context".to_string()),
                (_, None) => (false, format!("malformed cidr {cidr:?}")),
            },
            AccessCondition::RoleInContext { role_name } => {
                let passed = ctx
                    .context_roles
                    .iter()
                    .any(|r| r.eq_ignore_ascii_case(role_name));
                (passed, format!("context roles: {:?}", ctx.context_roles))
            }
            AccessCondition::Custom { key, op, value } => match ctx.attributes.get(key) {
                Some(actual) => {
                    let passed = compare(actual, *op, value);
                    (passed, format!("{key} = {actual:?}"))
                }
                None => (false, format!("attribute {key:?} absent from context")),
            },
        };
        ConditionResult {
            condition: self.describe(),
            passed,
            explanation,
        }
    }
}

fn compare(actual: &str, op: ConditionOp, expected: &str) -> bool {
    // Numeric comparison when both sides parse as f64, lexical otherwise.
    if let (Ok(a), Ok(b)) = (actual.parse::<f64>(), expected.parse::<f64>()) {
        return match op {
            ConditionOp::Eq => a == b,
            ConditionOp::Ne => a != b,
            ConditionOp::Gt => a > b,
            ConditionOp::Lt => a < b,
            ConditionOp::Ge => a >= b,
            ConditionOp::Le => a <= b,
            ConditionOp::Contains => actual.contains(expected),
        };
    }
    match op {
        ConditionOp::Eq => actual == expected,
        ConditionOp::Ne => actual != expected,
        ConditionOp::Gt => actual > expected,
        ConditionOp::Lt => actual < expected,
        ConditionOp::Ge => actual >= expected,
        ConditionOp::Le => actual <= expected,
        ConditionOp::Contains => actual.contains(expected),
    }
}

fn parse_cidr(cidr: &str) -> Option<(IpAddr, u8)> {
    let (addr, prefix) = cidr.split_once('/')?;
    let addr: IpAddr = addr.parse().ok()?;
    let prefix: u8 = prefix.parse().ok()?;
    let max = match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };
    (prefix <= max).then_some((addr, prefix))
}

fn cidr_contains(network: IpAddr, prefix: u8, candidate: IpAddr) -> bool {
    match (network, candidate) {
        (IpAddr::V4(net), IpAddr::V4(ip)) => {
            let mask = if prefix == 0 {
                0
            } else {
                u32::MAX << (32 - prefix as u32)
            };
            (u32::from(net) & mask) == (u32::from(ip) & mask)
        }
        (IpAddr::V6(net), IpAddr::V6(ip)) => {
            let mask = if prefix == 0 {
                0
            } else {
                u128::MAX << (128 - prefix as u32)
            };
            (u128::from(net) & mask) == (u128::from(ip) & mask)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at_hour(hour: u32) -> ConditionContext {
        ConditionContext::at(Utc.with_ymd_and_hms(2026, 3, 2, hour, 0, 0).unwrap())
    }

    #[test]
    fn test_time_of_day_window() {
        let condition = AccessCondition::TimeOfDay {
            start_hour: 8,
            end_hour: 18,
        };
        assert!(condition.evaluate(&at_hour(9)).passed);
        assert!(condition.evaluate(&at_hour(17)).passed);
        assert!(!condition.evaluate(&at_hour(3)).passed);
        assert!(!condition.evaluate(&at_hour(18)).passed);
    }

    #[test]
    fn test_day_of_week() {
        // 2026-03-02 is a Monday
        let condition = AccessCondition::DayOfWeek {
            days: vec![Weekday::Mon, Weekday::Tue],
        };
        assert!(condition.evaluate(&at_hour(9)).passed);

        let weekend_only = AccessCondition::DayOfWeek {
            days: vec![Weekday::Sat, Weekday::Sun],
        };
        assert!(!weekend_only.evaluate(&at_hour(9)).passed);
    }

    #[test]
    fn test_ip_cidr() {
        let condition = AccessCondition::IpCidr {
            cidr: "10.1.0.0/16".to_string(),
        };
        let mut ctx = ConditionContext::default();
        ctx.client_ip = Some("10.1.200.7".parse().unwrap());
        assert!(condition.evaluate(&ctx).passed);

        ctx.client_ip = Some("10.2.0.1".parse().unwrap());
        assert!(!condition.evaluate(&ctx).passed);

        ctx.client_ip = None;
        assert!(!condition.evaluate(&ctx).passed);
    }

    #[test]
    fn test_custom_numeric_comparison() {
        let condition = AccessCondition::Custom {
            key: "clearance".to_string(),
            op: ConditionOp::Ge,
            value: "3".to_string(),
        };
        let mut ctx = ConditionContext::default();
        ctx.attributes.insert("clearance".into(), "10".into());
        // Numeric, not lexical: "10" >= "3"
        assert!(condition.evaluate(&ctx).passed);
    }

    #[test]
    fn test_role_in_context() {
        let condition = AccessCondition::RoleInContext {
            role_name: "auditor".to_string(),
        };
        let mut ctx = ConditionContext::default();
        assert!(!condition.evaluate(&ctx).passed);
        ctx.context_roles.push("Auditor".into());
        assert!(condition.evaluate(&ctx).passed);
    }
}
