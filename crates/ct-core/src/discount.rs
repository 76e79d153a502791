//! Discount rule evaluation.
//!
//! Rules are declarative: a percentage plus a list of AND-combined
//! [`Condition`]s. Every enabled rule whose conditions hold is applied, in
//! precedence order (global rules, then provider rules), and discounts stack
//! additively on the base cost. Nothing caps the total, so a line item can end
//! up with a negative final cost.
//!
//! A condition that cannot be evaluated (unknown type, unknown operator,
//! non-numeric literal) is false, so its rule does not apply.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cost::CostLineItem;
use crate::interval::{GapFill, hours_matching};
use crate::period::AsOf;
use crate::state::{ResourceState, RunState};

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Relative tolerance for `==`; measured values pass through ms-to-hours
/// division before being compared against whole-number literals.
const EQ_TOLERANCE: f64 = 1e-9;

/// What a condition measures.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConditionKind {
    /// Days since the resource was created.
    ResourceAgeDays,
    /// Running hours in the calculation window.
    RunningHours,
    /// Running minutes in the calculation window.
    RunningMinutes,
    /// Running hours in the current calendar month, regardless of the window.
    MonthlyRunningHours,
    /// `RUNNING` or `SHUTDOWN`, compared as a string.
    StatusCategory,
    /// Days since the resource was created, used by shutdown rules.
    ShutdownAgeDays,
    /// Anything else found in a catalog. Never matches.
    Unknown(String),
}

impl fmt::Display for ConditionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ResourceAgeDays => "resource_age_days",
            Self::RunningHours => "running_hours",
            Self::RunningMinutes => "running_minutes",
            Self::MonthlyRunningHours => "monthly_running_hours",
            Self::StatusCategory => "status",
            Self::ShutdownAgeDays => "shutdown_days",
            Self::Unknown(other) => other.as_str(),
        };
        write!(f, "{s}")
    }
}

impl FromStr for ConditionKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "resource_age_days" | "instance_age_days" => Self::ResourceAgeDays,
            "running_hours" => Self::RunningHours,
            "running_minutes" => Self::RunningMinutes,
            "monthly_running_hours" => Self::MonthlyRunningHours,
            "status" | "status_category" => Self::StatusCategory,
            "shutdown_days" => Self::ShutdownAgeDays,
            other => Self::Unknown(other.to_string()),
        })
    }
}

/// Comparison between the measured value and the condition's literal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Operator {
    Le,
    Ge,
    Lt,
    Gt,
    Eq,
    /// Unsupported operator text. Never matches.
    Unknown(String),
}

impl Operator {
    fn compare(&self, lhs: f64, rhs: f64) -> bool {
        match self {
            Self::Le => lhs <= rhs,
            Self::Ge => lhs >= rhs,
            Self::Lt => lhs < rhs,
            Self::Gt => lhs > rhs,
            Self::Eq => (lhs - rhs).abs() <= EQ_TOLERANCE * lhs.abs().max(rhs.abs()).max(1.0),
            Self::Unknown(_) => false,
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Le => "<=",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Gt => ">",
            Self::Eq => "==",
            Self::Unknown(other) => other.as_str(),
        };
        write!(f, "{s}")
    }
}

impl FromStr for Operator {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim() {
            "<=" => Self::Le,
            ">=" => Self::Ge,
            "<" => Self::Lt,
            ">" => Self::Gt,
            "==" | "=" => Self::Eq,
            other => Self::Unknown(other.to_string()),
        })
    }
}

/// Serializes through `Display`/`FromStr` so unknown values survive a round trip.
macro_rules! string_serde {
    ($name:ident) => {
        impl Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

string_serde!(ConditionKind);
string_serde!(Operator);

/// One predicate of a discount rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub kind: ConditionKind,
    pub operator: Operator,
    /// A number, a numeric string, or a status category.
    pub value: serde_json::Value,
}

/// A named, conditionally applied percentage off the base cost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscountRule {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(rename = "discount_percent")]
    pub percent: f64,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_from: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_to: Option<DateTime<Utc>>,
}

impl DiscountRule {
    /// Whether `now` falls in `[effective_from, effective_to)`.
    pub fn is_effective_at(&self, now: DateTime<Utc>) -> bool {
        self.effective_from.is_none_or(|from| from <= now)
            && self.effective_to.is_none_or(|to| now < to)
    }
}

/// Which side of the age threshold the legacy shutdown discount covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgeGate {
    /// Applies to resources created more than the threshold ago.
    #[default]
    OlderThan,
    /// Applies to resources created at most the threshold ago.
    Within,
}

/// Fixed discount for stopped resources, used when the catalog has no rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LegacyShutdownDiscount {
    pub name: String,
    pub percent: f64,
    pub age_threshold_days: i64,
    pub gate: AgeGate,
}

impl Default for LegacyShutdownDiscount {
    fn default() -> Self {
        Self {
            name: "Shutdown discount (90 days)".to_string(),
            percent: 90.0,
            age_threshold_days: 90,
            gate: AgeGate::OlderThan,
        }
    }
}

impl LegacyShutdownDiscount {
    #[allow(clippy::cast_precision_loss)]
    fn applies(&self, resource: &ResourceState, now: DateTime<Utc>) -> bool {
        if !resource.is_shut_off() {
            return false;
        }
        let age = age_days(resource, now);
        let threshold = self.age_threshold_days as f64;
        match self.gate {
            AgeGate::OlderThan => age > threshold,
            AgeGate::Within => age <= threshold,
        }
    }
}

/// The rules to evaluate for one calculation.
#[derive(Debug, Clone, Copy)]
pub enum RuleSets<'a> {
    /// Catalog rules: global first, then provider-scoped.
    Structured {
        global: &'a [DiscountRule],
        provider: &'a [DiscountRule],
    },
    /// No rule catalog; only the legacy shutdown discount.
    Legacy(&'a LegacyShutdownDiscount),
}

/// Inputs a condition may read.
pub struct RuleContext<'a> {
    pub resource: &'a ResourceState,
    /// Running hours already computed for the calculation window.
    pub running_hours: f64,
    pub as_of: &'a AsOf,
    pub gap_fill: &'a dyn GapFill,
}

/// Applies every matching discount to `item`.
pub fn apply_discounts(item: &mut CostLineItem, ctx: &RuleContext<'_>, rules: RuleSets<'_>) {
    match rules {
        RuleSets::Structured { global, provider } => {
            for rule in global.iter().chain(provider) {
                if rule_applies(rule, ctx) {
                    tracing::trace!(
                        resource_id = %ctx.resource.id,
                        rule_id = %rule.id,
                        percent = rule.percent,
                        "discount rule applied"
                    );
                    item.add_discount(&rule.name, rule.percent);
                }
            }
        }
        RuleSets::Legacy(legacy) => {
            if legacy.applies(ctx.resource, ctx.as_of.now) {
                item.add_discount(&legacy.name, legacy.percent);
            }
        }
    }
}

/// An enabled rule applies when all of its conditions hold.
pub fn rule_applies(rule: &DiscountRule, ctx: &RuleContext<'_>) -> bool {
    rule.enabled
        && rule
            .conditions
            .iter()
            .all(|condition| evaluate_condition(condition, ctx))
}

pub fn evaluate_condition(condition: &Condition, ctx: &RuleContext<'_>) -> bool {
    if let Operator::Unknown(op) = &condition.operator {
        tracing::warn!(operator = %op, "unsupported discount condition operator");
        return false;
    }

    let measured = match &condition.kind {
        ConditionKind::StatusCategory => return status_matches(condition, ctx.resource),
        ConditionKind::ResourceAgeDays | ConditionKind::ShutdownAgeDays => {
            age_days(ctx.resource, ctx.as_of.now)
        }
        ConditionKind::RunningHours => ctx.running_hours,
        ConditionKind::RunningMinutes => ctx.running_hours * 60.0,
        ConditionKind::MonthlyRunningHours => hours_matching(
            ctx.resource,
            RunState::Running,
            ctx.as_of.current_month,
            ctx.gap_fill,
        ),
        ConditionKind::Unknown(kind) => {
            tracing::warn!(condition_type = %kind, "unknown discount condition type");
            return false;
        }
    };

    let Some(literal) = numeric_literal(&condition.value) else {
        tracing::warn!(
            condition_type = %condition.kind,
            value = %condition.value,
            "discount condition value is not numeric"
        );
        return false;
    };
    condition.operator.compare(measured, literal)
}

fn status_matches(condition: &Condition, resource: &ResourceState) -> bool {
    let Some(expected) = condition.value.as_str() else {
        return false;
    };
    condition.operator == Operator::Eq
        && resource
            .run_state()
            .category()
            .eq_ignore_ascii_case(expected.trim())
}

fn numeric_literal(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
        _ => None,
    }
}

#[allow(clippy::cast_precision_loss)]
fn age_days(resource: &ResourceState, now: DateTime<Utc>) -> f64 {
    (now - resource.created_at).num_seconds() as f64 / SECONDS_PER_DAY
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interval::{OppositeOfCurrent, Window};
    use crate::state::{Observation, StateChangeRecord};
    use crate::types::{PriceClassId, ResourceId};
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 15, 12, 0, 0).unwrap()
    }

    fn resource(status: &str, power_state: i32, age: Duration) -> ResourceState {
        ResourceState::from_observation(&Observation {
            id: ResourceId::new("vm-1").unwrap(),
            name: "web".to_string(),
            price_class: PriceClassId::new("m2.c4m8").unwrap(),
            status: status.to_string(),
            power_state,
            created_at: now() - age,
            observed_at: now(),
            changed_at: Some(now() - age),
        })
    }

    fn condition(kind: &str, operator: &str, value: serde_json::Value) -> Condition {
        Condition {
            kind: kind.parse().unwrap(),
            operator: operator.parse().unwrap(),
            value,
        }
    }

    fn rule(id: &str, percent: f64, conditions: Vec<Condition>) -> DiscountRule {
        DiscountRule {
            id: id.to_string(),
            name: format!("rule {id}"),
            description: String::new(),
            conditions,
            percent,
            enabled: true,
            effective_from: None,
            effective_to: None,
        }
    }

    fn evaluate(
        resource: &ResourceState,
        running_hours: f64,
        base_cost: f64,
        rules: RuleSets<'_>,
    ) -> CostLineItem {
        let as_of = AsOf::at(&now());
        let ctx = RuleContext {
            resource,
            running_hours,
            as_of: &as_of,
            gap_fill: &OppositeOfCurrent,
        };
        let rate = if running_hours > 0.0 { base_cost / running_hours } else { 0.0 };
        let mut item = CostLineItem::new(resource, rate, running_hours);
        apply_discounts(&mut item, &ctx, rules);
        item
    }

    #[test]
    fn running_hours_threshold_discount() {
        let vm = resource("ACTIVE", 1, Duration::days(30));
        let rules = [rule("volume", 10.0, vec![condition("running_hours", ">=", json!(100))])];

        let item = evaluate(
            &vm,
            150.0,
            1000.0,
            RuleSets::Structured {
                global: &rules,
                provider: &[],
            },
        );

        assert!((item.total_discount - 100.0).abs() < 1e-9);
        assert!((item.final_cost - 900.0).abs() < 1e-9);
        assert_eq!(item.applied_discounts.len(), 1);
        assert_eq!(item.applied_discounts[0].rule_name, "rule volume");
    }

    #[test]
    fn matching_rules_stack_additively() {
        let vm = resource("ACTIVE", 1, Duration::days(30));
        let global = [rule("a", 10.0, Vec::new())];
        let provider = [rule("b", 20.0, Vec::new())];

        let item = evaluate(
            &vm,
            100.0,
            1000.0,
            RuleSets::Structured {
                global: &global,
                provider: &provider,
            },
        );

        // 1000 * 0.10 + 1000 * 0.20, not 1000 * (1 - 0.9 * 0.8)
        assert!((item.total_discount - 300.0).abs() < 1e-9);
        let order: Vec<_> = item
            .applied_discounts
            .iter()
            .map(|d| d.rule_name.as_str())
            .collect();
        assert_eq!(order, ["rule a", "rule b"]);
    }

    #[test]
    fn stacked_discounts_are_not_capped() {
        let vm = resource("ACTIVE", 1, Duration::days(30));
        let global = [rule("a", 70.0, Vec::new()), rule("b", 60.0, Vec::new())];

        let item = evaluate(
            &vm,
            10.0,
            100.0,
            RuleSets::Structured {
                global: &global,
                provider: &[],
            },
        );

        assert!((item.total_discount - 130.0).abs() < 1e-9);
        assert!((item.final_cost + 30.0).abs() < 1e-9);
    }

    #[test]
    fn all_conditions_must_hold() {
        let vm = resource("ACTIVE", 1, Duration::days(30));
        let rules = [rule(
            "both",
            10.0,
            vec![
                condition("running_hours", ">", json!(5)),
                condition("resource_age_days", "<", json!(7)),
            ],
        )];

        let item = evaluate(
            &vm,
            10.0,
            100.0,
            RuleSets::Structured {
                global: &rules,
                provider: &[],
            },
        );
        assert!(item.applied_discounts.is_empty());
    }

    #[test]
    fn disabled_rules_are_skipped() {
        let vm = resource("ACTIVE", 1, Duration::days(30));
        let mut disabled = rule("off", 50.0, Vec::new());
        disabled.enabled = false;

        let item = evaluate(
            &vm,
            10.0,
            100.0,
            RuleSets::Structured {
                global: &[disabled],
                provider: &[],
            },
        );
        assert_eq!(item.total_discount, 0.0);
    }

    #[test]
    fn malformed_conditions_fail_closed() {
        let vm = resource("ACTIVE", 1, Duration::days(30));
        let as_of = AsOf::at(&now());
        let ctx = RuleContext {
            resource: &vm,
            running_hours: 500.0,
            as_of: &as_of,
            gap_fill: &OppositeOfCurrent,
        };

        assert!(!evaluate_condition(&condition("cpu_credits", ">=", json!(0)), &ctx));
        assert!(!evaluate_condition(&condition("running_hours", "!=", json!(0)), &ctx));
        assert!(!evaluate_condition(&condition("running_hours", ">=", json!("lots")), &ctx));
        assert!(!evaluate_condition(&condition("running_hours", ">=", json!(null)), &ctx));
    }

    #[test]
    fn numeric_strings_are_accepted() {
        let vm = resource("ACTIVE", 1, Duration::days(30));
        let as_of = AsOf::at(&now());
        let ctx = RuleContext {
            resource: &vm,
            running_hours: 2.0,
            as_of: &as_of,
            gap_fill: &OppositeOfCurrent,
        };

        assert!(evaluate_condition(&condition("running_minutes", "==", json!("120")), &ctx));
        assert!(evaluate_condition(&condition("running_minutes", "<", json!(" 121.5 ")), &ctx));
    }

    #[test]
    fn running_minutes_equality_survives_hour_conversion() {
        // 31 * 60_000 / 3_600_000 * 60 is 31.000000000000004, not 31.
        for minutes in [31, 62, 123] {
            let vm = resource("ACTIVE", 1, Duration::minutes(minutes));
            let window = Window::new(vm.created_at, now());
            let as_of = AsOf::at(&now());
            let ctx = RuleContext {
                resource: &vm,
                running_hours: hours_matching(&vm, RunState::Running, window, &OppositeOfCurrent),
                as_of: &as_of,
                gap_fill: &OppositeOfCurrent,
            };

            let exact = condition("running_minutes", "==", json!(minutes));
            assert!(evaluate_condition(&exact, &ctx), "{minutes} minutes");
            let off_by_one = condition("running_minutes", "==", json!(minutes + 1));
            assert!(!evaluate_condition(&off_by_one, &ctx), "{minutes} minutes");
        }
    }

    #[test]
    fn age_conditions_use_creation_time() {
        let vm = resource("SHUTOFF", 4, Duration::days(100));
        let as_of = AsOf::at(&now());
        let ctx = RuleContext {
            resource: &vm,
            running_hours: 0.0,
            as_of: &as_of,
            gap_fill: &OppositeOfCurrent,
        };

        assert!(evaluate_condition(&condition("resource_age_days", ">", json!(90)), &ctx));
        assert!(evaluate_condition(&condition("shutdown_days", ">=", json!(100)), &ctx));
        assert!(!evaluate_condition(&condition("shutdown_days", "<=", json!(99)), &ctx));
    }

    #[test]
    fn status_category_compares_strings() {
        let running = resource("ACTIVE", 1, Duration::days(1));
        let stopped = resource("SHUTOFF", 4, Duration::days(1));
        let as_of = AsOf::at(&now());
        let is_running = condition("status", "==", json!("RUNNING"));

        for (vm, expected) in [(&running, true), (&stopped, false)] {
            let ctx = RuleContext {
                resource: vm,
                running_hours: 0.0,
                as_of: &as_of,
                gap_fill: &OppositeOfCurrent,
            };
            assert_eq!(evaluate_condition(&is_running, &ctx), expected);
        }
    }

    #[test]
    fn monthly_condition_ignores_calculation_window() {
        // Running since June 1st, so 14.5 days into the month at `now`.
        let mut vm = resource("ACTIVE", 1, Duration::days(60));
        vm.replace_history(vec![
            StateChangeRecord {
                status: "SHUTOFF".to_string(),
                power_state: 4,
                timestamp: now() - Duration::days(60),
            },
            StateChangeRecord {
                status: "ACTIVE".to_string(),
                power_state: 1,
                timestamp: Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(),
            },
        ]);
        let as_of = AsOf::at(&now());
        let ctx = RuleContext {
            resource: &vm,
            running_hours: 0.0,
            as_of: &as_of,
            gap_fill: &OppositeOfCurrent,
        };

        assert!(evaluate_condition(&condition("monthly_running_hours", "==", json!(348)), &ctx));
        assert!(!evaluate_condition(&condition("running_hours", ">", json!(0)), &ctx));
    }

    #[test]
    fn legacy_gate_older_than_threshold() {
        let legacy = LegacyShutdownDiscount::default();
        let old = resource("SHUTOFF", 4, Duration::days(120));
        let young = resource("SHUTOFF", 4, Duration::days(10));
        let running = resource("ACTIVE", 1, Duration::days(120));

        let item = evaluate(&old, 10.0, 100.0, RuleSets::Legacy(&legacy));
        assert!((item.total_discount - 90.0).abs() < 1e-9);
        assert_eq!(item.applied_discounts[0].rule_name, legacy.name);

        for vm in [&young, &running] {
            let item = evaluate(vm, 10.0, 100.0, RuleSets::Legacy(&legacy));
            assert!(item.applied_discounts.is_empty());
        }
    }

    #[test]
    fn legacy_gate_within_threshold() {
        let legacy = LegacyShutdownDiscount {
            gate: AgeGate::Within,
            ..LegacyShutdownDiscount::default()
        };
        let old = resource("SHUTOFF", 4, Duration::days(120));
        let young = resource("SHUTOFF", 4, Duration::days(10));

        let item = evaluate(&old, 10.0, 100.0, RuleSets::Legacy(&legacy));
        assert!(item.applied_discounts.is_empty());
        let item = evaluate(&young, 10.0, 100.0, RuleSets::Legacy(&legacy));
        assert_eq!(item.applied_discounts.len(), 1);
    }

    #[test]
    fn rule_validity_window() {
        let mut limited = rule("promo", 5.0, Vec::new());
        limited.effective_from = Some(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
        limited.effective_to = Some(Utc.with_ymd_and_hms(2025, 7, 1, 0, 0, 0).unwrap());

        assert!(limited.is_effective_at(now()));
        assert!(!limited.is_effective_at(Utc.with_ymd_and_hms(2024, 12, 31, 0, 0, 0).unwrap()));
        assert!(!limited.is_effective_at(Utc.with_ymd_and_hms(2025, 7, 1, 0, 0, 0).unwrap()));
    }

    #[test]
    fn rules_deserialize_from_catalog_json() {
        let json = r#"{
            "id": "long-run",
            "name": "Long running",
            "conditions": [
                {"type": "running_hours", "operator": ">=", "value": "100"},
                {"type": "gpu_hours", "operator": ">", "value": 1}
            ],
            "discount_percent": 15,
            "enabled": true
        }"#;
        let parsed: DiscountRule = serde_json::from_str(json).unwrap();

        assert_eq!(parsed.conditions[0].kind, ConditionKind::RunningHours);
        assert_eq!(parsed.conditions[0].operator, Operator::Ge);
        assert_eq!(
            parsed.conditions[1].kind,
            ConditionKind::Unknown("gpu_hours".to_string())
        );
        assert_eq!(parsed.percent, 15.0);

        let reserialized = serde_json::to_value(&parsed).unwrap();
        assert_eq!(reserialized["conditions"][1]["type"], "gpu_hours");
    }
}
