//! Rule Engine: condition → action routing of accepted updates.
//!
//! Rules are evaluated in priority order (lower first, declaration order on
//! ties). Every matching rule contributes its actions to one
//! [`PropagationDecision`]. Evaluation is pure: no side effects beyond the
//! returned decision.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use stocksync_core::{ChannelId, EngineError, EngineResult, RuleId};

use crate::update::{Field, InventoryUpdate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
    Contains,
    Changed,
}

/// How a condition combines with the result accumulated so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalJoin {
    #[default]
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleCondition {
    /// Dotted path into the update, e.g. `changes.quantity.current`.
    pub field: String,
    pub operator: Operator,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub logical: LogicalJoin,
}

impl RuleCondition {
    pub fn new(field: impl Into<String>, operator: Operator, value: Value) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
            logical: LogicalJoin::And,
        }
    }

    pub fn or(mut self) -> Self {
        self.logical = LogicalJoin::Or;
        self
    }

    fn matches(&self, doc: &Value) -> bool {
        let Some(actual) = resolve_path(doc, &self.field) else {
            return false;
        };
        match self.operator {
            Operator::Eq => values_equal(actual, &self.value),
            Operator::Ne => !values_equal(actual, &self.value),
            Operator::Gt => compare(actual, &self.value).is_some_and(|o| o.is_gt()),
            Operator::Gte => compare(actual, &self.value).is_some_and(|o| o.is_ge()),
            Operator::Lt => compare(actual, &self.value).is_some_and(|o| o.is_lt()),
            Operator::Lte => compare(actual, &self.value).is_some_and(|o| o.is_le()),
            Operator::In => self
                .value
                .as_array()
                .is_some_and(|set| set.iter().any(|v| values_equal(actual, v))),
            Operator::NotIn => self
                .value
                .as_array()
                .is_some_and(|set| !set.iter().any(|v| values_equal(actual, v))),
            Operator::Contains => match actual {
                Value::String(s) => self.value.as_str().is_some_and(|needle| s.contains(needle)),
                Value::Array(items) => items.iter().any(|v| values_equal(v, &self.value)),
                Value::Object(map) => self.value.as_str().is_some_and(|key| map.contains_key(key)),
                _ => false,
            },
            Operator::Changed => match actual {
                Value::Object(change) if change.contains_key("previous") && change.contains_key("current") => {
                    change.get("previous") != change.get("current")
                }
                Value::Null => false,
                _ => true,
            },
        }
    }
}

fn resolve_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(doc, |node, segment| match node {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransformOp {
    /// Round to `decimals` places (price to the nearest cent is `decimals: 2`).
    Round { decimals: u32 },
    Clamp {
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
}

impl TransformOp {
    fn apply(&self, value: &Value) -> Value {
        let Some(n) = value.as_f64() else {
            return value.clone();
        };
        let out = match *self {
            TransformOp::Round { decimals } => {
                let scale = 10_f64.powi(decimals.min(12) as i32);
                (n * scale).round() / scale
            }
            TransformOp::Clamp { min, max } => {
                let lower = min.map_or(n, |m| n.max(m));
                max.map_or(lower, |m| lower.min(m))
            }
        };
        if value.is_i64() || value.is_u64() {
            Value::from(out.round() as i64)
        } else {
            Value::from(out)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleAction {
    Propagate {
        #[serde(default)]
        immediate: bool,
        #[serde(default)]
        channels: Vec<ChannelId>,
    },
    Block {
        #[serde(default)]
        reason: Option<String>,
    },
    Transform {
        field: Field,
        op: TransformOp,
    },
    Alert {
        level: AlertLevel,
        message: String,
    },
    Retry {
        max_attempts: u32,
    },
    Queue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRule {
    #[serde(default)]
    pub id: RuleId,
    pub name: String,
    /// Lower runs first.
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub conditions: Vec<RuleCondition>,
    pub actions: Vec<RuleAction>,
    /// Source channels the rule applies to. Empty means every channel.
    #[serde(default)]
    pub channels: Vec<ChannelId>,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_from: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<DateTime<Utc>>,
}

fn default_active() -> bool {
    true
}

impl SyncRule {
    pub fn new(name: impl Into<String>, priority: u32) -> Self {
        Self {
            id: RuleId::new(),
            name: name.into(),
            priority,
            conditions: Vec::new(),
            actions: Vec::new(),
            channels: Vec::new(),
            active: true,
            valid_from: None,
            valid_until: None,
        }
    }

    pub fn when(mut self, condition: RuleCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn then(mut self, action: RuleAction) -> Self {
        self.actions.push(action);
        self
    }

    pub fn for_channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.channels = channels.into_iter().map(ChannelId::new).collect();
        self
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.name.trim().is_empty() {
            return Err(EngineError::validation("rule name cannot be empty"));
        }
        if self.actions.is_empty() {
            return Err(EngineError::validation(format!("rule '{}' has no actions", self.name)));
        }
        if let (Some(from), Some(until)) = (self.valid_from, self.valid_until) {
            if until <= from {
                return Err(EngineError::validation(format!(
                    "rule '{}': valid_until must be after valid_from",
                    self.name
                )));
            }
        }
        Ok(())
    }

    fn in_effect(&self, now: DateTime<Utc>) -> bool {
        self.active
            && self.valid_from.is_none_or(|from| now >= from)
            && self.valid_until.is_none_or(|until| now < until)
    }

    fn applies_to(&self, channel: &ChannelId) -> bool {
        self.channels.is_empty() || self.channels.contains(channel)
    }

    fn matches(&self, doc: &Value) -> bool {
        let mut conditions = self.conditions.iter();
        let Some(first) = conditions.next() else {
            return true;
        };
        conditions.fold(first.matches(doc), |acc, c| match c.logical {
            LogicalJoin::And => acc && c.matches(doc),
            LogicalJoin::Or => acc || c.matches(doc),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldTransform {
    pub field: Field,
    pub op: TransformOp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleAlert {
    pub rule_id: RuleId,
    pub level: AlertLevel,
    pub message: String,
}

/// Aggregated outcome of every matching rule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropagationDecision {
    /// Dispatch now and flush any backlog on the target lanes.
    pub immediate: bool,
    /// Explicit targets. Empty means every eligible channel.
    pub targets: Vec<ChannelId>,
    /// Set when a rule blocked the update. Takes precedence over everything else.
    pub blocked: Option<String>,
    /// Defer delivery to the next drain cycle. Overrides `immediate`.
    pub queued: bool,
    pub transforms: Vec<FieldTransform>,
    pub alerts: Vec<RuleAlert>,
    /// Per-update delivery attempt limit.
    pub retry_limit: Option<u32>,
    pub matched_rules: Vec<RuleId>,
}

impl PropagationDecision {
    pub fn is_blocked(&self) -> bool {
        self.blocked.is_some()
    }

    /// Apply normalization instructions in rule order.
    pub fn apply_transforms(&self, values: &mut BTreeMap<Field, Value>) {
        for t in &self.transforms {
            if let Some(v) = values.get_mut(&t.field) {
                *v = t.op.apply(v);
            }
        }
    }
}

/// Evaluates the configured rule set against updates.
#[derive(Debug, Clone, Default)]
pub struct RuleEngine {
    rules: Vec<SyncRule>,
}

impl RuleEngine {
    pub fn new(mut rules: Vec<SyncRule>) -> EngineResult<Self> {
        for rule in &rules {
            rule.validate()?;
        }
        // stable: declaration order breaks priority ties
        rules.sort_by_key(|r| r.priority);
        Ok(Self { rules })
    }

    pub fn rules(&self) -> &[SyncRule] {
        &self.rules
    }

    pub fn evaluate(&self, update: &InventoryUpdate, now: DateTime<Utc>) -> PropagationDecision {
        let mut decision = PropagationDecision::default();
        let doc = match serde_json::to_value(update) {
            Ok(doc) => doc,
            Err(err) => {
                tracing::warn!(update_id = %update.id, error = %err, "update not serializable for rule evaluation");
                return decision;
            }
        };

        for rule in &self.rules {
            if !rule.in_effect(now) || !rule.applies_to(&update.source_channel) || !rule.matches(&doc) {
                continue;
            }
            decision.matched_rules.push(rule.id);

            for action in &rule.actions {
                match action {
                    RuleAction::Propagate { immediate, channels } => {
                        decision.immediate |= *immediate;
                        for c in channels {
                            if !decision.targets.contains(c) {
                                decision.targets.push(c.clone());
                            }
                        }
                    }
                    RuleAction::Block { reason } => {
                        if decision.blocked.is_none() {
                            decision.blocked =
                                Some(reason.clone().unwrap_or_else(|| format!("blocked by rule '{}'", rule.name)));
                        }
                    }
                    RuleAction::Transform { field, op } => decision.transforms.push(FieldTransform {
                        field: *field,
                        op: *op,
                    }),
                    RuleAction::Alert { level, message } => decision.alerts.push(RuleAlert {
                        rule_id: rule.id,
                        level: *level,
                        message: message.clone(),
                    }),
                    RuleAction::Retry { max_attempts } => {
                        // first matching rule wins
                        decision.retry_limit.get_or_insert(*max_attempts);
                    }
                    RuleAction::Queue => decision.queued = true,
                }
            }
        }

        if decision.queued {
            decision.immediate = false;
        }
        decision
    }
}
