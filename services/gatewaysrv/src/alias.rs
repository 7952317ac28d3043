//! Alias engine
//!
//! Derives a protocol independent view of a device (`r.power`, `ctrl.run`,
//! `status.online`, ...) from its template. Derivation runs once per device
//! and only looks at the template, so the same template always yields the
//! same alias list. Values are recomputed after every successful poll and
//! acknowledged write.

pub mod rules;

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{GatewayError, Result};
use crate::template::{DatapointDef, Template};
use crate::value::{Value, ValueKind, ValueMap};

pub use rules::{AliasRule, Pattern, RuleSource, RuleTable};

/// Value transform between device and alias representation
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transform {
    #[default]
    Identity,
    /// Multiply on the way out of the device
    Scale(f64),
    Negate,
    /// Boolean inversion
    Not,
}

impl Transform {
    /// Device value to alias value
    pub fn from_device(&self, value: &Value) -> Option<Value> {
        match self {
            Self::Identity => Some(value.clone()),
            Self::Scale(factor) => value.as_f64().map(|v| Value::Float(v * factor)),
            Self::Negate => match value {
                Value::Int(i) => i.checked_neg().map(Value::Int),
                other => other.as_f64().map(|v| Value::Float(-v)),
            },
            Self::Not => value.as_bool().map(|b| Value::Bool(!b)),
        }
    }

    /// Alias value to device value
    pub fn to_device(&self, value: &Value) -> Option<Value> {
        match self {
            Self::Scale(factor) if *factor != 0.0 => {
                value.as_f64().map(|v| Value::Float(v / factor))
            },
            Self::Scale(_) => None,
            // Negation and inversion are their own inverse
            other => other.from_device(value),
        }
    }
}

/// Computed alias functions
#[derive(Debug, Clone, PartialEq)]
pub enum Computed {
    NetPower { import: String, export: String },
    Sum(Vec<String>),
    AnyNonZero(Vec<String>),
    Online,
}

/// Where an alias value comes from
#[derive(Debug, Clone, PartialEq)]
pub enum AliasSource {
    Direct { dp_id: String, transform: Transform },
    Computed(Computed),
}

/// Connectivity context for computed aliases
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AliasContext {
    pub connected: bool,
}

/// One derived alias
#[derive(Debug, Clone, PartialEq)]
pub struct AliasDef {
    pub path: String,
    pub source: AliasSource,
    pub kind: ValueKind,
    pub unit: Option<String>,
    pub writable: bool,
}

impl AliasDef {
    /// Current value, or `None` when the inputs are not available
    pub fn evaluate(&self, values: &ValueMap, ctx: &AliasContext) -> Option<Value> {
        match &self.source {
            AliasSource::Direct { dp_id, transform } => {
                values.get(dp_id).and_then(|v| transform.from_device(v))
            },
            AliasSource::Computed(Computed::NetPower { import, export }) => {
                let import = values.get(import)?.as_f64()?;
                let export = values.get(export)?.as_f64()?;
                Some(Value::Float(import - export))
            },
            AliasSource::Computed(Computed::Sum(ids)) => ids
                .iter()
                .map(|id| values.get(id).and_then(Value::as_f64))
                .sum::<Option<f64>>()
                .map(Value::Float),
            AliasSource::Computed(Computed::AnyNonZero(ids)) => {
                let present: Vec<&Value> = ids.iter().filter_map(|id| values.get(id)).collect();
                if present.is_empty() {
                    return None;
                }
                Some(Value::Bool(present.iter().any(|v| v.is_truthy())))
            },
            AliasSource::Computed(Computed::Online) => Some(Value::Bool(ctx.connected)),
        }
    }

    /// Data points this alias reads
    pub fn inputs(&self) -> Vec<&str> {
        match &self.source {
            AliasSource::Direct { dp_id, .. } => vec![dp_id.as_str()],
            AliasSource::Computed(Computed::NetPower { import, export }) => {
                vec![import.as_str(), export.as_str()]
            },
            AliasSource::Computed(Computed::Sum(ids) | Computed::AnyNonZero(ids)) => {
                ids.iter().map(String::as_str).collect()
            },
            AliasSource::Computed(Computed::Online) => Vec::new(),
        }
    }

    /// Translate a user write into a (data point id, device value) pair
    pub fn to_device(&self, value: &Value) -> Result<(String, Value)> {
        match &self.source {
            AliasSource::Direct { dp_id, transform } if self.writable => {
                let converted = transform.to_device(value).ok_or_else(|| {
                    GatewayError::codec(format!(
                        "Alias '{}' cannot convert {} for the device",
                        self.path, value
                    ))
                })?;
                Ok((dp_id.clone(), converted))
            },
            AliasSource::Direct { .. } => Err(GatewayError::unsupported(format!(
                "Alias '{}' is read-only",
                self.path
            ))),
            AliasSource::Computed(_) => Err(GatewayError::unsupported(format!(
                "Alias '{}' is computed and cannot be written",
                self.path
            ))),
        }
    }
}

/// Aliases of one device
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AliasSet {
    aliases: Vec<AliasDef>,
}

impl AliasSet {
    /// Derive aliases for a template; failures leave the device without aliases
    pub fn derive(template: &Template, table: &RuleTable) -> Self {
        match try_derive(template, table) {
            Ok(aliases) => {
                debug!(
                    "Template '{}': {} aliases derived",
                    template.id,
                    aliases.len()
                );
                Self { aliases }
            },
            Err(e) => {
                warn!("Template '{}': alias derivation failed: {}", template.id, e);
                Self::default()
            },
        }
    }

    pub fn get(&self, path: &str) -> Option<&AliasDef> {
        self.aliases.iter().find(|a| a.path == path)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AliasDef> {
        self.aliases.iter()
    }

    pub fn len(&self) -> usize {
        self.aliases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }

    /// Values of every alias that currently has one, in derivation order
    pub fn compute(&self, values: &ValueMap, ctx: &AliasContext) -> Vec<(&str, Value)> {
        self.aliases
            .iter()
            .filter_map(|alias| {
                alias
                    .evaluate(values, ctx)
                    .map(|v| (alias.path.as_str(), v.normalized(alias.kind, None)))
            })
            .collect()
    }
}

fn try_derive(template: &Template, table: &RuleTable) -> Result<Vec<AliasDef>> {
    let datapoints = &template.datapoints;
    let mut aliases: Vec<AliasDef> = Vec::new();
    let mut paths: HashSet<String> = HashSet::new();

    for rule in table.rules_for(template.category) {
        if paths.contains(&rule.path) {
            continue;
        }
        let control = rule.is_control();
        let accept = |dp: &DatapointDef| {
            if control {
                dp.is_writable()
            } else {
                dp.is_readable()
            }
        };

        let derived = match &rule.source {
            RuleSource::Direct { pattern, transform } => pattern
                .compile()?
                .find_one(datapoints, accept)
                .map(|dp| AliasDef {
                    path: rule.path.clone(),
                    source: AliasSource::Direct {
                        dp_id: dp.id.clone(),
                        transform: *transform,
                    },
                    kind: match transform {
                        Transform::Not => ValueKind::Boolean,
                        _ => dp.kind,
                    },
                    unit: dp.unit.clone(),
                    writable: dp.is_writable(),
                }),
            RuleSource::NetPower { import, export } => {
                let import = import.compile()?.find_one(datapoints, |dp| dp.is_readable());
                let export = export.compile()?.find_one(datapoints, |dp| dp.is_readable());
                match (import, export) {
                    (Some(import), Some(export)) => Some(computed(
                        rule,
                        Computed::NetPower {
                            import: import.id.clone(),
                            export: export.id.clone(),
                        },
                        ValueKind::Number,
                        import.unit.clone(),
                    )),
                    _ => None,
                }
            },
            RuleSource::Sum { pattern, min_terms } => {
                let terms = pattern.compile()?.find_all(datapoints, |dp| dp.is_readable());
                (terms.len() >= (*min_terms).max(1)).then(|| {
                    computed(
                        rule,
                        Computed::Sum(terms.iter().map(|dp| dp.id.clone()).collect()),
                        ValueKind::Number,
                        terms[0].unit.clone(),
                    )
                })
            },
            RuleSource::AnyNonZero { pattern } => {
                let inputs = pattern.compile()?.find_all(datapoints, |dp| {
                    dp.is_readable() && dp.kind != ValueKind::String
                });
                (!inputs.is_empty()).then(|| {
                    computed(
                        rule,
                        Computed::AnyNonZero(inputs.iter().map(|dp| dp.id.clone()).collect()),
                        ValueKind::Boolean,
                        None,
                    )
                })
            },
            RuleSource::Online => Some(computed(rule, Computed::Online, ValueKind::Boolean, None)),
        };

        if let Some(alias) = derived {
            paths.insert(alias.path.clone());
            aliases.push(alias);
        }
    }
    Ok(aliases)
}

fn computed(rule: &AliasRule, function: Computed, kind: ValueKind, unit: Option<String>) -> AliasDef {
    AliasDef {
        path: rule.path.clone(),
        source: AliasSource::Computed(function),
        kind,
        unit,
        writable: false,
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::template::DeviceCategory;

    fn template(yaml: &str) -> Template {
        Template::from_yaml(yaml).unwrap()
    }

    fn inverter() -> Template {
        template(
            r#"
id: inv
category: pv_inverter
datapoints:
  - { id: W, name: AC Power, unit: W }
  - { id: DCW, unit: W }
  - { id: WMaxLimPct, rw: rw }
  - { id: fault_code }
  - { id: serial, kind: string }
"#,
        )
    }

    #[test]
    fn test_derivation_is_idempotent() {
        let table = RuleTable::builtin();
        let template = inverter();
        let first = AliasSet::derive(&template, &table);
        let second = AliasSet::derive(&template, &table);
        assert_eq!(first, second);
        assert!(!first.is_empty());

        // No duplicate paths
        let paths: HashSet<&str> = first.iter().map(|a| a.path.as_str()).collect();
        assert_eq!(paths.len(), first.len());
    }

    #[test]
    fn test_inverter_vocabulary() {
        let aliases = AliasSet::derive(&inverter(), &RuleTable::builtin());
        let power = aliases.get("r.power").unwrap();
        assert_eq!(
            power.source,
            AliasSource::Direct {
                dp_id: "W".into(),
                transform: Transform::Identity
            }
        );
        assert_eq!(power.unit.as_deref(), Some("W"));
        assert!(!power.writable);

        assert!(aliases.get("r.pv_power").is_some());
        assert!(aliases.get("ctrl.power_limit_pct").unwrap().writable);
        assert!(aliases.get("ctrl.run").is_none());
        assert!(aliases.get("status.online").is_some());
        assert_eq!(
            aliases.get("alarm.fault").unwrap().source,
            AliasSource::Computed(Computed::AnyNonZero(vec!["fault_code".into()]))
        );
    }

    #[test]
    fn test_meter_net_power_fallback() {
        let meter = template(
            "id: m\ncategory: meter\ndatapoints:\n  - { id: import_power }\n  - { id: export_power }\n",
        );
        let aliases = AliasSet::derive(&meter, &RuleTable::builtin());
        let alias = aliases.get("r.power").unwrap();

        let mut values = ValueMap::new();
        values.insert("import_power".into(), Value::Int(1200));
        values.insert("export_power".into(), Value::Int(200));
        let ctx = AliasContext { connected: true };
        assert_eq!(alias.evaluate(&values, &ctx), Some(Value::Float(1000.0)));

        values.remove("export_power");
        assert_eq!(alias.evaluate(&values, &ctx), None);
    }

    #[test]
    fn test_meter_phase_sum() {
        let meter = template(
            "id: m\ncategory: meter\ndatapoints:\n  - { id: power_l1 }\n  - { id: power_l2 }\n  - { id: power_l3 }\n",
        );
        let aliases = AliasSet::derive(&meter, &RuleTable::builtin());
        let mut values = ValueMap::new();
        for (i, id) in ["power_l1", "power_l2", "power_l3"].iter().enumerate() {
            values.insert(id.to_string(), Value::Int(100 * (i as i64 + 1)));
        }
        let computed = aliases.compute(&values, &AliasContext::default());
        assert!(computed.contains(&("r.power", Value::Int(600))));
    }

    #[test]
    fn test_compute_skips_missing_and_reports_online() {
        let aliases = AliasSet::derive(&inverter(), &RuleTable::builtin());
        let mut values = ValueMap::new();
        values.insert("W".into(), Value::Float(1500.25));

        let computed = aliases.compute(&values, &AliasContext { connected: false });
        assert!(computed.contains(&("r.power", Value::Float(1500.25))));
        assert!(computed.contains(&("status.online", Value::Bool(false))));
        // DCW missing from the value set, fault_code too
        assert!(!computed.iter().any(|(p, _)| *p == "r.pv_power"));
        assert!(!computed.iter().any(|(p, _)| *p == "alarm.fault"));
    }

    #[test]
    fn test_alias_writes() {
        let aliases = AliasSet::derive(&inverter(), &RuleTable::builtin());
        let (dp, value) = aliases
            .get("ctrl.power_limit_pct")
            .unwrap()
            .to_device(&Value::Int(50))
            .unwrap();
        assert_eq!(dp, "WMaxLimPct");
        assert_eq!(value, Value::Int(50));

        assert!(matches!(
            aliases.get("status.online").unwrap().to_device(&Value::Bool(true)),
            Err(GatewayError::UnsupportedOperation(_))
        ));
        assert!(matches!(
            aliases.get("r.power").unwrap().to_device(&Value::Int(1)),
            Err(GatewayError::UnsupportedOperation(_))
        ));
    }

    #[test]
    fn test_transforms_are_bidirectional() {
        let scale = Transform::Scale(0.001);
        let out = scale.from_device(&Value::Int(2500)).unwrap();
        assert!((out.as_f64().unwrap() - 2.5).abs() < 1e-9);
        let back = scale.to_device(&out).unwrap();
        assert!((back.as_f64().unwrap() - 2500.0).abs() < 1e-6);

        assert_eq!(Transform::Negate.from_device(&Value::Int(5)), Some(Value::Int(-5)));
        assert_eq!(Transform::Not.to_device(&Value::Bool(true)), Some(Value::Bool(false)));
        assert_eq!(Transform::Scale(0.0).to_device(&Value::Int(1)), None);
    }

    #[test]
    fn test_bad_rule_leaves_device_without_aliases() {
        let mut table = RuleTable::new();
        table.add_rule(
            DeviceCategory::PvInverter,
            AliasRule::direct("r.power", Pattern::default().regex("([")),
        );
        let aliases = AliasSet::derive(&inverter(), &table);
        assert!(aliases.is_empty());
    }
}
