//! Category-keyed alias rule table
//!
//! Each rule names an alias path and how to find its source among a
//! template's data points. Category rules are tried before the common ones;
//! the first rule that resolves a path wins. Heuristics miss unusual naming,
//! which is why data points can carry an explicit `role`.

use std::collections::HashMap;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::Transform;
use crate::error::Result;
use crate::template::{DatapointDef, DeviceCategory};

/// How to recognize a data point
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Pattern {
    /// Exact data point ids, in order of preference
    #[serde(default)]
    pub ids: Vec<String>,
    /// Exact `role` values
    #[serde(default)]
    pub roles: Vec<String>,
    /// Matched against the id, then the display name
    #[serde(default)]
    pub regex: Option<String>,
}

impl Pattern {
    pub fn ids(ids: &[&str]) -> Self {
        Self {
            ids: ids.iter().map(|s| s.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn roles(mut self, roles: &[&str]) -> Self {
        self.roles = roles.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn regex(mut self, regex: &str) -> Self {
        self.regex = Some(regex.to_string());
        self
    }

    pub fn compile(&self) -> Result<CompiledPattern<'_>> {
        let regex = self.regex.as_deref().map(Regex::new).transpose()?;
        Ok(CompiledPattern {
            pattern: self,
            regex,
        })
    }
}

/// Pattern with its regex compiled
#[derive(Debug)]
pub struct CompiledPattern<'a> {
    pattern: &'a Pattern,
    regex: Option<Regex>,
}

impl CompiledPattern<'_> {
    fn regex_matches(&self, dp: &DatapointDef) -> bool {
        self.regex
            .as_ref()
            .is_some_and(|re| re.is_match(&dp.id) || dp.name.as_deref().is_some_and(|n| re.is_match(n)))
    }

    /// Best single match: exact id, then role, then regex, in template order
    pub fn find_one<'d>(
        &self,
        datapoints: &'d [DatapointDef],
        accept: impl Fn(&DatapointDef) -> bool,
    ) -> Option<&'d DatapointDef> {
        let candidates: Vec<&'d DatapointDef> = datapoints.iter().filter(|dp| accept(*dp)).collect();
        for id in &self.pattern.ids {
            if let Some(dp) = candidates.iter().find(|dp| &dp.id == id) {
                return Some(*dp);
            }
        }
        for role in &self.pattern.roles {
            if let Some(dp) = candidates
                .iter()
                .find(|dp| dp.role.as_deref() == Some(role.as_str()))
            {
                return Some(*dp);
            }
        }
        candidates.into_iter().find(|dp| self.regex_matches(dp))
    }

    /// Every match in template order
    pub fn find_all<'d>(
        &self,
        datapoints: &'d [DatapointDef],
        accept: impl Fn(&DatapointDef) -> bool,
    ) -> Vec<&'d DatapointDef> {
        datapoints
            .iter()
            .filter(|dp| accept(*dp))
            .filter(|dp| {
                self.pattern.ids.contains(&dp.id)
                    || dp
                        .role
                        .as_ref()
                        .is_some_and(|r| self.pattern.roles.contains(r))
                    || self.regex_matches(dp)
            })
            .collect()
    }
}

fn default_min_terms() -> usize {
    2
}

/// Where an alias gets its value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleSource {
    /// One data point, optionally transformed
    Direct {
        pattern: Pattern,
        #[serde(default)]
        transform: Transform,
    },
    /// `import - export`
    NetPower { import: Pattern, export: Pattern },
    /// Sum of all matches; needs at least `min_terms` of them
    Sum {
        pattern: Pattern,
        #[serde(default = "default_min_terms")]
        min_terms: usize,
    },
    /// `true` if any match is non-zero
    AnyNonZero { pattern: Pattern },
    /// Device connectivity
    Online,
}

/// One alias rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AliasRule {
    pub path: String,
    #[serde(flatten)]
    pub source: RuleSource,
}

impl AliasRule {
    pub fn direct(path: &str, pattern: Pattern) -> Self {
        Self::direct_with(path, pattern, Transform::Identity)
    }

    pub fn direct_with(path: &str, pattern: Pattern, transform: Transform) -> Self {
        Self {
            path: path.to_string(),
            source: RuleSource::Direct { pattern, transform },
        }
    }

    pub fn computed(path: &str, source: RuleSource) -> Self {
        Self {
            path: path.to_string(),
            source,
        }
    }

    /// `ctrl.*` aliases are written by users and need a writable source
    pub fn is_control(&self) -> bool {
        self.path.starts_with("ctrl.")
    }
}

/// Rules per category plus rules shared by all categories
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleTable {
    categories: HashMap<DeviceCategory, Vec<AliasRule>>,
    common: Vec<AliasRule>,
}

impl RuleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_rule(&mut self, category: DeviceCategory, rule: AliasRule) -> &mut Self {
        self.categories.entry(category).or_default().push(rule);
        self
    }

    pub fn add_common_rule(&mut self, rule: AliasRule) -> &mut Self {
        self.common.push(rule);
        self
    }

    /// Rules for a category, most specific first
    pub fn rules_for(&self, category: DeviceCategory) -> impl Iterator<Item = &AliasRule> {
        self.categories
            .get(&category)
            .into_iter()
            .flatten()
            .chain(self.common.iter())
    }

    /// Built-in vocabulary
    pub fn builtin() -> Self {
        use DeviceCategory::*;

        fn run() -> Pattern {
            Pattern::ids(&["run", "Conn", "enable", "on_off"])
                .roles(&["run"])
                .regex(r"(?i)^(run|enable|start_?stop|on_?off)$")
        }

        fn power(extra: &[&str]) -> Pattern {
            let mut ids = vec!["power", "active_power", "W"];
            ids.extend_from_slice(extra);
            Pattern::ids(&ids)
                .roles(&["power"])
                .regex(r"(?i)^(total_?)?(ac_?)?(active_?)?power(_?total)?$")
        }

        let mut table = Self::new();

        // PV inverters
        table
            .add_rule(PvInverter, AliasRule::direct("r.power", power(&["ac_power"])))
            .add_rule(
                PvInverter,
                AliasRule::direct(
                    "r.pv_power",
                    Pattern::ids(&["DCW", "dc_power", "pv_power"])
                        .roles(&["pv_power"])
                        .regex(r"(?i)^(dc|pv)_?power$"),
                ),
            )
            .add_rule(
                PvInverter,
                AliasRule::direct(
                    "r.energy_total",
                    Pattern::ids(&["WH", "energy_total", "total_yield"])
                        .roles(&["energy_total"])
                        .regex(r"(?i)^(total_?)?(energy|yield)(_?total)?$"),
                ),
            )
            .add_rule(
                PvInverter,
                AliasRule::direct(
                    "ctrl.power_limit_pct",
                    Pattern::ids(&["WMaxLimPct", "power_limit_pct"])
                        .roles(&["power_limit_pct"])
                        .regex(r"(?i)power_?limit_?(pct|percent)"),
                ),
            )
            .add_rule(PvInverter, AliasRule::direct("ctrl.run", run()));

        // Meters
        table
            .add_rule(Meter, AliasRule::direct("r.power", power(&["total_power"])))
            .add_rule(
                Meter,
                AliasRule::computed(
                    "r.power",
                    RuleSource::NetPower {
                        import: Pattern::ids(&["import_power"])
                            .roles(&["import_power"])
                            .regex(r"(?i)^(import_?power|power_?import)$"),
                        export: Pattern::ids(&["export_power"])
                            .roles(&["export_power"])
                            .regex(r"(?i)^(export_?power|power_?export)$"),
                    },
                ),
            )
            .add_rule(
                Meter,
                AliasRule::computed(
                    "r.power",
                    RuleSource::Sum {
                        pattern: Pattern::default().regex(r"(?i)^(power_?l[123]|p[123])$"),
                        min_terms: 2,
                    },
                ),
            )
            .add_rule(
                Meter,
                AliasRule::direct(
                    "r.energy_import",
                    Pattern::ids(&["energy_import", "TotWhImp"])
                        .roles(&["energy_import"])
                        .regex(r"(?i)^(import_?energy|energy_?import)$"),
                ),
            )
            .add_rule(
                Meter,
                AliasRule::direct(
                    "r.energy_export",
                    Pattern::ids(&["energy_export", "TotWhExp"])
                        .roles(&["energy_export"])
                        .regex(r"(?i)^(export_?energy|energy_?export)$"),
                ),
            )
            .add_rule(
                Meter,
                AliasRule::direct(
                    "r.voltage",
                    Pattern::ids(&["voltage", "voltage_l1", "PhVphA"])
                        .roles(&["voltage"])
                        .regex(r"(?i)^(voltage|u)_?(l?1)?$"),
                ),
            );

        // Batteries
        table
            .add_rule(
                Battery,
                AliasRule::direct(
                    "r.soc",
                    Pattern::ids(&["soc", "SoC"])
                        .roles(&["soc"])
                        .regex(r"(?i)(^soc$|state_?of_?charge)"),
                ),
            )
            .add_rule(Battery, AliasRule::direct("r.power", power(&["battery_power"])))
            .add_rule(
                Battery,
                AliasRule::direct(
                    "ctrl.power_setpoint",
                    Pattern::ids(&["power_setpoint"])
                        .roles(&["power_setpoint"])
                        .regex(r"(?i)^((power_?)?set_?point|target_?power)$"),
                ),
            )
            .add_rule(Battery, AliasRule::direct("ctrl.run", run()));

        // EV chargers
        table
            .add_rule(EvCharger, AliasRule::direct("r.power", power(&["charging_power"])))
            .add_rule(
                EvCharger,
                AliasRule::direct(
                    "r.session_energy",
                    Pattern::ids(&["session_energy"])
                        .roles(&["session_energy"])
                        .regex(r"(?i)session_?energy"),
                ),
            )
            .add_rule(
                EvCharger,
                AliasRule::direct(
                    "status.vehicle_connected",
                    Pattern::ids(&["vehicle_connected", "plugged"])
                        .roles(&["vehicle_connected"])
                        .regex(r"(?i)^(vehicle|car|plug)_?(connected|plugged)$"),
                ),
            )
            .add_rule(
                EvCharger,
                AliasRule::direct(
                    "ctrl.current_limit",
                    Pattern::ids(&["current_limit", "max_current"])
                        .roles(&["current_limit"])
                        .regex(r"(?i)^(max_?current|current_?limit)$"),
                ),
            )
            .add_rule(EvCharger, AliasRule::direct("ctrl.run", run()));

        // Heat pumps
        table
            .add_rule(HeatPump, AliasRule::direct("r.power", power(&["electrical_power"])))
            .add_rule(
                HeatPump,
                AliasRule::direct(
                    "r.flow_temperature",
                    Pattern::ids(&["flow_temperature"])
                        .roles(&["flow_temperature"])
                        .regex(r"(?i)^(flow|supply)_?temp(erature)?$"),
                ),
            )
            .add_rule(
                HeatPump,
                AliasRule::direct(
                    "r.outdoor_temperature",
                    Pattern::ids(&["outdoor_temperature"])
                        .roles(&["outdoor_temperature"])
                        .regex(r"(?i)^(outdoor|outside|ambient)_?temp(erature)?$"),
                ),
            )
            .add_rule(
                HeatPump,
                AliasRule::direct(
                    "ctrl.sg_ready",
                    Pattern::ids(&["sg_ready"])
                        .roles(&["sg_ready"])
                        .regex(r"(?i)^sg_?ready(_?mode)?$"),
                ),
            )
            .add_rule(HeatPump, AliasRule::direct("ctrl.run", run()));

        // I/O modules only get the common rules plus explicit roles
        table.add_rule(
            Io,
            AliasRule::direct("ctrl.run", Pattern::default().roles(&["run"])),
        );

        // Shared
        table
            .add_common_rule(AliasRule::computed("status.online", RuleSource::Online))
            .add_common_rule(AliasRule::computed(
                "alarm.fault",
                RuleSource::AnyNonZero {
                    pattern: Pattern::default()
                        .roles(&["fault", "alarm"])
                        .regex(r"(?i)(fault|alarm|error)(_?(code|state|flag|active))?$"),
                },
            ));

        table
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::template::Access;

    fn dp(id: &str, name: Option<&str>) -> DatapointDef {
        let mut dp = DatapointDef::new(id, Access::Ro);
        dp.name = name.map(str::to_string);
        dp
    }

    #[test]
    fn test_exact_id_beats_regex() {
        let dps = vec![dp("ac_power", None), dp("W", None)];
        let pattern = Pattern::ids(&["W"]).regex(r"(?i)power");
        let compiled = pattern.compile().unwrap();
        assert_eq!(compiled.find_one(&dps, |_| true).unwrap().id, "W");
    }

    #[test]
    fn test_regex_matches_name() {
        let dps = vec![dp("reg_40083", Some("AC Power"))];
        let pattern = Pattern::default().regex(r"(?i)^ac power$");
        let compiled = pattern.compile().unwrap();
        assert_eq!(compiled.find_one(&dps, |_| true).unwrap().id, "reg_40083");
    }

    #[test]
    fn test_role_match() {
        let mut a = dp("x1", None);
        a.role = Some("soc".into());
        let dps = vec![dp("x0", None), a];
        let pattern = Pattern::ids(&["soc"]).roles(&["soc"]);
        let compiled = pattern.compile().unwrap();
        assert_eq!(compiled.find_one(&dps, |_| true).unwrap().id, "x1");
    }

    #[test]
    fn test_find_all_keeps_template_order() {
        let dps = vec![dp("power_l2", None), dp("power_l1", None), dp("voltage", None)];
        let pattern = Pattern::default().regex(r"^power_l\d$");
        let compiled = pattern.compile().unwrap();
        let ids: Vec<&str> = compiled
            .find_all(&dps, |_| true)
            .iter()
            .map(|d| d.id.as_str())
            .collect();
        assert_eq!(ids, vec!["power_l2", "power_l1"]);
    }

    #[test]
    fn test_invalid_regex_is_error() {
        assert!(Pattern::default().regex("(").compile().is_err());
    }

    #[test]
    fn test_category_rules_before_common() {
        let table = RuleTable::builtin();
        let paths: Vec<&str> = table
            .rules_for(DeviceCategory::Battery)
            .map(|r| r.path.as_str())
            .collect();
        assert_eq!(paths.first(), Some(&"r.soc"));
        assert_eq!(paths.last(), Some(&"alarm.fault"));

        let other: Vec<&str> = table
            .rules_for(DeviceCategory::Other)
            .map(|r| r.path.as_str())
            .collect();
        assert_eq!(other, vec!["status.online", "alarm.fault"]);
    }

    #[test]
    fn test_rule_from_yaml() {
        let rule: AliasRule = serde_yaml::from_str(
            "path: r.power\nkind: direct\npattern: { ids: [P] }\ntransform: negate\n",
        )
        .unwrap();
        assert_eq!(
            rule.source,
            RuleSource::Direct {
                pattern: Pattern::ids(&["P"]),
                transform: Transform::Negate
            }
        );
        assert!(!rule.is_control());
    }
}
