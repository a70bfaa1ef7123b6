//! Relabeling rules.
//!
//! [`RuleEvaluator`] is the seam the rewrite engine depends on. [`RelabelRules`]
//! implements it with Prometheus `relabel_config` semantics, loaded from YAML:
//!
//! ```yaml
//! - source_labels: [env]
//!   regex: staging
//!   action: drop
//! - regex: shard
//!   action: labeldrop
//! ```

use crate::label::{Labels, LabelsBuilder, is_valid_label_name};
use crate::{RelabelError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Transforms the label set of a series.
pub trait RuleEvaluator {
    /// Returns the new label set, or `None` if the series must be dropped.
    fn evaluate(&self, labels: &Labels) -> Option<Labels>;
}

impl<F> RuleEvaluator for F
where
    F: Fn(&Labels) -> Option<Labels>,
{
    fn evaluate(&self, labels: &Labels) -> Option<Labels> {
        self(labels)
    }
}

/// Relabel action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Sets `target_label` to the expanded `replacement` if `regex` matches.
    #[default]
    Replace,
    /// Drops the series unless `regex` matches the joined source values.
    Keep,
    /// Drops the series if `regex` matches the joined source values.
    Drop,
    /// Drops the series unless the joined source values equal `target_label`'s value.
    KeepEqual,
    /// Drops the series if the joined source values equal `target_label`'s value.
    DropEqual,
    /// Not supported: sharding by hash has no use when rewriting stored series.
    HashMod,
    /// Copies labels whose name matches `regex` to the expanded `replacement` name.
    LabelMap,
    /// Removes labels whose name matches `regex`.
    LabelDrop,
    /// Removes labels whose name does not match `regex`.
    LabelKeep,
    /// Sets `target_label` to the lowercased joined source values.
    Lowercase,
    /// Sets `target_label` to the uppercased joined source values.
    Uppercase,
}

/// One relabel rule as written in the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelabelConfig {
    #[serde(default)]
    pub source_labels: Vec<String>,
    #[serde(default = "default_separator")]
    pub separator: String,
    #[serde(default = "default_regex")]
    pub regex: String,
    #[serde(default)]
    pub modulus: u64,
    #[serde(default)]
    pub target_label: String,
    #[serde(default = "default_replacement")]
    pub replacement: String,
    #[serde(default)]
    pub action: Action,
}

fn default_separator() -> String {
    ";".to_string()
}

fn default_regex() -> String {
    "(.*)".to_string()
}

fn default_replacement() -> String {
    "$1".to_string()
}

impl Default for RelabelConfig {
    fn default() -> Self {
        Self {
            source_labels: Vec::new(),
            separator: default_separator(),
            regex: default_regex(),
            modulus: 0,
            target_label: String::new(),
            replacement: default_replacement(),
            action: Action::Replace,
        }
    }
}

impl RelabelConfig {
    fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(RelabelError::InvalidConfiguration(msg));
        let action = self.action;

        if action == Action::HashMod {
            return invalid("relabel action hashmod is not supported".to_string());
        }

        let needs_target = matches!(
            action,
            Action::Replace
                | Action::Lowercase
                | Action::Uppercase
                | Action::KeepEqual
                | Action::DropEqual
        );
        if needs_target && self.target_label.is_empty() {
            return invalid(format!("relabel action {action:?} requires 'target_label'"));
        }
        if matches!(
            action,
            Action::Lowercase | Action::Uppercase | Action::KeepEqual | Action::DropEqual
        ) && !is_valid_label_name(&self.target_label)
        {
            return invalid(format!(
                "{:?} is an invalid 'target_label' for {action:?} action",
                self.target_label
            ));
        }
        if action == Action::Replace
            && !self.target_label.contains('$')
            && !is_valid_label_name(&self.target_label)
        {
            return invalid(format!(
                "{:?} is an invalid 'target_label' for replace action",
                self.target_label
            ));
        }

        if matches!(action, Action::LabelDrop | Action::LabelKeep)
            && (!self.source_labels.is_empty()
                || !self.target_label.is_empty()
                || self.separator != default_separator()
                || self.replacement != default_replacement())
        {
            return invalid(format!(
                "{action:?} action requires only 'regex', and no other fields"
            ));
        }
        if matches!(action, Action::KeepEqual | Action::DropEqual)
            && (self.regex != default_regex() || self.replacement != default_replacement())
        {
            return invalid(format!(
                "{action:?} action requires only 'source_labels' and 'target_label', and no other fields"
            ));
        }

        Ok(())
    }
}

/// A compiled, validated rule.
#[derive(Debug)]
struct Rule {
    config: RelabelConfig,
    regex: Regex,
}

impl Rule {
    fn compile(config: RelabelConfig) -> Result<Self> {
        config.validate()?;
        // Rules match whole values, never substrings.
        let regex = Regex::new(&format!("^(?s:{})$", config.regex))?;
        Ok(Self { config, regex })
    }

    /// Applies the rule; returns false if the series must be dropped.
    fn apply(&self, lb: &mut LabelsBuilder) -> bool {
        let cfg = &self.config;
        let value = cfg
            .source_labels
            .iter()
            .map(|name| lb.get(name).unwrap_or(""))
            .collect::<Vec<_>>()
            .join(&cfg.separator);

        match cfg.action {
            Action::Drop => {
                if self.regex.is_match(&value) {
                    return false;
                }
            }
            Action::Keep => {
                if !self.regex.is_match(&value) {
                    return false;
                }
            }
            Action::DropEqual => {
                if lb.get(&cfg.target_label).unwrap_or("") == value {
                    return false;
                }
            }
            Action::KeepEqual => {
                if lb.get(&cfg.target_label).unwrap_or("") != value {
                    return false;
                }
            }
            Action::Replace => {
                let Some(caps) = self.regex.captures(&value) else {
                    return true;
                };
                let mut target = String::new();
                caps.expand(&cfg.target_label, &mut target);
                if !is_valid_label_name(&target) {
                    return true;
                }
                let mut replacement = String::new();
                caps.expand(&cfg.replacement, &mut replacement);
                lb.set(target, replacement);
            }
            Action::Lowercase => {
                lb.set(cfg.target_label.clone(), value.to_lowercase());
            }
            Action::Uppercase => {
                lb.set(cfg.target_label.clone(), value.to_uppercase());
            }
            Action::LabelMap => {
                let mapped: Vec<(String, String)> = lb
                    .labels()
                    .iter()
                    .filter(|l| self.regex.is_match(&l.name))
                    .map(|l| {
                        let name = self.regex.replace_all(&l.name, cfg.replacement.as_str());
                        (name.into_owned(), l.value.clone())
                    })
                    .collect();
                for (name, value) in mapped {
                    lb.set(name, value);
                }
            }
            Action::LabelDrop => {
                lb.retain(|l| !self.regex.is_match(&l.name));
            }
            Action::LabelKeep => {
                lb.retain(|l| self.regex.is_match(&l.name));
            }
            Action::HashMod => unreachable!("rejected during validation"),
        }
        true
    }
}

/// An ordered list of relabel rules.
#[derive(Debug, Default)]
pub struct RelabelRules {
    rules: Vec<Rule>,
}

impl RelabelRules {
    /// Validates and compiles `configs`, preserving their order.
    pub fn new(configs: Vec<RelabelConfig>) -> Result<Self> {
        let rules = configs
            .into_iter()
            .map(Rule::compile)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    /// Parses a YAML list of relabel configs.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        let configs: Option<Vec<RelabelConfig>> = serde_yaml::from_str(yaml)?;
        Self::new(configs.unwrap_or_default())
    }

    /// Loads rules from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| RelabelError::io_at(path, e))?;
        Self::from_yaml(&yaml)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl RuleEvaluator for RelabelRules {
    fn evaluate(&self, labels: &Labels) -> Option<Labels> {
        let mut lb = LabelsBuilder::new(labels);
        for rule in &self.rules {
            if !rule.apply(&mut lb) {
                return None;
            }
        }
        Some(lb.build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::label::Label;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs.iter().map(|(n, v)| Label::new(*n, *v)).collect()
    }

    fn rules(yaml: &str) -> RelabelRules {
        RelabelRules::from_yaml(yaml).unwrap()
    }

    #[test]
    fn test_defaults_are_applied() {
        let configs: Vec<RelabelConfig> = serde_yaml::from_str("- target_label: x\n").unwrap();
        let config = &configs[0];
        assert_eq!(config.separator, ";");
        assert_eq!(config.regex, "(.*)");
        assert_eq!(config.replacement, "$1");
        assert_eq!(config.action, Action::Replace);
    }

    #[test]
    fn test_drop_matching_series() {
        let r = rules("- source_labels: [env]\n  regex: staging\n  action: drop\n");
        assert_eq!(r.evaluate(&labels(&[("app", "api"), ("env", "staging")])), None);
        let prod = labels(&[("app", "api"), ("env", "prod")]);
        assert_eq!(r.evaluate(&prod), Some(prod.clone()));
    }

    #[test]
    fn test_regex_is_anchored() {
        let r = rules("- source_labels: [env]\n  regex: stag\n  action: drop\n");
        let set = labels(&[("env", "staging")]);
        assert_eq!(r.evaluate(&set), Some(set.clone()));
    }

    #[test]
    fn test_keep_drops_non_matching_series() {
        let r = rules("- source_labels: [app]\n  regex: api|web\n  action: keep\n");
        assert!(r.evaluate(&labels(&[("app", "db")])).is_none());
        assert!(r.evaluate(&labels(&[("app", "web")])).is_some());
    }

    #[test]
    fn test_replace_with_capture_groups() {
        let r = rules(
            "- source_labels: [instance, job]\n  regex: '(.*):\\d+;(.*)'\n  target_label: host\n  replacement: '${1}-$2'\n",
        );
        let out = r
            .evaluate(&labels(&[("instance", "db1:9100"), ("job", "node")]))
            .unwrap();
        assert_eq!(out.get("host"), Some("db1-node"));
    }

    #[test]
    fn test_replace_without_match_leaves_labels_alone() {
        let r =
            rules("- source_labels: [env]\n  regex: prod\n  target_label: tier\n  replacement: gold\n");
        let set = labels(&[("env", "dev")]);
        assert_eq!(r.evaluate(&set), Some(set.clone()));
    }

    #[test]
    fn test_replace_with_empty_result_deletes_target() {
        let r = rules("- source_labels: [missing]\n  target_label: env\n");
        let out = r.evaluate(&labels(&[("app", "x"), ("env", "prod")])).unwrap();
        assert_eq!(out, labels(&[("app", "x")]));
    }

    #[test]
    fn test_labeldrop_and_labelkeep() {
        let set = labels(&[("app", "x"), ("shard", "1"), ("shard_group", "a")]);
        let drop = rules("- regex: shard.*\n  action: labeldrop\n");
        assert_eq!(drop.evaluate(&set), Some(labels(&[("app", "x")])));

        let keep = rules("- regex: shard\n  action: labelkeep\n");
        assert_eq!(keep.evaluate(&set), Some(labels(&[("shard", "1")])));
    }

    #[test]
    fn test_labelmap_copies_matching_labels() {
        let r = rules("- regex: __meta_(.+)\n  action: labelmap\n");
        let out = r
            .evaluate(&labels(&[("__meta_zone", "eu"), ("app", "x")]))
            .unwrap();
        assert_eq!(out.get("zone"), Some("eu"));
        assert_eq!(out.get("__meta_zone"), Some("eu"));
    }

    #[test]
    fn test_lowercase_and_uppercase() {
        let r = rules(
            "- source_labels: [env]\n  target_label: env\n  action: lowercase\n- source_labels: [app]\n  target_label: APP\n  action: uppercase\n",
        );
        let out = r.evaluate(&labels(&[("env", "PROD"), ("app", "api")])).unwrap();
        assert_eq!(out.get("env"), Some("prod"));
        assert_eq!(out.get("APP"), Some("API"));
    }

    #[test]
    fn test_keepequal_and_dropequal() {
        let keep = rules("- source_labels: [a]\n  target_label: b\n  action: keepequal\n");
        assert!(keep.evaluate(&labels(&[("a", "1"), ("b", "1")])).is_some());
        assert!(keep.evaluate(&labels(&[("a", "1"), ("b", "2")])).is_none());

        let drop = rules("- source_labels: [a]\n  target_label: b\n  action: dropequal\n");
        assert!(drop.evaluate(&labels(&[("a", "1"), ("b", "1")])).is_none());
    }

    #[test]
    fn test_rules_apply_in_order() {
        let r = rules(
            "- source_labels: [env]\n  regex: stg\n  target_label: env\n  replacement: staging\n- source_labels: [env]\n  regex: staging\n  action: drop\n",
        );
        assert!(r.evaluate(&labels(&[("env", "stg")])).is_none());
    }

    #[test]
    fn test_invalid_configs_are_rejected() {
        for yaml in [
            "- action: replace\n",
            "- action: lowercase\n  target_label: '1bad'\n",
            "- action: labeldrop\n  regex: x\n  target_label: y\n",
            "- action: hashmod\n  target_label: y\n  modulus: 2\n",
            "- source_labels: [a]\n  regex: '('\n  action: drop\n",
            "- action: explode\n",
            "- unknown_field: 1\n",
        ] {
            let err = RelabelRules::from_yaml(yaml).unwrap_err();
            assert_eq!(err.kind(), crate::ErrorKind::Configuration, "{yaml}");
        }
    }

    #[test]
    fn test_empty_yaml_yields_no_rules() {
        let r = RelabelRules::from_yaml("").unwrap();
        assert!(r.is_empty());
        let set = labels(&[("a", "b")]);
        assert_eq!(r.evaluate(&set), Some(set.clone()));
    }

    #[test]
    fn test_closures_are_evaluators() {
        let strip = |l: &Labels| {
            let mut lb = LabelsBuilder::new(l);
            lb.del("shard");
            Some(lb.build())
        };
        let out = strip.evaluate(&labels(&[("app", "x"), ("shard", "1")]));
        assert_eq!(out, Some(labels(&[("app", "x")])));
    }
}
