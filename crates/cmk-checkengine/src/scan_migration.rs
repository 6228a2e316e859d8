//! Translation of legacy scan functions into detection specifications.
//!
//! A scan function is given as a [`ScanExpr`] tree covering the restricted
//! grammar legacy scan functions were written in. [`migrate_scan_function`]
//! translates it mechanically; anything outside the grammar is rejected with
//! [`PluginError::MigrationNotSupported`].

use crate::detection::{
    all_of, any_of, contains, endswith, equals, exists, not_, not_contains, not_endswith,
    not_equals, not_exists, not_startswith, startswith, DetectionSpec,
};
use crate::error::{PluginError, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

const SYS_DESCR: &str = ".1.3.6.1.2.1.1.1.0";
const SYS_OBJECT_ID: &str = ".1.3.6.1.2.1.1.2.0";

/// Helper functions that cannot be expressed as a detection spec.
const IRREDUCIBLE_HELPERS: &[&str] = &["_is_ucd_mem", "is_hp_printer_with_duplex_unit"];

/// Parsed body of a legacy scan function.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ScanExpr {
    And { operands: Vec<ScanExpr> },
    Or { operands: Vec<ScanExpr> },
    Not { operand: Box<ScanExpr> },
    /// `oid(x) == value`
    Eq { oid: String, value: String },
    /// `oid(x) != value`
    NotEq { oid: String, value: String },
    /// `oid(x) in [values]`
    In { oid: String, values: Vec<String> },
    /// `oid(x).startswith(value)`
    StartsWith { oid: String, value: String },
    /// `oid(x).endswith(value)`
    EndsWith { oid: String, value: String },
    /// `value in oid(x)`
    Contains { oid: String, value: String },
    /// `oid(x)` used as a truth value.
    Exists { oid: String },
    /// `re.match(pattern, oid(x))`
    RegexMatch { oid: String, pattern: String },
    /// `oid(x) < value` and friends.
    Compare { oid: String, operator: String, value: String },
    /// Call of a named helper function.
    Call { function: String },
}

impl ScanExpr {
    /// Content fingerprint of the expression.
    pub fn fingerprint(&self) -> Result<blake3::Hash> {
        let bytes = serde_json::to_vec(self)
            .map_err(|e| PluginError::InvalidValue(format!("cannot serialize expression: {}", e)))?;
        Ok(blake3::hash(&bytes))
    }
}

fn helper_spec(function: &str) -> Result<DetectionSpec> {
    match function {
        "is_netapp_filer" => Ok(any_of([
            contains(SYS_DESCR, "ontap"),
            startswith(SYS_OBJECT_ID, ".1.3.6.1.4.1.789"),
        ])),
        "_is_fsc_or_windows" => Ok(any_of([
            startswith(SYS_OBJECT_ID, ".1.3.6.1.4.1.231"),
            startswith(SYS_OBJECT_ID, ".1.3.6.1.4.1.311"),
            startswith(SYS_OBJECT_ID, ".1.3.6.1.4.1.8072"),
        ])),
        "_is_ucd" => Ok(any_of([
            contains(SYS_DESCR, "linux"),
            contains(SYS_DESCR, "cmc-tc"),
            contains(SYS_DESCR, "hp onboard administrator"),
            contains(SYS_DESCR, "barracuda"),
            contains(SYS_DESCR, "pfsense"),
            contains(SYS_DESCR, "genugate"),
            contains(SYS_DESCR, "bomgar"),
            contains(SYS_DESCR, "pulse secure"),
            all_of([
                equals(SYS_OBJECT_ID, ".1.3.6.1.4.1.8072.3.2.10"),
                contains(SYS_DESCR, "version"),
                contains(SYS_DESCR, "serial"),
            ]),
        ])),
        "scan_ricoh_printer" => Ok(all_of([
            contains(SYS_DESCR, "ricoh"),
            exists(".1.3.6.1.4.1.367.3.2.1.2.19.5.1.5.1"),
        ])),
        other if IRREDUCIBLE_HELPERS.contains(&other) => Err(PluginError::MigrationNotSupported(
            format!("helper {} cannot be expressed as a detection spec", other),
        )),
        other => Err(PluginError::MigrationNotSupported(format!(
            "call of unknown function {}",
            other
        ))),
    }
}

fn negate(expr: &ScanExpr) -> Result<DetectionSpec> {
    match expr {
        ScanExpr::Eq { oid, value } => Ok(not_equals(oid, value)),
        ScanExpr::NotEq { oid, value } => Ok(equals(oid, value)),
        ScanExpr::StartsWith { oid, value } => Ok(not_startswith(oid, value)),
        ScanExpr::EndsWith { oid, value } => Ok(not_endswith(oid, value)),
        ScanExpr::Contains { oid, value } => Ok(not_contains(oid, value)),
        ScanExpr::Exists { oid } => Ok(not_exists(oid)),
        ScanExpr::Not { operand } => migrate_scan_function(operand),
        other => {
            let spec = migrate_scan_function(other)?;
            not_(&spec).map_err(|_| {
                PluginError::MigrationNotSupported(format!(
                    "negation of {} clause(s) is not reducible",
                    spec.clauses().len()
                ))
            })
        }
    }
}

/// Translates one scan function.
pub fn migrate_scan_function(expr: &ScanExpr) -> Result<DetectionSpec> {
    match expr {
        ScanExpr::And { operands } => Ok(all_of(
            operands
                .iter()
                .map(migrate_scan_function)
                .collect::<Result<Vec<_>>>()?,
        )),
        ScanExpr::Or { operands } => Ok(any_of(
            operands
                .iter()
                .map(migrate_scan_function)
                .collect::<Result<Vec<_>>>()?,
        )),
        ScanExpr::Not { operand } => negate(operand),
        ScanExpr::Eq { oid, value } => Ok(equals(oid, value)),
        ScanExpr::NotEq { oid, value } => Ok(not_equals(oid, value)),
        ScanExpr::In { oid, values } => Ok(any_of(values.iter().map(|v| equals(oid, v)))),
        ScanExpr::StartsWith { oid, value } => Ok(startswith(oid, value)),
        ScanExpr::EndsWith { oid, value } => Ok(endswith(oid, value)),
        ScanExpr::Contains { oid, value } => Ok(contains(oid, value)),
        ScanExpr::Exists { oid } => Ok(exists(oid)),
        ScanExpr::RegexMatch { oid, pattern } => Err(PluginError::MigrationNotSupported(format!(
            "regular expression {:?} on {}",
            pattern, oid
        ))),
        ScanExpr::Compare { oid, operator, .. } => Err(PluginError::MigrationNotSupported(
            format!("comparison {:?} on {}", operator, oid),
        )),
        ScanExpr::Call { function } => helper_spec(function),
    }
}

/// Memoizing migrator. Identical expressions are translated once.
#[derive(Debug, Default)]
pub struct ScanFunctionMigrator {
    memo: DashMap<blake3::Hash, Result<DetectionSpec>>,
}

impl ScanFunctionMigrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn migrate(&self, expr: &ScanExpr) -> Result<DetectionSpec> {
        let key = expr.fingerprint()?;
        if let Some(hit) = self.memo.get(&key) {
            tracing::debug!(fingerprint = %key, "scan migration memo hit");
            return hit.clone();
        }
        let outcome = migrate_scan_function(expr);
        self.memo.insert(key, outcome.clone());
        outcome
    }

    /// Translates a named set of scan functions.
    pub fn migrate_all(
        &self,
        functions: &BTreeMap<String, ScanExpr>,
    ) -> BTreeMap<String, Result<DetectionSpec>> {
        functions
            .iter()
            .map(|(name, expr)| {
                let outcome = self.migrate(expr);
                if let Err(e) = &outcome {
                    tracing::warn!(function = %name, error = %e, "scan function not migrated");
                }
                (name.clone(), outcome)
            })
            .collect()
    }

    /// Number of distinct expressions translated so far.
    pub fn memo_len(&self) -> usize {
        self.memo.len()
    }
}

/// Reads a JSON object of named scan expressions.
pub fn load_scan_functions(path: &Path) -> Result<BTreeMap<String, ScanExpr>> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| PluginError::InvalidValue(format!("cannot read {}: {}", path.display(), e)))?;
    serde_json::from_str(&text)
        .map_err(|e| PluginError::InvalidValue(format!("cannot parse {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn oid_startswith(value: &str) -> ScanExpr {
        ScanExpr::StartsWith {
            oid: SYS_OBJECT_ID.to_string(),
            value: value.to_string(),
        }
    }

    #[test]
    fn test_boolean_structure() {
        let expr = ScanExpr::And {
            operands: vec![
                ScanExpr::Or {
                    operands: vec![oid_startswith(".1.3.6.1.4.1.9"), oid_startswith(".1.3.6.1.4.1.5")],
                },
                ScanExpr::Exists {
                    oid: ".1.3.6.1.4.1.9.9.13.1.3.1.3.*".to_string(),
                },
            ],
        };
        let spec = migrate_scan_function(&expr).unwrap();
        assert_eq!(spec.clauses().len(), 2);
        assert_eq!(spec.clauses()[1][0].pattern, "\\.1\\.3\\.6\\.1\\.4\\.1\\.5.*");
    }

    #[test]
    fn test_in_becomes_or_of_equals() {
        let expr = ScanExpr::In {
            oid: SYS_OBJECT_ID.to_string(),
            values: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(
            migrate_scan_function(&expr).unwrap(),
            any_of([equals(SYS_OBJECT_ID, "a"), equals(SYS_OBJECT_ID, "b")])
        );
    }

    #[test]
    fn test_negation_of_single_atom() {
        let expr = ScanExpr::Not {
            operand: Box::new(ScanExpr::Contains {
                oid: SYS_DESCR.to_string(),
                value: "linux".to_string(),
            }),
        };
        assert_eq!(migrate_scan_function(&expr).unwrap(), not_contains(SYS_DESCR, "linux"));

        let single_and = ScanExpr::Not {
            operand: Box::new(ScanExpr::And {
                operands: vec![ScanExpr::Exists {
                    oid: SYS_DESCR.to_string(),
                }],
            }),
        };
        assert_eq!(migrate_scan_function(&single_and).unwrap(), not_exists(SYS_DESCR));
    }

    #[test]
    fn test_multi_clause_negation_rejected() {
        let expr = ScanExpr::Not {
            operand: Box::new(ScanExpr::Or {
                operands: vec![oid_startswith("a"), oid_startswith("b")],
            }),
        };
        assert!(matches!(
            migrate_scan_function(&expr),
            Err(PluginError::MigrationNotSupported(_))
        ));
    }

    #[test]
    fn test_unsupported_grammar() {
        let regex = ScanExpr::RegexMatch {
            oid: SYS_DESCR.to_string(),
            pattern: "Linux.*".to_string(),
        };
        let compare = ScanExpr::Compare {
            oid: SYS_DESCR.to_string(),
            operator: "<".to_string(),
            value: "5".to_string(),
        };
        let irreducible = ScanExpr::Call {
            function: "_is_ucd_mem".to_string(),
        };
        for expr in [regex, compare, irreducible] {
            assert!(matches!(
                migrate_scan_function(&expr),
                Err(PluginError::MigrationNotSupported(_))
            ));
        }
        let helper = ScanExpr::Call {
            function: "is_netapp_filer".to_string(),
        };
        assert_eq!(migrate_scan_function(&helper).unwrap().clauses().len(), 2);
    }

    #[test]
    fn test_helper_specs_match_real_device_strings() {
        let call = |function: &str| {
            migrate_scan_function(&ScanExpr::Call {
                function: function.to_string(),
            })
            .unwrap()
            .compile()
            .unwrap()
        };
        let device = |descr: &'static str, object_id: &'static str| {
            move |oid: &str| match oid {
                SYS_DESCR => Some(descr.to_string()),
                SYS_OBJECT_ID => Some(object_id.to_string()),
                _ => None,
            }
        };
        let linux = device(
            "Linux monitoring-01 5.10.0-21-amd64 #1 SMP Debian 5.10.162-1 x86_64",
            ".1.3.6.1.4.1.8072.3.2.10",
        );
        let cisco = device("Cisco IOS Software, C2960 Software\nTechnical Support", ".1.3.6.1.4.1.9.1.1208");
        let filer = device("NetApp Release 9.8P5: Thu Jun 24 2021\nData ONTAP", ".1.3.6.1.4.1.789.2.5");

        let ucd = call("_is_ucd");
        assert!(ucd.evaluate(linux));
        assert!(!ucd.evaluate(cisco));
        let netapp = call("is_netapp_filer");
        assert!(netapp.evaluate(filer));
        assert!(!netapp.evaluate(cisco));
        assert!(!call("scan_ricoh_printer").evaluate(device("RICOH Aficio MP C3003", ".1.3.6.1.4.1.367.1.1")));
    }

    #[test]
    fn test_memo_shares_identical_functions() {
        let migrator = ScanFunctionMigrator::new();
        let functions: BTreeMap<String, ScanExpr> = serde_json::from_value(json!({
            "cisco_cpu": {"op": "starts_with", "oid": SYS_OBJECT_ID, "value": ".1.3.6.1.4.1.9"},
            "cisco_mem": {"op": "starts_with", "oid": SYS_OBJECT_ID, "value": ".1.3.6.1.4.1.9"},
            "hr_mem": {"op": "regex_match", "oid": SYS_DESCR, "pattern": ".*"}
        }))
        .unwrap();
        let outcomes = migrator.migrate_all(&functions);
        assert!(outcomes["cisco_cpu"].is_ok());
        assert_eq!(outcomes["cisco_cpu"], outcomes["cisco_mem"]);
        assert!(outcomes["hr_mem"].is_err());
        assert_eq!(migrator.memo_len(), 2);
    }
}
