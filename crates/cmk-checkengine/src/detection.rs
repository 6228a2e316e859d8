//! SNMP detection specifications.
//!
//! A [`DetectionSpec`] is an OR of ANDs of [`DetectAtom`]s. Each atom holds an
//! OID, a regular expression matched against the start of the OID's value and
//! the expected outcome of that match. Patterns match case-insensitively and
//! `.` spans newlines.

use crate::error::{PluginError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// One `(oid, pattern, expected)` triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DetectAtom {
    pub oid: String,
    pub pattern: String,
    pub expected: bool,
}

impl DetectAtom {
    pub fn new(oid: &str, pattern: String, expected: bool) -> Self {
        Self {
            oid: oid.to_string(),
            pattern,
            expected,
        }
    }

    /// The same atom with the expected outcome flipped.
    pub fn negated(&self) -> Self {
        Self {
            expected: !self.expected,
            ..self.clone()
        }
    }

    fn compile(&self) -> Result<CompiledAtom> {
        let regex = Regex::new(&format!("(?is)^(?:{})", self.pattern)).map_err(|e| {
            PluginError::InvalidValue(format!("bad detection pattern {:?}: {}", self.pattern, e))
        })?;
        Ok(CompiledAtom {
            oid: self.oid.clone(),
            regex,
            expected: self.expected,
        })
    }
}

#[derive(Debug, Clone)]
struct CompiledAtom {
    oid: String,
    regex: Regex,
    expected: bool,
}

impl CompiledAtom {
    fn evaluate(&self, value: Option<&str>) -> bool {
        let matched = value.map(|v| self.regex.is_match(v)).unwrap_or(false);
        matched == self.expected
    }
}

/// A [`DetectionSpec`] with every pattern compiled, for repeated evaluation.
#[derive(Debug, Clone)]
pub struct CompiledDetectionSpec {
    clauses: Vec<Vec<CompiledAtom>>,
}

impl CompiledDetectionSpec {
    /// Evaluates against OID values; a missing OID never matches the pattern.
    pub fn evaluate<F>(&self, value_of: F) -> bool
    where
        F: Fn(&str) -> Option<String>,
    {
        self.clauses.iter().any(|clause| {
            clause
                .iter()
                .all(|atom| atom.evaluate(value_of(&atom.oid).as_deref()))
        })
    }
}

/// Disjunction of conjunctions of atoms.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DetectionSpec(pub Vec<Vec<DetectAtom>>);

impl DetectionSpec {
    fn atom(atom: DetectAtom) -> Self {
        Self(vec![vec![atom]])
    }

    pub fn clauses(&self) -> &[Vec<DetectAtom>] {
        &self.0
    }

    /// The only atom, if there is exactly one.
    pub fn single_atom(&self) -> Option<&DetectAtom> {
        match self.0.as_slice() {
            [clause] => match clause.as_slice() {
                [atom] => Some(atom),
                _ => None,
            },
            _ => None,
        }
    }

    /// Compiles every pattern; fails on the first invalid one.
    pub fn compile(&self) -> Result<CompiledDetectionSpec> {
        let clauses = self
            .0
            .iter()
            .map(|clause| clause.iter().map(DetectAtom::compile).collect::<Result<Vec<_>>>())
            .collect::<Result<Vec<_>>>()?;
        Ok(CompiledDetectionSpec { clauses })
    }

    /// One-shot evaluation; use [`DetectionSpec::compile`] to evaluate many devices.
    pub fn evaluate<F>(&self, value_of: F) -> Result<bool>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(self.compile()?.evaluate(value_of))
    }
}

pub fn exists(oid: &str) -> DetectionSpec {
    DetectionSpec::atom(DetectAtom::new(oid, ".*".to_string(), true))
}

pub fn not_exists(oid: &str) -> DetectionSpec {
    DetectionSpec::atom(DetectAtom::new(oid, ".*".to_string(), false))
}

pub fn equals(oid: &str, value: &str) -> DetectionSpec {
    DetectionSpec::atom(DetectAtom::new(oid, format!("{}$", regex::escape(value)), true))
}

pub fn not_equals(oid: &str, value: &str) -> DetectionSpec {
    DetectionSpec::atom(DetectAtom::new(oid, format!("{}$", regex::escape(value)), false))
}

pub fn startswith(oid: &str, value: &str) -> DetectionSpec {
    DetectionSpec::atom(DetectAtom::new(oid, format!("{}.*", regex::escape(value)), true))
}

pub fn not_startswith(oid: &str, value: &str) -> DetectionSpec {
    DetectionSpec::atom(DetectAtom::new(oid, format!("{}.*", regex::escape(value)), false))
}

pub fn endswith(oid: &str, value: &str) -> DetectionSpec {
    DetectionSpec::atom(DetectAtom::new(oid, format!(".*{}$", regex::escape(value)), true))
}

pub fn not_endswith(oid: &str, value: &str) -> DetectionSpec {
    DetectionSpec::atom(DetectAtom::new(oid, format!(".*{}$", regex::escape(value)), false))
}

pub fn contains(oid: &str, value: &str) -> DetectionSpec {
    DetectionSpec::atom(DetectAtom::new(oid, format!(".*{}.*", regex::escape(value)), true))
}

pub fn not_contains(oid: &str, value: &str) -> DetectionSpec {
    DetectionSpec::atom(DetectAtom::new(oid, format!(".*{}.*", regex::escape(value)), false))
}

/// Raw regular expression atom.
pub fn matches(oid: &str, pattern: &str) -> DetectionSpec {
    DetectionSpec::atom(DetectAtom::new(oid, pattern.to_string(), true))
}

/// Conjunction; distributes over the clauses of the operands.
pub fn all_of<I: IntoIterator<Item = DetectionSpec>>(specs: I) -> DetectionSpec {
    let mut clauses: Vec<Vec<DetectAtom>> = vec![vec![]];
    for spec in specs {
        let mut next = Vec::with_capacity(clauses.len() * spec.0.len());
        for left in &clauses {
            for right in &spec.0 {
                let mut clause = left.clone();
                clause.extend(right.iter().cloned());
                next.push(clause);
            }
        }
        clauses = next;
    }
    DetectionSpec(clauses)
}

/// Disjunction; concatenates the clauses of the operands.
pub fn any_of<I: IntoIterator<Item = DetectionSpec>>(specs: I) -> DetectionSpec {
    DetectionSpec(specs.into_iter().flat_map(|s| s.0).collect())
}

/// Negation of a spec consisting of a single atom.
pub fn not_(spec: &DetectionSpec) -> Result<DetectionSpec> {
    spec.single_atom()
        .map(|atom| DetectionSpec::atom(atom.negated()))
        .ok_or_else(|| {
            PluginError::NotImplemented(format!(
                "negation of a spec with {} clause(s)",
                spec.0.len()
            ))
        })
}
