//! Sample-level metadata attached to a PCA result.
//!
//! Attribute types are resolved once when a column is added: numeric columns
//! hold `f64` values, categorical columns hold an index into an ordered level
//! list. Nothing downstream re-infers a column's type.

use crate::error::{PcaError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// A single metadata value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    /// Continuous numeric value.
    Numeric(f64),
    /// Index into the attribute's level list.
    Categorical(usize),
    /// Missing value.
    Missing,
}

impl AttributeValue {
    pub fn is_missing(&self) -> bool {
        matches!(self, AttributeValue::Missing)
    }

    /// Numeric encoding: numeric values as-is, categorical values as their
    /// level index (ordinal encoding).
    pub fn encoded(&self) -> Option<f64> {
        match self {
            AttributeValue::Numeric(v) => Some(*v),
            AttributeValue::Categorical(level) => Some(*level as f64),
            AttributeValue::Missing => None,
        }
    }
}

/// Type of a metadata attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeKind {
    Numeric,
    /// Leveled attribute; level order defines the ordinal encoding.
    Categorical { levels: Vec<String> },
}

/// One metadata column, aligned with `Metadata::sample_ids`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub kind: AttributeKind,
    pub values: Vec<AttributeValue>,
}

impl Attribute {
    pub fn is_categorical(&self) -> bool {
        matches!(self.kind, AttributeKind::Categorical { .. })
    }

    /// Level label for a categorical value.
    pub fn level_label(&self, value: &AttributeValue) -> Option<&str> {
        match (&self.kind, value) {
            (AttributeKind::Categorical { levels }, AttributeValue::Categorical(i)) => {
                levels.get(*i).map(|s| s.as_str())
            }
            _ => None,
        }
    }
}

/// Sample metadata: a set of typed attributes over a fixed list of samples.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    sample_ids: Vec<String>,
    attributes: Vec<Attribute>,
    #[serde(skip)]
    sample_index: HashMap<String, usize>,
}

impl Metadata {
    /// Create metadata for the given samples, with no attributes yet.
    pub fn new(sample_ids: Vec<String>) -> Result<Self> {
        let mut sample_index = HashMap::with_capacity(sample_ids.len());
        for (i, id) in sample_ids.iter().enumerate() {
            if sample_index.insert(id.clone(), i).is_some() {
                return Err(PcaError::invalid(
                    "metadata sample_ids",
                    format!("sample '{}' appears more than once", id),
                ));
            }
        }
        Ok(Self {
            sample_ids,
            attributes: Vec::new(),
            sample_index,
        })
    }

    pub fn sample_ids(&self) -> &[String] {
        &self.sample_ids
    }

    pub fn n_samples(&self) -> usize {
        self.sample_ids.len()
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn attribute_names(&self) -> Vec<&str> {
        self.attributes.iter().map(|a| a.name.as_str()).collect()
    }

    /// Look up an attribute by name.
    pub fn attribute(&self, name: &str) -> Result<&Attribute> {
        self.attributes
            .iter()
            .find(|a| a.name == name)
            .ok_or_else(|| PcaError::UnknownAttribute(name.to_string()))
    }

    /// Value of an attribute for one sample. Samples unknown to this
    /// metadata read as `Missing`.
    pub fn value(&self, sample_id: &str, attribute: &str) -> Result<AttributeValue> {
        let attr = self.attribute(attribute)?;
        Ok(self
            .index_of(sample_id)
            .map(|i| attr.values[i])
            .unwrap_or(AttributeValue::Missing))
    }

    fn index_of(&self, sample_id: &str) -> Option<usize> {
        if self.sample_index.len() == self.sample_ids.len() {
            self.sample_index.get(sample_id).copied()
        } else {
            // index is skipped by serde; fall back to a scan after deserialization
            self.sample_ids.iter().position(|s| s == sample_id)
        }
    }

    fn check_new_column(&self, name: &str, len: usize) -> Result<()> {
        if self.attributes.iter().any(|a| a.name == name) {
            return Err(PcaError::invalid(
                "metadata attribute",
                format!("attribute '{}' already exists", name),
            ));
        }
        if len != self.sample_ids.len() {
            return Err(PcaError::DimensionMismatch {
                context: format!("values for metadata attribute '{}'", name),
                expected: self.sample_ids.len(),
                actual: len,
            });
        }
        Ok(())
    }

    /// Add a numeric attribute. `None` and non-finite values are stored as missing.
    pub fn add_numeric(&mut self, name: &str, values: Vec<Option<f64>>) -> Result<&mut Self> {
        self.check_new_column(name, values.len())?;
        let values = values
            .into_iter()
            .map(|v| match v {
                Some(x) if x.is_finite() => AttributeValue::Numeric(x),
                _ => AttributeValue::Missing,
            })
            .collect();
        self.attributes.push(Attribute {
            name: name.to_string(),
            kind: AttributeKind::Numeric,
            values,
        });
        Ok(self)
    }

    /// Add a categorical attribute. Levels are ordered by first appearance.
    pub fn add_categorical(&mut self, name: &str, values: Vec<Option<&str>>) -> Result<&mut Self> {
        let mut levels: Vec<String> = Vec::new();
        for v in values.iter().flatten() {
            if !levels.iter().any(|l| l == v) {
                levels.push(v.to_string());
            }
        }
        let level_refs: Vec<&str> = levels.iter().map(|s| s.as_str()).collect();
        self.add_factor(name, values, &level_refs)
    }

    /// Add a categorical attribute with an explicit level order.
    ///
    /// # Errors
    /// `InvalidParameter` if a value is not one of `levels` or levels repeat.
    pub fn add_factor(
        &mut self,
        name: &str,
        values: Vec<Option<&str>>,
        levels: &[&str],
    ) -> Result<&mut Self> {
        self.check_new_column(name, values.len())?;
        let mut seen = HashSet::new();
        for level in levels {
            if !seen.insert(*level) {
                return Err(PcaError::invalid(
                    "metadata levels",
                    format!("level '{}' repeats in attribute '{}'", level, name),
                ));
            }
        }

        let mut encoded = Vec::with_capacity(values.len());
        for v in values {
            match v {
                None => encoded.push(AttributeValue::Missing),
                Some(label) => {
                    let idx = levels.iter().position(|l| *l == label).ok_or_else(|| {
                        PcaError::invalid(
                            "metadata levels",
                            format!(
                                "value '{}' of attribute '{}' is not a declared level",
                                label, name
                            ),
                        )
                    })?;
                    encoded.push(AttributeValue::Categorical(idx));
                }
            }
        }

        self.attributes.push(Attribute {
            name: name.to_string(),
            kind: AttributeKind::Categorical {
                levels: levels.iter().map(|s| s.to_string()).collect(),
            },
            values: encoded,
        });
        Ok(self)
    }

    /// Check that every metadata sample exists among `sample_ids`.
    ///
    /// Samples present in `sample_ids` but absent here are allowed; they read
    /// as missing for every attribute.
    pub fn check_alignment(&self, sample_ids: &[String]) -> Result<()> {
        let known: HashSet<&str> = sample_ids.iter().map(|s| s.as_str()).collect();
        let unmatched: Vec<&str> = self
            .sample_ids
            .iter()
            .map(|s| s.as_str())
            .filter(|s| !known.contains(s))
            .collect();
        if !unmatched.is_empty() {
            let preview: Vec<&str> = unmatched.iter().take(5).copied().collect();
            return Err(PcaError::DimensionMismatch {
                context: format!(
                    "metadata samples absent from the matrix (e.g. {:?})",
                    preview
                ),
                expected: self.sample_ids.len(),
                actual: self.sample_ids.len() - unmatched.len(),
            });
        }
        Ok(())
    }

    /// Values of one attribute re-ordered to follow `sample_ids`.
    pub fn aligned_values(
        &self,
        attribute: &str,
        sample_ids: &[String],
    ) -> Result<Vec<AttributeValue>> {
        let attr = self.attribute(attribute)?;
        Ok(sample_ids
            .iter()
            .map(|s| {
                self.index_of(s)
                    .map(|i| attr.values[i])
                    .unwrap_or(AttributeValue::Missing)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("s{}", i)).collect()
    }

    #[test]
    fn categorical_levels_follow_first_appearance() {
        let mut meta = Metadata::new(samples(4)).unwrap();
        meta.add_categorical("group", vec![Some("b"), Some("a"), None, Some("b")])
            .unwrap();
        let attr = meta.attribute("group").unwrap();
        assert_eq!(
            attr.kind,
            AttributeKind::Categorical {
                levels: vec!["b".to_string(), "a".to_string()]
            }
        );
        assert_eq!(attr.values[1], AttributeValue::Categorical(1));
        assert!(attr.values[2].is_missing());
        assert_eq!(attr.level_label(&attr.values[0]), Some("b"));
    }

    #[test]
    fn factor_rejects_undeclared_level() {
        let mut meta = Metadata::new(samples(2)).unwrap();
        let err = meta
            .add_factor("stage", vec![Some("I"), Some("IV")], &["I", "II", "III"])
            .unwrap_err();
        assert!(matches!(err, PcaError::InvalidParameter { .. }));
    }

    #[test]
    fn numeric_nan_becomes_missing() {
        let mut meta = Metadata::new(samples(3)).unwrap();
        meta.add_numeric("age", vec![Some(30.0), Some(f64::NAN), None]).unwrap();
        assert_eq!(meta.value("s0", "age").unwrap(), AttributeValue::Numeric(30.0));
        assert!(meta.value("s1", "age").unwrap().is_missing());
        assert!(meta.value("s2", "age").unwrap().is_missing());
    }

    #[test]
    fn unknown_attribute_is_reported_by_name() {
        let meta = Metadata::new(samples(1)).unwrap();
        match meta.attribute("bmi") {
            Err(PcaError::UnknownAttribute(name)) => assert_eq!(name, "bmi"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn alignment_is_by_identity() {
        let mut meta = Metadata::new(vec!["b".into(), "a".into()]).unwrap();
        meta.add_numeric("x", vec![Some(2.0), Some(1.0)]).unwrap();
        let order = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        meta.check_alignment(&order).unwrap();
        let vals = meta.aligned_values("x", &order).unwrap();
        assert_eq!(vals[0], AttributeValue::Numeric(1.0));
        assert_eq!(vals[1], AttributeValue::Numeric(2.0));
        assert!(vals[2].is_missing());
    }

    #[test]
    fn alignment_fails_on_foreign_sample() {
        let meta = Metadata::new(vec!["a".into(), "zz".into()]).unwrap();
        let err = meta.check_alignment(&["a".to_string()]).unwrap_err();
        assert!(matches!(
            err,
            PcaError::DimensionMismatch { expected: 2, actual: 1, .. }
        ));
    }

    #[test]
    fn duplicate_attribute_rejected() {
        let mut meta = Metadata::new(samples(1)).unwrap();
        meta.add_numeric("x", vec![Some(1.0)]).unwrap();
        assert!(meta.add_numeric("x", vec![Some(1.0)]).is_err());
    }
}
