//! Vector-source fields, content hashes and the three-vector set.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::graph::{record_str, Record};

/// One of the three embedding categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VectorCategory {
    Semantic,
    Functional,
    Contextual,
}

impl VectorCategory {
    pub const ALL: [VectorCategory; 3] = [Self::Semantic, Self::Functional, Self::Contextual];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Semantic => "semantic",
            Self::Functional => "functional",
            Self::Contextual => "contextual",
        }
    }
}

/// What a capability is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SemanticFields {
    pub core_concept: String,
    pub domain: String,
    pub service_type: String,
}

/// What a capability does.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionalFields {
    pub operation: String,
    pub input_spec: String,
    pub output_spec: String,
}

/// When and under which conditions a capability applies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextualFields {
    pub usage_context: String,
    pub prerequisites: String,
    pub constraints: String,
}

/// The nine source fields a capability's vectors are computed from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityFields {
    pub semantic: SemanticFields,
    pub functional: FunctionalFields,
    pub contextual: ContextualFields,
}

impl CapabilityFields {
    /// Source texts of one category, in field order.
    pub fn sources(&self, category: VectorCategory) -> [&str; 3] {
        match category {
            VectorCategory::Semantic => [
                self.semantic.core_concept.as_str(),
                self.semantic.domain.as_str(),
                self.semantic.service_type.as_str(),
            ],
            VectorCategory::Functional => [
                self.functional.operation.as_str(),
                self.functional.input_spec.as_str(),
                self.functional.output_spec.as_str(),
            ],
            VectorCategory::Contextual => [
                self.contextual.usage_context.as_str(),
                self.contextual.prerequisites.as_str(),
                self.contextual.constraints.as_str(),
            ],
        }
    }

    /// `(property name, value)` pairs as stored on the index node.
    pub fn properties(&self) -> [(&'static str, &str); 9] {
        [
            ("core_concept", self.semantic.core_concept.as_str()),
            ("domain", self.semantic.domain.as_str()),
            ("service_type", self.semantic.service_type.as_str()),
            ("operation", self.functional.operation.as_str()),
            ("input_spec", self.functional.input_spec.as_str()),
            ("output_spec", self.functional.output_spec.as_str()),
            ("usage_context", self.contextual.usage_context.as_str()),
            ("prerequisites", self.contextual.prerequisites.as_str()),
            ("constraints", self.contextual.constraints.as_str()),
        ]
    }

    /// Rebuild from an index node row; missing properties read as empty.
    pub fn from_record(record: &Record) -> Self {
        let get = |key: &str| record_str(record, key).unwrap_or_default();
        Self {
            semantic: SemanticFields {
                core_concept: get("core_concept"),
                domain: get("domain"),
                service_type: get("service_type"),
            },
            functional: FunctionalFields {
                operation: get("operation"),
                input_spec: get("input_spec"),
                output_spec: get("output_spec"),
            },
            contextual: ContextualFields {
                usage_context: get("usage_context"),
                prerequisites: get("prerequisites"),
                constraints: get("constraints"),
            },
        }
    }
}

#[derive(Serialize)]
struct HashInput<'a> {
    name: &'a str,
    description: &'a str,
    fields: &'a CapabilityFields,
}

/// SHA-256 (hex) over the canonical JSON of name, description and the nine
/// source fields. Struct field order fixes the serialization.
pub fn content_hash(name: &str, description: &str, fields: &CapabilityFields) -> String {
    let canonical = serde_json::to_vec(&HashInput {
        name,
        description,
        fields,
    })
    .unwrap_or_default();
    hex::encode(Sha256::digest(&canonical))
}

/// The three category embeddings of one capability (or one query).
#[derive(Debug, Clone, PartialEq)]
pub struct VectorSet {
    pub semantic: Vec<f32>,
    pub functional: Vec<f32>,
    pub contextual: Vec<f32>,
}

impl VectorSet {
    pub fn get(&self, category: VectorCategory) -> &[f32] {
        match category {
            VectorCategory::Semantic => &self.semantic,
            VectorCategory::Functional => &self.functional,
            VectorCategory::Contextual => &self.contextual,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields() -> CapabilityFields {
        CapabilityFields {
            semantic: SemanticFields {
                core_concept: "weather".into(),
                domain: "meteorology".into(),
                service_type: "lookup".into(),
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_hash_is_deterministic() {
        let a = content_hash("weather_lookup", "Current weather.", &fields());
        let b = content_hash("weather_lookup", "Current weather.", &fields());
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_hash_covers_every_input() {
        let base = content_hash("weather_lookup", "Current weather.", &fields());
        assert_ne!(base, content_hash("weather_lookups", "Current weather.", &fields()));
        assert_ne!(base, content_hash("weather_lookup", "Current weather!", &fields()));

        let mut changed = fields();
        changed.contextual.constraints = "rate limited".into();
        assert_ne!(base, content_hash("weather_lookup", "Current weather.", &changed));
    }

    #[test]
    fn test_record_round_trip() {
        let f = fields();
        let mut record = Record::new();
        for (k, v) in f.properties() {
            record.insert(k.to_string(), serde_json::Value::from(v));
        }
        assert_eq!(CapabilityFields::from_record(&record), f);
        assert_eq!(f.sources(VectorCategory::Semantic), ["weather", "meteorology", "lookup"]);
    }
}
