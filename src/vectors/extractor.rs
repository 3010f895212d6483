//! Vector-source field extraction.
//!
//! A [`MetadataExtractor`] derives the nine source fields from capability
//! metadata and the seven query fields from free text. Extraction is
//! pluggable (an LLM-backed extractor fits the same trait); the crate ships
//! [`AnnotationExtractor`], which reads explicit annotation lines from the
//! description and fills the rest from the name and description:
//!
//! ```text
//! Current weather lookup.
//! @semantic concept: weather
//! @functional input: city name
//! @contextual constraints: 60 requests per minute
//! ```

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

use super::fields::{CapabilityFields, VectorCategory};
use super::VectorError;
use crate::types::{CapabilityDetails, CapabilityMetadata};

static ANNOTATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^@(?:(semantic|functional|contextual)\s+)?([A-Za-z_]+)\s*:\s*(.*)$").expect("annotation pattern is valid")
});

/// The seven fields a search query is decomposed into: three semantic, one
/// functional, three contextual.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryRepresentation {
    pub core_concept: String,
    pub domain: String,
    pub service_type: String,
    pub operation: String,
    pub usage_context: String,
    pub prerequisites: String,
    pub constraints: String,
}

impl QueryRepresentation {
    /// Field texts in order.
    pub fn fields(&self) -> [&str; 7] {
        [
            self.core_concept.as_str(),
            self.domain.as_str(),
            self.service_type.as_str(),
            self.operation.as_str(),
            self.usage_context.as_str(),
            self.prerequisites.as_str(),
            self.constraints.as_str(),
        ]
    }

    /// Category of the field at `index`: the first three are semantic, the
    /// next one functional, the rest contextual.
    pub fn category_of(index: usize) -> VectorCategory {
        match index {
            0..=2 => VectorCategory::Semantic,
            3 => VectorCategory::Functional,
            _ => VectorCategory::Contextual,
        }
    }
}

#[async_trait]
pub trait MetadataExtractor: Send + Sync {
    /// Source fields for a capability's vectors.
    async fn extract(&self, metadata: &CapabilityMetadata) -> Result<CapabilityFields, VectorError>;

    /// Query fields for a search text.
    async fn extract_query(&self, query: &str) -> Result<QueryRepresentation, VectorError>;
}

/// Annotation-driven extractor. Needs no external service.
#[derive(Debug, Clone, Default)]
pub struct AnnotationExtractor;

/// One parsed `@category field: value` line.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Annotation {
    field: &'static str,
    value: String,
}

/// Canonical field name for an annotation key, `None` if unknown.
fn canonical_field(category: Option<&str>, key: &str) -> Option<&'static str> {
    let field = match key.to_lowercase().as_str() {
        "concept" | "core_concept" => "core_concept",
        "domain" => "domain",
        "service" | "service_type" => "service_type",
        "operation" | "op" => "operation",
        "input" | "input_spec" => "input_spec",
        "output" | "output_spec" => "output_spec",
        "usage" | "usage_context" | "context" => "usage_context",
        "requires" | "prerequisites" => "prerequisites",
        "limits" | "constraints" => "constraints",
        _ => return None,
    };
    let expected = match field {
        "core_concept" | "domain" | "service_type" => "semantic",
        "operation" | "input_spec" | "output_spec" => "functional",
        _ => "contextual",
    };
    match category {
        Some(c) if c != expected => None,
        _ => Some(field),
    }
}

/// Split text into its annotation lines and the remaining body.
fn split_annotations(text: &str) -> (Vec<Annotation>, String) {
    let mut annotations = Vec::new();
    let mut body = Vec::new();
    for line in text.lines() {
        let trimmed = line.trim();
        match ANNOTATION.captures(trimmed) {
            Some(caps) => {
                let category = caps.get(1).map(|m| m.as_str());
                match canonical_field(category, &caps[2]) {
                    Some(field) => annotations.push(Annotation {
                        field,
                        value: caps[3].trim().to_string(),
                    }),
                    None => log::debug!("Ignoring unknown annotation: {}", trimmed),
                }
            }
            None if !trimmed.is_empty() => body.push(trimmed),
            None => {}
        }
    }
    (annotations, body.join(" "))
}

fn annotated<'a>(annotations: &'a [Annotation], field: &str) -> Option<&'a str> {
    annotations
        .iter()
        .rev()
        .find(|a| a.field == field)
        .map(|a| a.value.as_str())
}

/// `weather_lookup` → `weather lookup`.
fn humanize(name: &str) -> String {
    name.split(|c: char| c == '_' || c == '-' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

#[async_trait]
impl MetadataExtractor for AnnotationExtractor {
    async fn extract(&self, metadata: &CapabilityMetadata) -> Result<CapabilityFields, VectorError> {
        let (annotations, body) = split_annotations(&metadata.description);
        let name = humanize(&metadata.name);
        let pick = |field: &str, default: &str| {
            annotated(&annotations, field)
                .unwrap_or(default)
                .to_string()
        };

        let mut fields = CapabilityFields::default();
        fields.semantic.core_concept = pick("core_concept", &name);
        fields.semantic.domain = pick("domain", &body);
        fields.semantic.service_type = pick("service_type", &name);
        fields.functional.operation = pick("operation", &body);
        fields.functional.input_spec = pick("input_spec", "");
        fields.functional.output_spec = pick("output_spec", "");
        fields.contextual.usage_context = pick("usage_context", &body);
        fields.contextual.prerequisites = pick("prerequisites", "");
        fields.contextual.constraints = pick("constraints", "");

        if let CapabilityDetails::KnowledgeBase(kb) = &metadata.details {
            if annotated(&annotations, "usage_context").is_none() && !kb.collections.is_empty() {
                let collections: Vec<&str> = kb.collections.iter().map(|c| c.name.as_str()).collect();
                fields.contextual.usage_context = format!("{} {}", body, collections.join(" "))
                    .trim()
                    .to_string();
            }
        }
        Ok(fields)
    }

    async fn extract_query(&self, query: &str) -> Result<QueryRepresentation, VectorError> {
        let (annotations, body) = split_annotations(query);
        if body.is_empty() && annotations.is_empty() {
            return Err(VectorError::Extraction("empty query".to_string()));
        }
        let pick = |field: &str| annotated(&annotations, field).unwrap_or(&body).to_string();
        Ok(QueryRepresentation {
            core_concept: pick("core_concept"),
            domain: pick("domain"),
            service_type: pick("service_type"),
            operation: pick("operation"),
            usage_context: pick("usage_context"),
            prerequisites: pick("prerequisites"),
            constraints: pick("constraints"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CollectionDescriptor, KnowledgeDetails, ToolDetails};

    fn tool(description: &str) -> CapabilityMetadata {
        CapabilityMetadata::api_tool("tool:weather_lookup", "weather_lookup", description, ToolDetails::default())
    }

    #[tokio::test]
    async fn test_defaults_from_name_and_description() {
        let fields = AnnotationExtractor
            .extract(&tool("Current weather lookup.\n@semantic concept: weather"))
            .await
            .unwrap();
        assert_eq!(fields.semantic.core_concept, "weather");
        assert_eq!(fields.semantic.domain, "Current weather lookup.");
        assert_eq!(fields.semantic.service_type, "weather lookup");
        assert_eq!(fields.functional.operation, "Current weather lookup.");
        assert_eq!(fields.functional.input_spec, "");
        assert_eq!(fields.contextual.usage_context, "Current weather lookup.");
    }

    #[tokio::test]
    async fn test_annotation_aliases_and_category_check() {
        let fields = AnnotationExtractor
            .extract(&tool(
                "Lookup.\n@input: city name\n@contextual limits: 60 rpm\n@semantic operation: ignored",
            ))
            .await
            .unwrap();
        assert_eq!(fields.functional.input_spec, "city name");
        assert_eq!(fields.contextual.constraints, "60 rpm");
        // operation is functional, so the semantic-tagged line is dropped
        assert_eq!(fields.functional.operation, "Lookup.");
    }

    #[tokio::test]
    async fn test_knowledge_base_usage_mentions_collections() {
        let meta = CapabilityMetadata::knowledge_base(
            "kb:docs",
            "docs",
            "Product docs",
            KnowledgeDetails {
                collections: vec![CollectionDescriptor::new("guides", "")],
            },
        );
        let fields = AnnotationExtractor.extract(&meta).await.unwrap();
        assert_eq!(fields.contextual.usage_context, "Product docs guides");
    }

    #[tokio::test]
    async fn test_query_fields() {
        let q = AnnotationExtractor
            .extract_query("current weather\n@functional operation: fetch forecast")
            .await
            .unwrap();
        assert_eq!(q.core_concept, "current weather");
        assert_eq!(q.operation, "fetch forecast");
        assert_eq!(q.constraints, "current weather");
        assert_eq!(QueryRepresentation::category_of(3), VectorCategory::Functional);
        assert_eq!(QueryRepresentation::category_of(6), VectorCategory::Contextual);

        assert!(AnnotationExtractor.extract_query("  \n").await.is_err());
    }
}
