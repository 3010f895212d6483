//! Cypher statement catalogue.
//!
//! Every statement the crate sends to the graph store is defined here, so the
//! rewriter's known-query map and the in-process backend can match on exact
//! text. Parameters are always primitives, strings or flat lists; nested
//! payloads are bound as JSON strings.

/// Trivial round trip used for connectivity verification.
pub const PING: &str = "RETURN 1 AS ok";

/// Probe for the similarity extension. Fails when it is not installed.
pub const EXTENSION_PROBE: &str = "RETURN gds.version() AS version";

// ---------------------------------------------------------------------------
// Catalog nodes (typed sync)
// ---------------------------------------------------------------------------

pub const UPSERT_KNOWLEDGE_BASE: &str = "\
MERGE (c:Capability {capability_id: $capability_id}) \
SET c:KnowledgeBase, c.capability_type = $capability_type, c.name = $name, \
c.description = $description, c.status = $status, c.last_updated = $last_updated, \
c.graph_source = $graph_source, c.node_name = $node_name, \
c.collection_names = $collection_names \
RETURN c.capability_id AS capability_id";

pub const UPSERT_COLLECTION: &str = "\
MATCH (c:Capability {capability_id: $capability_id}) \
MERGE (c)-[:HAS_COLLECTION]->(k:Collection {capability_id: $capability_id, name: $collection_name}) \
SET k.description = $collection_description, k.semantics = $semantics, \
k.document_count = $document_count \
RETURN k.name AS name";

pub const PRUNE_COLLECTIONS: &str = "\
MATCH (c:Capability {capability_id: $capability_id})-[:HAS_COLLECTION]->(k:Collection) \
WHERE NOT k.name IN $collection_names \
DETACH DELETE k";

pub const UPSERT_API_TOOL: &str = "\
MERGE (c:Capability {capability_id: $capability_id}) \
SET c:Tool, c.capability_type = $capability_type, c.name = $name, \
c.description = $description, c.status = $status, c.last_updated = $last_updated, \
c.graph_source = $graph_source, c.node_name = $node_name, \
c.endpoint = $endpoint, c.method = $method, c.input_schema = $input_schema, \
c.output_schema = $output_schema, c.rate_limit = $rate_limit \
RETURN c.capability_id AS capability_id";

pub const UPSERT_DATABASE: &str = "\
MERGE (c:Capability {capability_id: $capability_id}) \
SET c:Database, c.capability_type = $capability_type, c.name = $name, \
c.description = $description, c.status = $status, c.last_updated = $last_updated, \
c.graph_source = $graph_source, c.node_name = $node_name, \
c.schema = $schema, c.table_names = $table_names \
RETURN c.capability_id AS capability_id";

pub const UPSERT_TABLE: &str = "\
MATCH (c:Capability {capability_id: $capability_id}) \
MERGE (c)-[:HAS_TABLE]->(t:Table {capability_id: $capability_id, name: $table_name}) \
SET t.description = $table_description, t.columns = $columns \
RETURN t.name AS name";

pub const PRUNE_TABLES: &str = "\
MATCH (c:Capability {capability_id: $capability_id})-[:HAS_TABLE]->(t:Table) \
WHERE NOT t.name IN $table_names \
DETACH DELETE t";

pub const REMOVE_CAPABILITY: &str = "\
MATCH (c:Capability {capability_id: $capability_id}) \
OPTIONAL MATCH (c)-[:HAS_COLLECTION|HAS_TABLE]->(n) \
WITH c, collect(n) AS children, c.capability_id AS capability_id \
FOREACH (n IN children | DETACH DELETE n) \
DETACH DELETE c \
RETURN capability_id";

// ---------------------------------------------------------------------------
// Multi-vector index
// ---------------------------------------------------------------------------

pub const GET_CONTENT_HASH: &str = "\
MATCH (c:CapabilityIndex {capability_id: $capability_id}) \
RETURN c.content_hash AS content_hash";

pub const LIST_INDEXED_IDS: &str = "\
MATCH (c:CapabilityIndex) \
RETURN c.capability_id AS capability_id \
ORDER BY capability_id";

/// Cascading delete of an index node and its vector nodes.
pub const DELETE_INDEXED: &str = "\
MATCH (c:CapabilityIndex {capability_id: $capability_id}) \
OPTIONAL MATCH (c)-[:HAS_VECTOR]->(v:CapabilityVector) \
WITH c, collect(v) AS vectors, c.capability_id AS capability_id \
FOREACH (v IN vectors | DETACH DELETE v) \
DETACH DELETE c \
RETURN capability_id";

pub const CREATE_INDEXED: &str = "\
CREATE (c:CapabilityIndex {capability_id: $capability_id, capability_type: $capability_type, \
name: $name, description: $description, content_hash: $content_hash, \
core_concept: $core_concept, domain: $domain, service_type: $service_type, \
operation: $operation, input_spec: $input_spec, output_spec: $output_spec, \
usage_context: $usage_context, prerequisites: $prerequisites, constraints: $constraints, \
updated_at: $updated_at}) \
CREATE (c)-[:HAS_VECTOR]->(:CapabilityVector {category: 'semantic', embedding: $semantic_vector, norm: $semantic_norm}) \
CREATE (c)-[:HAS_VECTOR]->(:CapabilityVector {category: 'functional', embedding: $functional_vector, norm: $functional_norm}) \
CREATE (c)-[:HAS_VECTOR]->(:CapabilityVector {category: 'contextual', embedding: $contextual_vector, norm: $contextual_norm}) \
RETURN c.capability_id AS capability_id";

/// Weighted three-vector similarity search using the similarity extension.
/// Ties are broken by `capability_id` ascending.
pub const SEARCH_BY_CAPABILITY: &str = "\
MATCH (c:CapabilityIndex)-[:HAS_VECTOR]->(s:CapabilityVector {category: 'semantic'}), \
(c)-[:HAS_VECTOR]->(f:CapabilityVector {category: 'functional'}), \
(c)-[:HAS_VECTOR]->(x:CapabilityVector {category: 'contextual'}) \
WITH c, \
gds.similarity.cosine(s.embedding, $semantic_query) AS semantic_score, \
gds.similarity.cosine(f.embedding, $functional_query) AS functional_score, \
gds.similarity.cosine(x.embedding, $contextual_query) AS contextual_score \
WITH c, semantic_score, functional_score, contextual_score, \
$semantic_weight * semantic_score + $functional_weight * functional_score + \
$contextual_weight * contextual_score AS score \
WHERE score >= $threshold \
RETURN c.capability_id AS capability_id, c.name AS name, c.description AS description, \
c.capability_type AS capability_type, score, semantic_score, functional_score, contextual_score \
ORDER BY score DESC, capability_id ASC \
LIMIT $limit";

/// Pre-registered fallback for [`SEARCH_BY_CAPABILITY`]: manual cosine using
/// the norms stored on each vector node and the query norms bound as params.
pub const SEARCH_BY_CAPABILITY_FALLBACK: &str = "\
MATCH (c:CapabilityIndex)-[:HAS_VECTOR]->(s:CapabilityVector {category: 'semantic'}), \
(c)-[:HAS_VECTOR]->(f:CapabilityVector {category: 'functional'}), \
(c)-[:HAS_VECTOR]->(x:CapabilityVector {category: 'contextual'}) \
WITH c, \
CASE WHEN s.norm = 0 OR $semantic_query_norm = 0 THEN 0.0 ELSE \
reduce(dot = 0.0, i IN range(0, size(s.embedding) - 1) | dot + s.embedding[i] * $semantic_query[i]) \
/ (s.norm * $semantic_query_norm) END AS semantic_score, \
CASE WHEN f.norm = 0 OR $functional_query_norm = 0 THEN 0.0 ELSE \
reduce(dot = 0.0, i IN range(0, size(f.embedding) - 1) | dot + f.embedding[i] * $functional_query[i]) \
/ (f.norm * $functional_query_norm) END AS functional_score, \
CASE WHEN x.norm = 0 OR $contextual_query_norm = 0 THEN 0.0 ELSE \
reduce(dot = 0.0, i IN range(0, size(x.embedding) - 1) | dot + x.embedding[i] * $contextual_query[i]) \
/ (x.norm * $contextual_query_norm) END AS contextual_score \
WITH c, semantic_score, functional_score, contextual_score, \
$semantic_weight * semantic_score + $functional_weight * functional_score + \
$contextual_weight * contextual_score AS score \
WHERE score >= $threshold \
RETURN c.capability_id AS capability_id, c.name AS name, c.description AS description, \
c.capability_type AS capability_type, score, semantic_score, functional_score, contextual_score \
ORDER BY score DESC, capability_id ASC \
LIMIT $limit";

/// Lexical search over index nodes; no embeddings involved.
pub const SEARCH_BY_TEXT: &str = "\
MATCH (c:CapabilityIndex) \
WHERE toLower(c.name) CONTAINS toLower($query) OR toLower(c.description) CONTAINS toLower($query) \
RETURN c.capability_id AS capability_id, c.name AS name, c.description AS description, \
c.capability_type AS capability_type \
ORDER BY name ASC, capability_id ASC \
LIMIT $limit";

/// Everything the integrity check needs to recompute hashes and count vectors.
pub const INTEGRITY_SCAN: &str = "\
MATCH (c:CapabilityIndex) \
OPTIONAL MATCH (c)-[:HAS_VECTOR]->(v:CapabilityVector) \
RETURN c.capability_id AS capability_id, c.name AS name, c.description AS description, \
c.content_hash AS content_hash, c.core_concept AS core_concept, c.domain AS domain, \
c.service_type AS service_type, c.operation AS operation, c.input_spec AS input_spec, \
c.output_spec AS output_spec, c.usage_context AS usage_context, \
c.prerequisites AS prerequisites, c.constraints AS constraints, \
collect(v.category) AS categories \
ORDER BY capability_id";

/// Known-query fallbacks applied when the similarity extension is missing.
pub fn known_fallbacks() -> Vec<(&'static str, &'static str)> {
    vec![(SEARCH_BY_CAPABILITY, SEARCH_BY_CAPABILITY_FALLBACK)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::rewriter::SIMILARITY_FUNCTION;

    #[test]
    fn test_fallback_does_not_invoke_extension() {
        assert!(SEARCH_BY_CAPABILITY.contains(SIMILARITY_FUNCTION));
        assert!(!SEARCH_BY_CAPABILITY_FALLBACK.contains(SIMILARITY_FUNCTION));
    }

    #[test]
    fn test_statements_are_single_line() {
        for q in [UPSERT_API_TOOL, CREATE_INDEXED, SEARCH_BY_CAPABILITY, INTEGRITY_SCAN] {
            assert!(!q.contains('\n'));
            assert!(!q.contains("  "), "double space in {}", q);
        }
    }
}
