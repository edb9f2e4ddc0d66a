//! LLM-driven named-entity extraction.
//!
//! Runs once per chunk during ingestion. Extraction is best-effort: a
//! failing chunk logs a warning and contributes zero MENTIONS edges, but
//! never fails the document.

use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

use crate::error::ServiceError;
use crate::llm::ChatModel;
use crate::models::{normalize_entity_name, Entity};

const ENTITY_SYSTEM_PROMPT: &str = r#"You extract named entities and key concepts from a text chunk inside a retrieval pipeline.

Output MUST be valid JSON matching this schema:
{
  "entities": [
    {"type": "company", "name": "Acme Corp"},
    {"type": "person", "name": "Jane Doe"},
    {"type": "concept", "name": "support and resistance"}
  ]
}

Rules:
- Return only entities explicitly present in the text; no guesses.
- Use short, lowercase snake_case strings for "type".
- Prefer fewer, higher-signal entities over exhaustive lists.
- Limit to at most 25 entities."#;

const ENTITY_LLM_MAX_TOKENS: u32 = 1_200;
const MAX_NAME_CHARS: usize = 200;
const MAX_TYPE_CHARS: usize = 48;

pub struct EntityExtractor {
    llm: Arc<dyn ChatModel>,
    max_entities: usize,
}

impl EntityExtractor {
    pub fn new(llm: Arc<dyn ChatModel>, max_entities: usize) -> Self {
        EntityExtractor { llm, max_entities }
    }

    /// Extracts entities from one chunk's text. Malformed entries are
    /// dropped individually; an empty result is valid.
    pub async fn extract(&self, text: &str) -> Result<Vec<Entity>, ServiceError> {
        let user_prompt = format!(
            "Extract entities from this text chunk:\n\n{}\n\nReturn JSON with an 'entities' array.",
            text
        );
        let value = self
            .llm
            .complete_json(ENTITY_SYSTEM_PROMPT, &user_prompt, ENTITY_LLM_MAX_TOKENS)
            .await?;

        Ok(self.sift(value))
    }

    /// Accepts either `{"entities": [...]}` or a bare array, normalizes and
    /// de-duplicates, and caps the count.
    fn sift(&self, value: Value) -> Vec<Entity> {
        let rows = match value {
            Value::Object(mut map) => match map.remove("entities") {
                Some(Value::Array(rows)) => rows,
                _ => Vec::new(),
            },
            Value::Array(rows) => rows,
            _ => Vec::new(),
        };

        let mut out = Vec::new();
        let mut seen: HashSet<(String, String)> = HashSet::new();

        for row in rows {
            if out.len() >= self.max_entities {
                break;
            }
            let Some(obj) = row.as_object() else { continue };
            let entity_type = clean_type(obj.get("type").and_then(Value::as_str).unwrap_or(""));
            let name = clean_name(obj.get("name").and_then(Value::as_str).unwrap_or(""));
            if entity_type.is_empty() || name.chars().count() < 2 {
                continue;
            }
            let key = (entity_type.clone(), name.to_lowercase());
            if !seen.insert(key) {
                continue;
            }
            out.push(Entity { name, entity_type });
        }

        out
    }
}

/// Lowercases, maps whitespace/hyphen runs to underscores, strips anything
/// outside `[a-z0-9_]`, and caps the length.
fn clean_type(raw: &str) -> String {
    let mut out = String::new();
    let mut last_sep = true;
    for ch in raw.trim().to_lowercase().chars() {
        if ch.is_whitespace() || ch == '-' {
            if !last_sep {
                out.push('_');
                last_sep = true;
            }
        } else if ch.is_ascii_alphanumeric() || ch == '_' {
            out.push(ch);
            last_sep = false;
        }
    }
    let trimmed = out.trim_end_matches('_');
    trimmed.chars().take(MAX_TYPE_CHARS).collect()
}

fn clean_name(raw: &str) -> String {
    normalize_entity_name(raw).chars().take(MAX_NAME_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    struct FixedChat(Value);

    #[async_trait]
    impl ChatModel for FixedChat {
        async fn complete_json(
            &self,
            _system: &str,
            _user: &str,
            _max_tokens: u32,
        ) -> Result<Value, ServiceError> {
            Ok(self.0.clone())
        }
    }

    fn extractor(value: Value) -> EntityExtractor {
        EntityExtractor::new(Arc::new(FixedChat(value)), 25)
    }

    #[tokio::test]
    async fn extracts_wrapped_entities() {
        let ex = extractor(json!({"entities": [
            {"type": "Company", "name": "  Acme   Corp "},
            {"type": "person", "name": "Jane Doe"}
        ]}));
        let out = ex.extract("whatever").await.unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].entity_type, "company");
        assert_eq!(out[0].name, "Acme Corp");
    }

    #[tokio::test]
    async fn accepts_bare_array() {
        let ex = extractor(json!([{"type": "concept", "name": "hybrid search"}]));
        let out = ex.extract("whatever").await.unwrap();
        assert_eq!(out.len(), 1);
    }

    #[tokio::test]
    async fn drops_malformed_and_duplicate_entries() {
        let ex = extractor(json!({"entities": [
            {"type": "company", "name": "Acme"},
            {"type": "company", "name": "ACME"},
            {"type": "", "name": "nameless type"},
            {"type": "person", "name": "x"},
            {"name": "no type at all"},
            "not an object"
        ]}));
        let out = ex.extract("whatever").await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].name, "Acme");
    }

    #[tokio::test]
    async fn caps_entity_count() {
        let rows: Vec<Value> = (0..40)
            .map(|i| json!({"type": "concept", "name": format!("concept number {}", i)}))
            .collect();
        let ex = EntityExtractor::new(Arc::new(FixedChat(json!({ "entities": rows }))), 5);
        let out = ex.extract("whatever").await.unwrap();
        assert_eq!(out.len(), 5);
    }

    #[test]
    fn type_normalization() {
        assert_eq!(clean_type(" Key  Concept "), "key_concept");
        assert_eq!(clean_type("multi-word-type"), "multi_word_type");
        assert_eq!(clean_type("Größe!"), "gre");
        assert_eq!(clean_type(""), "");
    }
}
