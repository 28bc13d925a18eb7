//! LLM-backed extraction service
//!
//! Renders the schema prompt for a segment, sends it to an [`LlmClient`]
//! and parses the reply into [`RawTriple`]s.

use std::sync::Arc;

use cdmkg_core::{KgError, LlmClient, Result};
use serde::Deserialize;
use serde_json::Value;

use crate::schema::ExtractionSchema;
use crate::{ExtractionService, RawTriple};

/// Extraction service that prompts a language model
pub struct LlmExtractionService {
    llm: Arc<dyn LlmClient>,
    name: String,
}

impl LlmExtractionService {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        let name = format!("llm:{}", llm.model());
        Self { llm, name }
    }
}

#[async_trait::async_trait]
impl ExtractionService for LlmExtractionService {
    async fn extract(&self, text: &str, schema: &ExtractionSchema) -> Result<Vec<RawTriple>> {
        let prompt = schema.build_prompt(text);
        let response = self.llm.generate(&prompt).await?;

        let triples = parse_response(&response)?;
        tracing::debug!(
            service = %self.name,
            triples = triples.len(),
            "Parsed extraction response"
        );
        Ok(triples)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Record shapes accepted from the model
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ResponseRecord {
    /// `{"extraction_text": "...", "attributes": {"subject": ..}}`
    Nested {
        #[serde(default, alias = "source_text")]
        extraction_text: Option<String>,
        attributes: RawTriple,
    },
    Flat(RawTriple),
}

impl From<ResponseRecord> for RawTriple {
    fn from(record: ResponseRecord) -> Self {
        match record {
            ResponseRecord::Nested {
                extraction_text,
                mut attributes,
            } => {
                if attributes.source_text.is_none() {
                    attributes.source_text = extraction_text;
                }
                attributes
            }
            ResponseRecord::Flat(triple) => triple,
        }
    }
}

/// Parse a model reply into raw triples
///
/// Accepts a bare JSON array, or an object wrapping it under `triples` or
/// `extractions`, optionally inside a Markdown code fence. Anything else is
/// an `ExtractionFormat` error.
pub fn parse_response(response: &str) -> Result<Vec<RawTriple>> {
    let body = strip_code_fence(response);
    let value: Value = serde_json::from_str(body).map_err(|e| {
        KgError::ExtractionFormat(format!("response is not JSON: {e}"))
    })?;

    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map
            .remove("triples")
            .or_else(|| map.remove("extractions"))
        {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(KgError::ExtractionFormat(
                    "expected a list of triples".to_string(),
                ))
            }
        },
        _ => {
            return Err(KgError::ExtractionFormat(
                "expected a list of triples".to_string(),
            ))
        }
    };

    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| {
            serde_json::from_value::<ResponseRecord>(item)
                .map(RawTriple::from)
                .map_err(|e| KgError::ExtractionFormat(format!("record {i}: {e}")))
        })
        .collect()
}

fn strip_code_fence(response: &str) -> &str {
    let trimmed = response.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };

    // Drop the info string (e.g. "json") up to the first newline
    let rest = rest.split_once('\n').map(|(_, body)| body).unwrap_or("");
    rest.trim_end()
        .strip_suffix("```")
        .unwrap_or(rest)
        .trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CannedLlm(String);

    #[async_trait::async_trait]
    impl LlmClient for CannedLlm {
        async fn generate(&self, _prompt: &str) -> Result<String> {
            Ok(self.0.clone())
        }

        fn model(&self) -> &str {
            "canned"
        }
    }

    #[test]
    fn test_parse_flat_array() {
        let triples = parse_response(
            r#"[{"subject": "Update TOBT", "predicate": "hasStakeholder", "object": "AO/GH",
                 "source_text": "inserted manually by the Aircraft Operator"}]"#,
        )
        .unwrap();

        assert_eq!(triples.len(), 1);
        assert_eq!(triples[0].object, "AO/GH");
        assert_eq!(
            triples[0].source_text.as_deref(),
            Some("inserted manually by the Aircraft Operator")
        );
    }

    #[test]
    fn test_parse_fenced_wrapped_response() {
        let response = "```json\n{\"triples\": [{\"subject\": \"a\", \"predicate\": \"hasNext\", \"object\": \"b\"}]}\n```";
        let triples = parse_response(response).unwrap();
        assert_eq!(triples, vec![RawTriple::new("a", "hasNext", "b")]);
    }

    #[test]
    fn test_parse_nested_attributes() {
        let response = r#"{"extractions": [{
            "extraction_class": "triple",
            "extraction_text": "ACARS = IN",
            "attributes": {"subject": "ACARS status set to IN", "predicate": "hasStakeholder", "object": "Airline"}
        }]}"#;

        let triples = parse_response(response).unwrap();
        assert_eq!(triples[0].subject, "ACARS status set to IN");
        assert_eq!(triples[0].source_text.as_deref(), Some("ACARS = IN"));
    }

    #[test]
    fn test_missing_fields_default_to_empty() {
        // Validation of empty fields happens in the extractor
        let triples = parse_response(r#"[{"predicate": "hasNext", "object": "b"}]"#).unwrap();
        assert_eq!(triples[0].subject, "");
    }

    #[test]
    fn test_malformed_responses() {
        for response in [
            "I could not find any triples.",
            r#"{"answer": "none"}"#,
            r#""just a string""#,
            r#"[1, 2, 3]"#,
        ] {
            let err = parse_response(response).unwrap_err();
            assert!(
                matches!(err, KgError::ExtractionFormat(_)),
                "{response}: {err:?}"
            );
        }
    }

    #[test]
    fn test_empty_list_is_valid() {
        assert!(parse_response("[]").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_service_uses_llm_reply() {
        let llm = Arc::new(CannedLlm(
            r#"[{"subject": "s", "predicate": "hasNext", "object": "o"}]"#.to_string(),
        ));
        let service = LlmExtractionService::new(llm);

        assert_eq!(service.name(), "llm:canned");
        let triples = service
            .extract("MILESTONE 1", &ExtractionSchema::acdm())
            .await
            .unwrap();
        assert_eq!(triples.len(), 1);
    }
}
