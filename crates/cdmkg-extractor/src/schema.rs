//! Extraction schema module
//!
//! Predicate vocabulary, allowed stakeholders, few-shot examples and
//! prompt rendering for A-CDM milestone extraction.

use cdmkg_core::KgError;
use serde::{Deserialize, Serialize};

// ============================================================================
// Predicate Vocabulary
// ============================================================================

/// Predicates of the procedural knowledge graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Predicate {
    /// Step -> Stakeholder responsible for it
    #[serde(rename = "hasStakeholder")]
    HasStakeholder,
    /// Step -> the step that follows it
    #[serde(rename = "hasNext")]
    HasNext,
}

impl Predicate {
    pub const ALL: [Predicate; 2] = [Predicate::HasStakeholder, Predicate::HasNext];

    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HasStakeholder => "hasStakeholder",
            Self::HasNext => "hasNext",
        }
    }
}

impl std::str::FromStr for Predicate {
    type Err = KgError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hasstakeholder" => Ok(Self::HasStakeholder),
            "hasnext" => Ok(Self::HasNext),
            other => Err(KgError::ExtractionFormat(format!("unknown predicate: {other}"))),
        }
    }
}

impl std::fmt::Display for Predicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Stakeholders a `hasStakeholder` object may name
pub const ACDM_STAKEHOLDERS: [&str; 6] = [
    "ATC",
    "Airline",
    "Airport",
    "ACISP",
    "AO/GH",
    "Network_Operations",
];

// ============================================================================
// Few-shot Examples
// ============================================================================

/// A triple shown to the model as part of an example
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExampleTriple {
    pub subject: String,
    pub predicate: String,
    pub object: String,
    pub source_text: String,
}

/// Example text together with its expected extractions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FewShotExample {
    pub text: String,
    pub triples: Vec<ExampleTriple>,
}

/// (source_text, subject, predicate, object) for the Milestone 7 example,
/// taken from the expert-curated A-CDM knowledge graph
const MILESTONE7_TRIPLES: &[(&str, &str, &str, &str)] = &[
    (
        "Definition AIBT - Actual In-Block Time. This is the time that an aircraft arrives in-blocks.",
        "Plane in-block observed",
        "hasStakeholder",
        "ATC",
    ),
    ("ACARS = IN", "ACARS status set to IN", "hasStakeholder", "Airline"),
    (
        "Origin and priority ACARS equipped aircraft or automated docking systems or ATC systems (e.g. A-SMGCS) or by manual input.",
        "Plane auto-docking initiated",
        "hasStakeholder",
        "Airport",
    ),
    ("Action on CDM EIBT changes to AIBT", "EIBT changed to AIBT", "hasStakeholder", "ACISP"),
    (
        "TOBT and TTOT are updated automatically or inserted manually by the Aircraft Operator / Ground Handler",
        "Update TOBT and TTOT",
        "hasStakeholder",
        "AO/GH",
    ),
    (
        "Operation (ACISP) TOBT and TTOT updated",
        "Update TOBT and TTOT in ACISP",
        "hasStakeholder",
        "ACISP",
    ),
    (
        "Procedures To check whether the AO/GH TOBT is consistent with the ATC Flight Plan.",
        "Check if AO/GH TOBT is consistent with flight plan",
        "hasStakeholder",
        "AO/GH",
    ),
    (
        "Network Operations is informed when the TTOT changes by more than the agreed TTOT tolerance.",
        "Receive updated TTOT",
        "hasStakeholder",
        "Network_Operations",
    ),
    (
        "Origin and priority ACARS equipped aircraft or automated docking systems or ATC systems (e.g. A-SMGCS) or by manual input.",
        "Plane in-block observed",
        "hasNext",
        "EIBT changed to AIBT",
    ),
    (
        "Origin and priority ACARS equipped aircraft or automated docking systems or ATC systems (e.g. A-SMGCS) or by manual input.",
        "ACARS status set to IN",
        "hasNext",
        "EIBT changed to AIBT",
    ),
    (
        "Effect The occurrence of AIBT should trigger an update of downstream estimates",
        "EIBT changed to AIBT",
        "hasNext",
        "Update TOBT and TTOT",
    ),
    (
        "Operation (ACISP) TOBT and TTOT updated",
        "Update TOBT and TTOT",
        "hasNext",
        "Update TOBT and TTOT in ACISP",
    ),
    (
        "Procedures To check whether the AO/GH TOBT is consistent with the ATC Flight Plan.",
        "Update TOBT and TTOT",
        "hasNext",
        "Check if AO/GH TOBT is consistent with flight plan",
    ),
    (
        "Network Operations is informed when the TTOT changes by more than the agreed TTOT tolerance.",
        "Update TOBT and TTOT in ACISP",
        "hasNext",
        "Receive updated TTOT",
    ),
];

/// The In-Block milestone example used for few-shot prompting
pub fn milestone7_example() -> FewShotExample {
    FewShotExample {
        text: include_str!("prompts/milestone7_example.txt").to_string(),
        triples: MILESTONE7_TRIPLES
            .iter()
            .map(|(source_text, subject, predicate, object)| ExampleTriple {
                subject: subject.to_string(),
                predicate: predicate.to_string(),
                object: object.to_string(),
                source_text: source_text.to_string(),
            })
            .collect(),
    }
}

// ============================================================================
// Extraction Schema
// ============================================================================

/// Fixed schema handed to the extraction capability with every segment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionSchema {
    /// Task instruction
    pub prompt_description: String,

    /// Permitted predicates; empty for a free-form instruction
    pub predicates: Vec<String>,

    /// Permitted `hasStakeholder` objects; empty for no restriction
    pub stakeholders: Vec<String>,

    pub examples: Vec<FewShotExample>,
}

impl ExtractionSchema {
    /// The A-CDM milestone schema
    pub fn acdm() -> Self {
        Self {
            prompt_description: include_str!("prompts/acdm_description.txt").to_string(),
            predicates: Predicate::ALL.iter().map(|p| p.to_string()).collect(),
            stakeholders: ACDM_STAKEHOLDERS.iter().map(|s| s.to_string()).collect(),
            examples: vec![milestone7_example()],
        }
    }

    /// A schema consisting only of a free-form instruction
    pub fn free_form(instruction: impl Into<String>) -> Self {
        Self {
            prompt_description: instruction.into(),
            predicates: Vec::new(),
            stakeholders: Vec::new(),
            examples: Vec::new(),
        }
    }

    /// Build the extraction prompt for one segment
    pub fn build_prompt(&self, text: &str) -> String {
        let mut prompt = String::new();
        prompt.push_str(self.prompt_description.trim());
        prompt.push_str("\n\n");

        if !self.predicates.is_empty() {
            prompt.push_str(&format!(
                "Allowed predicates: {}\n",
                self.predicates.join(", ")
            ));
        }
        if !self.stakeholders.is_empty() {
            prompt.push_str(&format!(
                "Allowed stakeholders: {}\n",
                self.stakeholders.join(", ")
            ));
        }

        prompt.push_str(
            "\nRespond with a JSON array only. Each element must be an object with the keys \
             \"subject\", \"predicate\", \"object\" and \"source_text\" (the exact span of the \
             text supporting the triple).\n",
        );

        for (i, example) in self.examples.iter().enumerate() {
            prompt.push_str(&format!("\nExample {} text:\n", i + 1));
            prompt.push_str(example.text.trim());
            prompt.push_str(&format!("\n\nExample {} output:\n", i + 1));
            prompt.push_str(&serde_json::to_string_pretty(&example.triples).unwrap_or_default());
            prompt.push('\n');
        }

        prompt.push_str("\nText:\n");
        prompt.push_str(text);
        prompt.push_str("\n\nJSON:\n");
        prompt
    }
}

impl Default for ExtractionSchema {
    fn default() -> Self {
        Self::acdm()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predicate_display() {
        assert_eq!(Predicate::HasStakeholder.to_string(), "hasStakeholder");
        assert_eq!(Predicate::HasNext.as_str(), "hasNext");
    }

    #[test]
    fn test_predicate_from_str() {
        assert_eq!("hasNext".parse::<Predicate>().unwrap(), Predicate::HasNext);
        assert_eq!(
            "HASSTAKEHOLDER".parse::<Predicate>().unwrap(),
            Predicate::HasStakeholder
        );
        assert!(matches!(
            "worksIn".parse::<Predicate>(),
            Err(KgError::ExtractionFormat(_))
        ));
    }

    #[test]
    fn test_example_uses_schema_vocabulary() {
        let schema = ExtractionSchema::acdm();
        let example = &schema.examples[0];
        assert!(example.text.contains("MILESTONE 7"));

        for triple in &example.triples {
            assert!(triple.predicate.parse::<Predicate>().is_ok());
            if triple.predicate == "hasStakeholder" {
                assert!(schema.stakeholders.contains(&triple.object));
            }
        }
    }

    #[test]
    fn test_acdm_prompt() {
        let schema = ExtractionSchema::acdm();
        let prompt = schema.build_prompt("MILESTONE 1 ATC Flight Plan Activation");

        assert!(prompt.contains("Allowed predicates: hasStakeholder, hasNext"));
        assert!(prompt.contains("Network_Operations"));
        assert!(prompt.contains("Example 1 output"));
        assert!(prompt.contains("\"predicate\": \"hasNext\""));
        assert!(prompt.ends_with("MILESTONE 1 ATC Flight Plan Activation\n\nJSON:\n"));
    }

    #[test]
    fn test_free_form_prompt() {
        let schema = ExtractionSchema::free_form("Extract every relation.");
        let prompt = schema.build_prompt("text");

        assert!(prompt.starts_with("Extract every relation."));
        assert!(!prompt.contains("Allowed predicates"));
        assert!(!prompt.contains("Example 1"));
    }
}
