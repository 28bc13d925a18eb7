//! cdmkg RAG - Retrieval evaluation over the triple table
//!
//! Measures how well the extracted knowledge graph supports question
//! answering:
//! - Lexical retrieval of triples (IDF-weighted term overlap)
//! - Short and long context windows
//! - Optional LLM answering from the retrieved window
//! - Exact and fuzzy answer matching with accuracy, MRR and hit@k
//!
//! The LLM clients used for extraction live here as well.

pub mod evaluator;
pub mod llm;
pub mod matching;
pub mod retrieval;

pub use evaluator::{
    load_queries, EvaluationReport, ModeSummary, QueryItem, QueryResult, RetrievalEvaluator,
};
pub use llm::{create_llm_client, OllamaClient, OpenAiClient};
pub use matching::{normalize, AnswerMatcher};
pub use retrieval::{render_triple, LexicalRetriever, ScoredTriple};

// ============================================================================
// Prompt Builder
// ============================================================================

/// Builder for constructing RAG prompts
pub struct PromptBuilder {
    system_instruction: String,
    context_sections: Vec<String>,
    question: String,
    instructions: Vec<String>,
}

impl PromptBuilder {
    /// Create a new prompt builder
    pub fn new() -> Self {
        Self {
            system_instruction: String::new(),
            context_sections: Vec::new(),
            question: String::new(),
            instructions: Vec::new(),
        }
    }

    /// Set system instruction
    pub fn system(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = instruction.into();
        self
    }

    /// Add a context section
    pub fn add_context(mut self, context: impl Into<String>) -> Self {
        self.context_sections.push(context.into());
        self
    }

    /// Set the question
    pub fn question(mut self, q: impl Into<String>) -> Self {
        self.question = q.into();
        self
    }

    /// Add an instruction
    pub fn add_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instructions.push(instruction.into());
        self
    }

    /// Build the final prompt
    pub fn build(self) -> String {
        let mut prompt = String::new();

        if !self.system_instruction.is_empty() {
            prompt.push_str("<s>\n");
            prompt.push_str(&self.system_instruction);
            prompt.push_str("\n</s>\n\n");
        }

        if !self.context_sections.is_empty() {
            prompt.push_str("<context>\n");
            for section in &self.context_sections {
                prompt.push_str(section);
                prompt.push_str("\n\n");
            }
            prompt.push_str("</context>\n\n");
        }

        if !self.question.is_empty() {
            prompt.push_str("<question>\n");
            prompt.push_str(&self.question);
            prompt.push_str("\n</question>\n\n");
        }

        if !self.instructions.is_empty() {
            prompt.push_str("<instructions>\n");
            for (i, inst) in self.instructions.iter().enumerate() {
                prompt.push_str(&format!("{}. {}\n", i + 1, inst));
            }
            prompt.push_str("</instructions>\n");
        }

        prompt
    }
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================
