pub mod service;
pub mod entities;
pub mod prompt_templates;
pub mod generation;
pub mod recommendation;
pub mod retrieval;
pub mod orchestrator; // Two-pass review run: extract → generate → retrieve → generate
pub mod diagnostic; // Run artifact dump (enabled by ICD10_REVIEW_DUMP_DIR)

#[cfg(test)]
pub(crate) mod testing;
