//! Prompt templates for the two review passes.
//!
//! A template is an ordered set of sections (task context, tone, task
//! description, worked example, input data, immediate task, precognition,
//! output formatting). Present sections are joined with one blank line in
//! that order; an empty section is omitted entirely.
//!
//! Variable slots are `{{name}}` tokens drawn from a fixed [`Placeholder`]
//! set. Each variant declares the placeholders it needs and `compose` refuses
//! to render until all of them are bound, so unreplaced tokens never reach
//! the model. Substitution is a single left-to-right pass: bound values are
//! inserted verbatim and never re-scanned.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ═══════════════════════════════════════════════════════════
// Types
// ═══════════════════════════════════════════════════════════

/// The two review passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptVariant {
    /// Note + filtered coded entities → initial recommendation.
    FirstPass,
    /// Note + initial recommendation + retrieved guidelines → final recommendation.
    SecondPass,
}

impl PromptVariant {
    /// Placeholders that must be bound to compose this variant.
    pub fn placeholders(&self) -> &'static [Placeholder] {
        match self {
            Self::FirstPass => &[Placeholder::NoteText, Placeholder::CodedEntitiesJson],
            Self::SecondPass => &[
                Placeholder::NoteText,
                Placeholder::FirstPassRecommendation,
                Placeholder::RetrievedGuidelinesJson,
            ],
        }
    }

    fn template(&self) -> PromptTemplate {
        let (task_description, input_data) = match self {
            Self::FirstPass => (FIRST_PASS_TASK_DESCRIPTION, FIRST_PASS_INPUT_DATA),
            Self::SecondPass => (SECOND_PASS_TASK_DESCRIPTION, SECOND_PASS_INPUT_DATA),
        };

        PromptTemplate::new()
            .with(PromptSection::TaskContext, TASK_CONTEXT)
            .with(PromptSection::Tone, TONE_CONTEXT)
            .with(PromptSection::TaskDescription, task_description)
            .with(PromptSection::WorkedExample, WORKED_EXAMPLE)
            .with(PromptSection::InputData, input_data)
            .with(PromptSection::ImmediateTask, IMMEDIATE_TASK)
            .with(PromptSection::Precognition, PRECOGNITION)
            .with(PromptSection::OutputFormatting, OUTPUT_FORMATTING)
    }
}

impl fmt::Display for PromptVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FirstPass => write!(f, "first_pass"),
            Self::SecondPass => write!(f, "second_pass"),
        }
    }
}

/// Variable slots a template may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Placeholder {
    NoteText,
    CodedEntitiesJson,
    FirstPassRecommendation,
    RetrievedGuidelinesJson,
}

impl Placeholder {
    #[cfg(test)]
    const ALL: [Placeholder; 4] = [
        Self::NoteText,
        Self::CodedEntitiesJson,
        Self::FirstPassRecommendation,
        Self::RetrievedGuidelinesJson,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::NoteText => "note_text",
            Self::CodedEntitiesJson => "coded_entities_json",
            Self::FirstPassRecommendation => "first_pass_recommendation",
            Self::RetrievedGuidelinesJson => "retrieved_guidelines_json",
        }
    }

    /// The literal token as it appears in template text.
    #[cfg(test)]
    fn token(&self) -> String {
        format!("{{{{{}}}}}", self.name())
    }
}

impl fmt::Display for Placeholder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Template sections in render order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PromptSection {
    TaskContext,
    Tone,
    TaskDescription,
    WorkedExample,
    InputData,
    ImmediateTask,
    Precognition,
    OutputFormatting,
}

/// An ordered collection of sections. Keyed by section so render order is
/// the declaration order of [`PromptSection`], not insertion order.
#[derive(Debug, Clone, Default)]
pub struct PromptTemplate {
    sections: BTreeMap<PromptSection, &'static str>,
}

impl PromptTemplate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, section: PromptSection, text: &'static str) -> Self {
        self.sections.insert(section, text);
        self
    }

    /// Join present sections with exactly one blank line.
    pub fn render(&self) -> String {
        self.sections
            .values()
            .map(|text| text.trim())
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Values for a template's placeholders.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromptBindings {
    values: BTreeMap<Placeholder, String>,
}

impl PromptBindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(mut self, placeholder: Placeholder, value: impl Into<String>) -> Self {
        self.values.insert(placeholder, value.into());
        self
    }

    pub fn get(&self, placeholder: Placeholder) -> Option<&str> {
        self.values.get(&placeholder).map(String::as_str)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PromptError {
    #[error("Missing binding for {variant} prompt: {}", format_missing(.missing))]
    MissingBinding {
        variant: PromptVariant,
        missing: Vec<Placeholder>,
    },
}

fn format_missing(missing: &[Placeholder]) -> String {
    missing
        .iter()
        .map(Placeholder::name)
        .collect::<Vec<_>>()
        .join(", ")
}

// ═══════════════════════════════════════════════════════════
// Composition
// ═══════════════════════════════════════════════════════════

/// Compose the full prompt for `variant`.
///
/// Fails with `MissingBinding` (listing every absent placeholder) before any
/// text is produced. Bindings for placeholders the variant does not use are
/// ignored.
pub fn compose(variant: PromptVariant, bindings: &PromptBindings) -> Result<String, PromptError> {
    let missing: Vec<Placeholder> = variant
        .placeholders()
        .iter()
        .copied()
        .filter(|p| bindings.get(*p).is_none())
        .collect();

    if !missing.is_empty() {
        return Err(PromptError::MissingBinding { variant, missing });
    }

    let template = variant.template().render();
    Ok(substitute(&template, variant.placeholders(), bindings))
}

/// Raw template text for a variant, tokens unreplaced.
#[cfg(test)]
fn template_text(variant: PromptVariant) -> String {
    variant.template().render()
}

/// Single-pass token replacement. `{{` sequences that are not a declared
/// token are copied through unchanged.
fn substitute(template: &str, declared: &[Placeholder], bindings: &PromptBindings) -> String {
    let bound_len: usize = declared
        .iter()
        .filter_map(|p| bindings.get(*p))
        .map(str::len)
        .sum();
    let mut out = String::with_capacity(template.len() + bound_len);
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];

        let matched = declared.iter().find(|p| {
            after_open
                .strip_prefix(p.name())
                .is_some_and(|tail| tail.starts_with("}}"))
        });

        match matched.and_then(|p| bindings.get(*p).map(|v| (p, v))) {
            Some((placeholder, value)) => {
                out.push_str(value);
                rest = &after_open[placeholder.name().len() + 2..];
            }
            None => {
                out.push_str("{{");
                rest = after_open;
            }
        }
    }

    out.push_str(rest);
    out
}

// ═══════════════════════════════════════════════════════════
// Section text
// ═══════════════════════════════════════════════════════════

macro_rules! question {
    () => {
        "Share your recommendation about the medical conditions of the patient"
    };
}

macro_rules! recommendation_format {
    () => {
        r#"{
  "Active_Condition": [
    {"Review": {
      "DX_Code": "ICD10 Code",
      "Description": "Condition description",
      "Memo": {"date": "date", "note": "Explanation from notes"}
    }}
  ],
  "Inactive_Condition": [
    {"Review": {
      "DX_Code": "ICD10 Code",
      "Description": "Condition description",
      "Memo": {"date": "date", "note": "Explanation from notes"}
    }}
  ]
}"#
    };
}

#[cfg(test)]
const QUESTION: &str = question!();

const TASK_CONTEXT: &str = "\
You are a medical reviewer. You review patient notes and give the doctor a \
recommendation about the patient's medical conditions, covering both current \
and chronic conditions. The doctor uses your recommendation to decide on a \
treatment plan.";

const TONE_CONTEXT: &str = "You should maintain a friendly customer service tone.";

#[cfg(test)]
const RECOMMENDATION_FORMAT: &str = recommendation_format!();

const FIRST_PASS_TASK_DESCRIPTION: &str = concat!(
    "Here are some important rules for the interaction:\n",
    "\n",
    "- Refer to the <patient_notes>. Read the history, medications and encounters carefully. ",
    "For each encounter review the lab results and the note line by line, looking for any evidence of a medical condition.\n",
    "\n",
    "- Lab results are comma separated readings and can be long. Read every value. ",
    "Keep a list of common lab thresholds that indicate conditions and cross-check every out-of-range value against it.\n",
    "\n",
    "- Look for any mention of symptoms, diagnoses, prescribed medications or procedures that could indicate a condition. ",
    "Only list a condition when the lab results or notes clearly support it.\n",
    "\n",
    "- Refer to the findings from comprehend medical inside the <comprehend_medical></comprehend_medical> XML tag. ",
    "Use them as a helper to identify the medical conditions.\n",
    "\n",
    "- Do not make assumptions without supporting evidence for the specific date.\n",
    "\n",
    "- For each date, list every medical condition, its ICD 10 code and the explanation that supports it.\n",
    "\n",
    "- Only use the information provided. If there is no medical condition to recommend, say that there is no medical condition to report.\n",
    "\n",
    "- Provide the final recommendation inside <recommendation></recommendation> XML tags in JSON format, ",
    "with each condition formatted as:\n",
    recommendation_format!(),
);

const SECOND_PASS_TASK_DESCRIPTION: &str = concat!(
    "The patient notes are provided inside the <patient_notes></patient_notes> XML tag. ",
    "They contain dates, medications, history, procedure codes, lab results and notes.\n",
    "\n",
    "Your initial recommendations based on the patient notes are provided inside the ",
    "<initial_recommendation></initial_recommendation> XML tag.\n",
    "\n",
    "Guidelines about the medical conditions and their ICD 10 codes are provided inside the ",
    "<guidelines></guidelines> XML tag.\n",
    "\n",
    "When you reply, follow these steps:\n",
    "\n",
    "- Refer to the <patient_notes>. Read the history, medications and encounters carefully. ",
    "For each encounter review the lab results and the note line by line, looking for any evidence of a medical condition.\n",
    "\n",
    "- Lab results are comma separated readings and can be long. Read every value. ",
    "Keep a list of common lab thresholds that indicate conditions and cross-check every out-of-range value against it.\n",
    "\n",
    "- Look for any mention of symptoms, diagnoses, prescribed medications or procedures that could indicate a condition. ",
    "Only list a condition when the lab results or notes clearly support it.\n",
    "\n",
    "- Refer to the guidelines from the knowledge base inside the <guidelines></guidelines> XML tag. ",
    "Use them as a helper to identify the medical conditions and ICD 10 codes.\n",
    "\n",
    "- Refer to your initial recommendations inside the <initial_recommendation></initial_recommendation> XML tag ",
    "and adjust them where the evidence or guidelines call for it.\n",
    "\n",
    "- Do not make assumptions without supporting evidence for the specific date.\n",
    "\n",
    "- For each date, list every medical condition, its ICD 10 code and the explanation that supports it.\n",
    "\n",
    "- Only use the information provided. If there is no medical condition to recommend, say that there is no medical condition to report.\n",
    "\n",
    "- Provide the final recommendation inside <recommendation></recommendation> XML tags in JSON format, ",
    "with each condition formatted as:\n",
    recommendation_format!(),
);

const WORKED_EXAMPLE: &str = r#"Here is an example inside the <example></example> XML tag of how to perform the task:
<example>
user: <patient_notes>
{
  "name": "XYZ",
  "age": "60 years",
  "sex": "Male",
  "encounters": [
    {"Date": "2022-01-04", "Procedure codes": "99214", "note": ["Blood pressure has been stable. Pt is overdue for physical and labs.", "stable"]},
    {"Date": "2022-02-04", "note": ["Dual-chamber pacemaker was placed for sinus node dysfunction."]},
    {"Date": "2023-07-22", "note": ["Had unprovoked PE. Still on anticoagulation. Oncology note dated 07/05/2023: long term anticoagulation recommended."]},
    {"Date": "2023-07-31", "note": ["Patient visited doctor for cough, runny nose, headache, slight fever and sore throat. Doctor suggested Ibuprofen and cough suppressant."]},
    {"Date": "2023-09-01", "note": ["Patient no longer complains of cough and has stopped Ibuprofen and cough suppressant."], "labs": "vitamin D 25-oh, total: 43 NG/mL"}
  ]
}
</patient_notes>

assistant: <response>
<thinking>
Date: 2022-01-04
No evidence of medical conditions

Date: 2022-02-04
Condition: Sinus node dysfunction
ICD10: I49.5
Evidence: Dual-chamber pacemaker was placed for sinus node dysfunction.

Date: 2023-07-22
Condition: Pulmonary embolism
ICD10: I26.99
Evidence: Had unprovoked PE. Still on anticoagulation.

Date: 2023-07-31
Condition: Upper respiratory infection
ICD10: J06.9
Evidence: Cough, runny nose, headache, slight fever and sore throat.

Date: 2023-09-01
Condition: Vitamin D deficiency
ICD10: E55.9
Evidence: vitamin D 25-oh, total: 43 NG/mL
Upper respiratory infection is resolved (inactive).
</thinking>

<recommendation>
{
  "Active_Condition": [
    {"Review": {"DX_Code": "I49.5", "Description": "Sinus node dysfunction", "Memo": {"date": "2022-02-04", "note": "Dual-chamber pacemaker was placed for sinus node dysfunction."}}},
    {"Review": {"DX_Code": "I26.99", "Description": "Pulmonary embolism", "Memo": {"date": "2023-07-22", "note": "Had unprovoked PE. Still on anticoagulation."}}},
    {"Review": {"DX_Code": "E55.9", "Description": "Vitamin D deficiency", "Memo": {"date": "2023-09-01", "note": "vitamin D 25-oh, total: 43 NG/mL"}}}
  ],
  "Inactive_Condition": [
    {"Review": {"DX_Code": "J06.9", "Description": "Upper respiratory infection", "Memo": {"date": "2023-09-01", "note": "Patient no longer complains of cough and has stopped Ibuprofen and cough suppressant."}}}
  ]
}
</recommendation>
</response>
</example>"#;

const FIRST_PASS_INPUT_DATA: &str = concat!(
    "Here are the patient notes:\n",
    "<patient_notes>\n",
    "{{note_text}}\n",
    "</patient_notes>\n",
    "\n",
    "Here are the comprehend medical findings:\n",
    "<comprehend_medical>{{coded_entities_json}}</comprehend_medical>\n",
    "\n",
    "Here is the user's question:\n",
    "<question>\n",
    question!(),
    "\n",
    "</question>",
);

const SECOND_PASS_INPUT_DATA: &str = concat!(
    "Here are the patient notes:\n",
    "<patient_notes>\n",
    "{{note_text}}\n",
    "</patient_notes>\n",
    "\n",
    "Here are the initial recommendations:\n",
    "<initial_recommendation>{{first_pass_recommendation}}</initial_recommendation>\n",
    "\n",
    "Here are the guidelines:\n",
    "<guidelines>{{retrieved_guidelines_json}}</guidelines>\n",
    "\n",
    "Here is the user's question:\n",
    "<question>\n",
    question!(),
    "\n",
    "</question>",
);

const IMMEDIATE_TASK: &str = "How do you respond to the user's question?";

const PRECOGNITION: &str = "\
Think step by step about your answer before you respond. First find all the medical \
conditions, their ICD10 codes and explanations, and write them down inside \
<thinking></thinking> XML tags. Once you are done, double check your work: look over \
the lab results and notes again with fresh eyes to make sure nothing was missed. Then \
answer the question. Put your recommendation inside <recommendation></recommendation> XML tag.";

const OUTPUT_FORMATTING: &str = "Put your response in <response></response> tags.";

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════
