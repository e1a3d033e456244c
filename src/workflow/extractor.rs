//! Field extraction — turns free text into structured optional facts.
//!
//! The model is the most failure-prone boundary in the system, so nothing
//! it returns is trusted: output is parsed field by field, anything
//! malformed is dropped, and a failed call yields the empty partial so the
//! turn continues with zero fields updated.

use std::sync::Arc;

use crate::config::FunnelConfig;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider, retry::complete_with_attempts};

use super::state::{ChatRole, ConversationState};

/// Pounds-to-kilograms factor for weights stated in imperial units.
pub const LBS_TO_KG: f64 = 0.453592;

const EXTRACTION_PROMPT: &str = "\
You are an AI assistant for a pet grooming business. Extract customer and \
pet information from the conversation.

Fields:
- customer_name: full name of the customer
- phone: phone number
- city: city where the customer lives
- pet_name: name of the pet
- species: type of animal (Dog, Cat, ...)
- breed: breed of the pet
- weight_kg: weight, only if stated in kilograms
- weight_lbs: weight, only if stated in pounds
- age_years: age in whole years
- coat_condition: condition of the pet's coat (Good, Fair, Poor, Matted, ...)
- pet_notes: anything else worth noting about the pet

Return ONLY a JSON object with these keys. Use null for anything the text \
does not state. Never guess a value that is not supported by the text. Do \
not include any other text or explanations.";

/// Fields the extractor may report. Every one is optional; absent means
/// "not determinable from this text".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedFields {
    pub customer_name: Option<String>,
    pub phone: Option<String>,
    pub city: Option<String>,
    pub pet_name: Option<String>,
    pub species: Option<String>,
    pub breed: Option<String>,
    pub weight_kg: Option<f64>,
    pub age_years: Option<u32>,
    pub coat_condition: Option<String>,
    pub pet_notes: Option<String>,
}

impl ExtractedFields {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Merge into the state. Only present fields overwrite; a known fact is
    /// never erased by a partial extraction. Returns the names of the
    /// fields that changed.
    pub fn apply_to(&self, state: &mut ConversationState) -> Vec<&'static str> {
        let mut updated = Vec::new();
        merge_str(&self.customer_name, &mut state.customer_name, "customer_name", &mut updated);
        merge_str(&self.phone, &mut state.phone, "phone", &mut updated);
        merge_str(&self.city, &mut state.city, "city", &mut updated);
        merge_str(&self.pet_name, &mut state.pet_name, "pet_name", &mut updated);
        merge_str(&self.species, &mut state.species, "species", &mut updated);
        merge_str(&self.breed, &mut state.breed, "breed", &mut updated);
        if let Some(weight) = self.weight_kg {
            state.weight_kg = Some(weight);
            updated.push("weight_kg");
        }
        if let Some(age) = self.age_years {
            state.age_years = Some(age);
            updated.push("age_years");
        }
        merge_str(&self.coat_condition, &mut state.coat_condition, "coat_condition", &mut updated);
        merge_str(&self.pet_notes, &mut state.pet_notes, "pet_notes", &mut updated);
        updated
    }
}

fn merge_str(
    source: &Option<String>,
    target: &mut Option<String>,
    name: &'static str,
    updated: &mut Vec<&'static str>,
) {
    if let Some(value) = source {
        *target = Some(value.clone());
        updated.push(name);
    }
}

/// Windowed LLM extraction over the recent conversation.
pub struct FieldExtractor {
    llm: Arc<dyn LlmProvider>,
    window: usize,
    llm_attempts: u32,
}

impl FieldExtractor {
    pub fn new(llm: Arc<dyn LlmProvider>, config: &FunnelConfig) -> Self {
        Self {
            llm,
            window: config.extraction_window.max(5),
            llm_attempts: config.llm_attempts,
        }
    }

    /// Extract whatever the recent conversation supports. Never fails; a
    /// model error or malformed output yields the empty partial.
    pub async fn extract(&self, state: &ConversationState) -> ExtractedFields {
        let mut transcript = String::from("Previous conversation:\n");
        for entry in state.recent_history(self.window) {
            let who = match entry.role {
                ChatRole::User => "User",
                ChatRole::Assistant => "Assistant",
            };
            transcript.push_str(&format!("{}: {}\n", who, entry.content));
        }
        transcript.push_str(&format!("Current message: {}", state.last_message));

        let request = CompletionRequest::new(vec![
            ChatMessage::system(EXTRACTION_PROMPT),
            ChatMessage::user(transcript),
        ])
        .with_max_tokens(512)
        .with_temperature(0.0);

        let response = match complete_with_attempts(&self.llm, request, self.llm_attempts).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("Lead {}: extraction call failed: {}", state.lead_id, e);
                return ExtractedFields::default();
            }
        };

        match parse_extraction(&response.content) {
            Some(fields) => fields,
            None => {
                tracing::warn!(
                    "Lead {}: unparsable extraction output: {:?}",
                    state.lead_id,
                    response.content.trim()
                );
                ExtractedFields::default()
            }
        }
    }
}

/// Pull the JSON object out of model output (tolerating code fences and
/// prose) and read it field by field.
pub fn parse_extraction(output: &str) -> Option<ExtractedFields> {
    let start = output.find('{')?;
    let end = output.rfind('}')?;
    if end < start {
        return None;
    }
    let value: serde_json::Value = serde_json::from_str(&output[start..=end]).ok()?;
    let object = value.as_object()?;

    let mut fields = ExtractedFields {
        customer_name: text_value(object.get("customer_name")),
        phone: text_value(object.get("phone")),
        city: text_value(object.get("city")),
        pet_name: text_value(object.get("pet_name")),
        species: text_value(object.get("species")),
        breed: text_value(object.get("breed")),
        weight_kg: weight_value(object.get("weight_kg")),
        age_years: age_value(object.get("age_years")),
        coat_condition: text_value(object.get("coat_condition")),
        pet_notes: text_value(object.get("pet_notes")),
    };

    // Imperial weights are converted locally rather than trusting the model
    // to do arithmetic.
    if fields.weight_kg.is_none() {
        if let Some(lbs) = weight_value(object.get("weight_lbs")) {
            fields.weight_kg = Some(lbs * LBS_TO_KG);
        }
    }

    Some(fields)
}

fn text_value(value: Option<&serde_json::Value>) -> Option<String> {
    let text = value?.as_str()?.trim();
    if text.is_empty() || text.eq_ignore_ascii_case("null") || text.eq_ignore_ascii_case("unknown")
    {
        return None;
    }
    Some(text.to_string())
}

fn weight_value(value: Option<&serde_json::Value>) -> Option<f64> {
    let weight = match value? {
        serde_json::Value::Number(n) => n.as_f64()?,
        serde_json::Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    (weight > 0.0).then_some(weight)
}

fn age_value(value: Option<&serde_json::Value>) -> Option<u32> {
    match value? {
        serde_json::Value::Number(n) => n.as_u64().map(|a| a as u32),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::testing::ScriptedLlm;

    #[test]
    fn parses_plain_json() {
        let fields = parse_extraction(
            r#"{"customer_name": "Jane Doe", "phone": "555-1212", "pet_name": null}"#,
        )
        .unwrap();
        assert_eq!(fields.customer_name.as_deref(), Some("Jane Doe"));
        assert_eq!(fields.phone.as_deref(), Some("555-1212"));
        assert_eq!(fields.pet_name, None);
    }

    #[test]
    fn parses_fenced_json_with_prose() {
        let output = "Here is what I found:\n```json\n{\"breed\": \"Beagle\", \"age_years\": 3}\n```";
        let fields = parse_extraction(output).unwrap();
        assert_eq!(fields.breed.as_deref(), Some("Beagle"));
        assert_eq!(fields.age_years, Some(3));
    }

    #[test]
    fn converts_pounds_to_kilograms() {
        let fields = parse_extraction(r#"{"weight_lbs": 40}"#).unwrap();
        let kg = fields.weight_kg.unwrap();
        assert!((kg - 18.14368).abs() < 0.01, "got {kg}");
    }

    #[test]
    fn metric_weight_wins_over_imperial() {
        let fields = parse_extraction(r#"{"weight_kg": 18.0, "weight_lbs": 40}"#).unwrap();
        assert_eq!(fields.weight_kg, Some(18.0));
    }

    #[test]
    fn rejects_garbage_values() {
        let fields =
            parse_extraction(r#"{"weight_kg": -4, "age_years": "three", "phone": "  "}"#).unwrap();
        assert_eq!(fields.weight_kg, None);
        assert_eq!(fields.age_years, None);
        assert_eq!(fields.phone, None);
    }

    #[test]
    fn numeric_strings_are_tolerated() {
        let fields = parse_extraction(r#"{"weight_kg": "12.5", "age_years": "3"}"#).unwrap();
        assert_eq!(fields.weight_kg, Some(12.5));
        assert_eq!(fields.age_years, Some(3));
    }

    #[test]
    fn malformed_output_is_none() {
        assert!(parse_extraction("I could not find any information.").is_none());
        assert!(parse_extraction("{not json}").is_none());
        assert!(parse_extraction("").is_none());
    }

    #[test]
    fn merge_never_erases_known_facts() {
        let mut state = ConversationState::new("L1", "user-1");
        state.customer_name = Some("Jane Doe".into());
        state.weight_kg = Some(12.5);

        let partial = ExtractedFields {
            phone: Some("555-1212".into()),
            ..Default::default()
        };
        let updated = partial.apply_to(&mut state);

        assert_eq!(updated, vec!["phone"]);
        assert_eq!(state.customer_name.as_deref(), Some("Jane Doe"));
        assert_eq!(state.weight_kg, Some(12.5));
        assert_eq!(state.phone.as_deref(), Some("555-1212"));
    }

    #[tokio::test]
    async fn failed_call_yields_empty_partial() {
        let extractor = FieldExtractor::new(
            std::sync::Arc::new(ScriptedLlm::failing()),
            &FunnelConfig::default(),
        );
        let mut state = ConversationState::new("L1", "user-1");
        state.add_message(ChatRole::User, "my dog weighs 40 lbs");
        let fields = extractor.extract(&state).await;
        assert!(fields.is_empty());
    }

    #[tokio::test]
    async fn extracts_through_the_model() {
        let extractor = FieldExtractor::new(
            std::sync::Arc::new(ScriptedLlm::new([r#"{"pet_name": "Rex", "weight_lbs": 40}"#])),
            &FunnelConfig::default(),
        );
        let mut state = ConversationState::new("L1", "user-1");
        state.add_message(ChatRole::User, "Rex weighs about 40 pounds");
        let fields = extractor.extract(&state).await;
        assert_eq!(fields.pet_name.as_deref(), Some("Rex"));
        assert!((fields.weight_kg.unwrap() - 18.14368).abs() < 0.01);
    }
}
