use metrics::counter;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    ai_costs::cost_for_model, error::StageResult, metric_consts::AI_EVENTS_ENRICHED,
    pipeline::PreparedEvent,
};

const AI_EVENTS: &[&str] = &["$ai_generation", "$ai_embedding"];

/// Attach USD cost properties to LLM observability events, derived from the
/// model cost table and the token counts the SDK reported. Unknown models
/// and pre-costed events pass through untouched.
pub fn process_ai_events(mut buffer: Vec<StageResult>) -> Vec<StageResult> {
    for item in buffer.iter_mut() {
        let Ok(event) = item else {
            continue;
        };

        if AI_EVENTS.contains(&event.event.as_str()) {
            enrich(event);
        }
    }

    buffer
}

fn enrich(event: &mut PreparedEvent) {
    if event.properties.contains_key("$ai_total_cost_usd") {
        return; // The SDK already priced it
    }

    let Some(model) = event
        .properties
        .get("$ai_model")
        .and_then(Value::as_str)
    else {
        return;
    };

    let Some(cost) = cost_for_model(model) else {
        debug!(event_uuid = %event.uuid, model, "no cost table entry for model");
        return;
    };

    let input_tokens = token_count(&event.properties, "$ai_input_tokens");
    let output_tokens = token_count(&event.properties, "$ai_output_tokens");

    let input_cost = input_tokens * cost.input_cost_per_token;
    let output_cost = output_tokens * cost.output_cost_per_token;

    let properties = &mut event.properties;
    properties.insert("$ai_input_cost_usd".to_string(), json!(input_cost));
    properties.insert("$ai_output_cost_usd".to_string(), json!(output_cost));
    properties.insert(
        "$ai_total_cost_usd".to_string(),
        json!(input_cost + output_cost),
    );

    counter!(AI_EVENTS_ENRICHED).increment(1);
}

fn token_count(properties: &std::collections::HashMap<String, Value>, key: &str) -> f64 {
    properties.get(key).and_then(Value::as_f64).unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::prepared_event;

    #[test]
    fn generation_events_get_costed() {
        let mut event = prepared_event(1, "$ai_generation", "d1");
        event
            .properties
            .insert("$ai_model".to_string(), json!("gpt-4o-mini"));
        event
            .properties
            .insert("$ai_input_tokens".to_string(), json!(1000));
        event
            .properties
            .insert("$ai_output_tokens".to_string(), json!(500));

        let out = process_ai_events(vec![Ok(event)]);
        let props = &out[0].as_ref().unwrap().properties;

        let input = props["$ai_input_cost_usd"].as_f64().unwrap();
        let output = props["$ai_output_cost_usd"].as_f64().unwrap();
        let total = props["$ai_total_cost_usd"].as_f64().unwrap();
        assert!((input - 0.000_15).abs() < 1e-12);
        assert!((output - 0.000_3).abs() < 1e-12);
        assert!((total - (input + output)).abs() < 1e-12);
    }

    #[test]
    fn pre_costed_events_are_untouched() {
        let mut event = prepared_event(1, "$ai_generation", "d1");
        event
            .properties
            .insert("$ai_model".to_string(), json!("gpt-4o"));
        event
            .properties
            .insert("$ai_total_cost_usd".to_string(), json!(1.23));

        let out = process_ai_events(vec![Ok(event)]);
        let props = &out[0].as_ref().unwrap().properties;
        assert_eq!(props["$ai_total_cost_usd"], json!(1.23));
        assert!(!props.contains_key("$ai_input_cost_usd"));
    }

    #[test]
    fn unknown_model_is_skipped() {
        let mut event = prepared_event(1, "$ai_embedding", "d1");
        event
            .properties
            .insert("$ai_model".to_string(), json!("my-own-model"));
        let out = process_ai_events(vec![Ok(event)]);
        assert!(!out[0]
            .as_ref()
            .unwrap()
            .properties
            .contains_key("$ai_total_cost_usd"));
    }

    #[test]
    fn non_ai_events_pass_through() {
        let mut event = prepared_event(1, "$pageview", "d1");
        event
            .properties
            .insert("$ai_model".to_string(), json!("gpt-4o"));
        let out = process_ai_events(vec![Ok(event)]);
        assert!(!out[0]
            .as_ref()
            .unwrap()
            .properties
            .contains_key("$ai_total_cost_usd"));
    }
}
