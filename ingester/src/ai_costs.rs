/// Per-token USD costs for the models we see most. Matching is by longest
/// prefix, so dated releases ("gpt-4o-2024-08-06") resolve to their base
/// entry without us having to track every snapshot.
pub struct ModelCost {
    pub prefix: &'static str,
    pub input_cost_per_token: f64,
    pub output_cost_per_token: f64,
}

pub const MODEL_COSTS: &[ModelCost] = &[
    ModelCost {
        prefix: "gpt-4o-mini",
        input_cost_per_token: 0.000_000_15,
        output_cost_per_token: 0.000_000_6,
    },
    ModelCost {
        prefix: "gpt-4o",
        input_cost_per_token: 0.000_002_5,
        output_cost_per_token: 0.000_01,
    },
    ModelCost {
        prefix: "gpt-4.1-mini",
        input_cost_per_token: 0.000_000_4,
        output_cost_per_token: 0.000_001_6,
    },
    ModelCost {
        prefix: "gpt-4.1-nano",
        input_cost_per_token: 0.000_000_1,
        output_cost_per_token: 0.000_000_4,
    },
    ModelCost {
        prefix: "gpt-4.1",
        input_cost_per_token: 0.000_002,
        output_cost_per_token: 0.000_008,
    },
    ModelCost {
        prefix: "o1-mini",
        input_cost_per_token: 0.000_001_1,
        output_cost_per_token: 0.000_004_4,
    },
    ModelCost {
        prefix: "o1",
        input_cost_per_token: 0.000_015,
        output_cost_per_token: 0.000_06,
    },
    ModelCost {
        prefix: "o3-mini",
        input_cost_per_token: 0.000_001_1,
        output_cost_per_token: 0.000_004_4,
    },
    ModelCost {
        prefix: "o3",
        input_cost_per_token: 0.000_002,
        output_cost_per_token: 0.000_008,
    },
    ModelCost {
        prefix: "claude-3-5-haiku",
        input_cost_per_token: 0.000_000_8,
        output_cost_per_token: 0.000_004,
    },
    ModelCost {
        prefix: "claude-3-5-sonnet",
        input_cost_per_token: 0.000_003,
        output_cost_per_token: 0.000_015,
    },
    ModelCost {
        prefix: "claude-3-7-sonnet",
        input_cost_per_token: 0.000_003,
        output_cost_per_token: 0.000_015,
    },
    ModelCost {
        prefix: "claude-sonnet-4",
        input_cost_per_token: 0.000_003,
        output_cost_per_token: 0.000_015,
    },
    ModelCost {
        prefix: "claude-opus-4",
        input_cost_per_token: 0.000_015,
        output_cost_per_token: 0.000_075,
    },
    ModelCost {
        prefix: "gemini-1.5-flash",
        input_cost_per_token: 0.000_000_075,
        output_cost_per_token: 0.000_000_3,
    },
    ModelCost {
        prefix: "gemini-1.5-pro",
        input_cost_per_token: 0.000_001_25,
        output_cost_per_token: 0.000_005,
    },
    ModelCost {
        prefix: "gemini-2.0-flash",
        input_cost_per_token: 0.000_000_1,
        output_cost_per_token: 0.000_000_4,
    },
    ModelCost {
        prefix: "text-embedding-3-small",
        input_cost_per_token: 0.000_000_02,
        output_cost_per_token: 0.0,
    },
    ModelCost {
        prefix: "text-embedding-3-large",
        input_cost_per_token: 0.000_000_13,
        output_cost_per_token: 0.0,
    },
    ModelCost {
        prefix: "mistral-large",
        input_cost_per_token: 0.000_002,
        output_cost_per_token: 0.000_006,
    },
];

pub fn cost_for_model(model: &str) -> Option<&'static ModelCost> {
    MODEL_COSTS
        .iter()
        .filter(|c| model.starts_with(c.prefix))
        .max_by_key(|c| c.prefix.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_prefix_wins() {
        // "gpt-4o-mini-2024-07-18" must match gpt-4o-mini, not gpt-4o
        let cost = cost_for_model("gpt-4o-mini-2024-07-18").unwrap();
        assert_eq!(cost.prefix, "gpt-4o-mini");

        let cost = cost_for_model("gpt-4o-2024-08-06").unwrap();
        assert_eq!(cost.prefix, "gpt-4o");
    }

    #[test]
    fn unknown_models_have_no_cost() {
        assert!(cost_for_model("some-local-llm").is_none());
    }
}
