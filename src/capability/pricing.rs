use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::chat::TokenUsage;

/// Points charged per 1k tokens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelPrice {
    #[serde(default)]
    pub input_price: f64,
    #[serde(default)]
    pub output_price: f64,
}

/// Price table keyed by model id. Unknown models are free.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelPricing {
    #[serde(flatten)]
    models: HashMap<String, ModelPrice>,
}

impl ModelPricing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, model: impl Into<String>, price: ModelPrice) -> Self {
        self.models.insert(model.into(), price);
        self
    }

    pub fn points(&self, model: &str, usage: TokenUsage) -> f64 {
        let Some(price) = self.models.get(model) else {
            return 0.0;
        };
        (usage.input_tokens as f64 * price.input_price
            + usage.output_tokens as f64 * price.output_price)
            / 1000.0
    }
}
