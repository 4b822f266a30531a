//! Model pricing registry.
//!
//! Costs are in nanodollars (1e-9 USD) per token, or per search unit for
//! rerank models.

use std::collections::HashMap;
use std::sync::OnceLock;

/// Pricing information for a model.
#[derive(Debug, Clone, Copy)]
pub struct ModelPricing {
    /// Provider name.
    pub provider: &'static str,
    /// Cost per input token (or search unit) in nanodollars.
    pub input_nanos_per_token: i64,
    /// Cost per output token in nanodollars.
    pub output_nanos_per_token: i64,
}

impl ModelPricing {
    const fn new(provider: &'static str, input: i64, output: i64) -> Self {
        Self {
            provider,
            input_nanos_per_token: input,
            output_nanos_per_token: output,
        }
    }

    /// Calculate cost for a request.
    pub fn calculate_cost(&self, input_tokens: u32, output_tokens: u32) -> i64 {
        (input_tokens as i64) * self.input_nanos_per_token
            + (output_tokens as i64) * self.output_nanos_per_token
    }
}

// =============================================================================
// PRICING DATA
// =============================================================================

// OpenAI embeddings
// text-embedding-3-large: $0.13/1M tokens
// text-embedding-3-small: $0.02/1M tokens
const OPENAI_EMBED_3_LARGE: ModelPricing = ModelPricing::new("openai", 130, 0);
const OPENAI_EMBED_3_SMALL: ModelPricing = ModelPricing::new("openai", 20, 0);

// OpenRouter chat (verify periodically against OpenRouter model pages)
// Claude 3 Haiku: $0.25/1M input, $1.25/1M output
const CLAUDE_3_HAIKU: ModelPricing = ModelPricing::new("openrouter", 250, 1_250);
// Claude 3.5 Haiku: $0.80/1M input, $4.00/1M output
const CLAUDE_35_HAIKU: ModelPricing = ModelPricing::new("openrouter", 800, 4_000);
// Claude 3.5 Sonnet: $3.00/1M input, $15.00/1M output
const CLAUDE_35_SONNET: ModelPricing = ModelPricing::new("openrouter", 3_000, 15_000);
// GPT-4o-mini: $0.15/1M input, $0.60/1M output
const GPT_4O_MINI: ModelPricing = ModelPricing::new("openrouter", 150, 600);
// GPT-4o: $2.50/1M input, $10.00/1M output
const GPT_4O: ModelPricing = ModelPricing::new("openrouter", 2_500, 10_000);

// Cohere rerank: $2.00 per 1K searches = 2,000,000 nanodollars per search unit
const COHERE_RERANK_V3: ModelPricing = ModelPricing::new("cohere", 2_000_000, 0);

static PRICING_MAP: OnceLock<HashMap<&'static str, ModelPricing>> = OnceLock::new();

fn init_pricing() -> HashMap<&'static str, ModelPricing> {
    let mut map = HashMap::new();

    map.insert("text-embedding-3-large", OPENAI_EMBED_3_LARGE);
    map.insert("text-embedding-3-small", OPENAI_EMBED_3_SMALL);

    map.insert("anthropic/claude-3-haiku", CLAUDE_3_HAIKU);
    map.insert("anthropic/claude-3-haiku-20240307", CLAUDE_3_HAIKU);
    map.insert("anthropic/claude-3-5-haiku", CLAUDE_35_HAIKU);
    map.insert("anthropic/claude-3-5-haiku-20241022", CLAUDE_35_HAIKU);
    map.insert("anthropic/claude-3-5-sonnet", CLAUDE_35_SONNET);
    map.insert("openai/gpt-4o-mini", GPT_4O_MINI);
    map.insert("openai/gpt-4o", GPT_4O);

    map.insert("rerank-english-v3.0", COHERE_RERANK_V3);
    map.insert("rerank-multilingual-v3.0", COHERE_RERANK_V3);

    map
}

/// Get pricing for a model.
pub fn get_pricing(model_id: &str) -> Option<ModelPricing> {
    let map = PRICING_MAP.get_or_init(init_pricing);
    map.get(model_id).copied()
}

/// Calculate embedding cost.
pub fn embedding_cost(model: &str, tokens: u32) -> i64 {
    let pricing = get_pricing(model).unwrap_or(OPENAI_EMBED_3_LARGE);
    pricing.calculate_cost(tokens, 0)
}

/// Calculate chat cost.
pub fn chat_cost(model: &str, input_tokens: u32, output_tokens: u32) -> i64 {
    // Default to a mid-range model if unknown
    let default = ModelPricing::new("unknown", 1_000, 5_000);
    let pricing = get_pricing(model).unwrap_or(default);
    pricing.calculate_cost(input_tokens, output_tokens)
}

/// Calculate rerank cost from billed search units.
pub fn rerank_cost(model: &str, search_units: u32) -> i64 {
    let pricing = get_pricing(model).unwrap_or(COHERE_RERANK_V3);
    pricing.calculate_cost(search_units, 0)
}
