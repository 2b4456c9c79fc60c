//! Token & cost estimation for conversations.
//!
//! Token counts use a fixed 4-characters-per-token approximation rather than
//! a real tokenizer. Input and output tokens are priced separately from the
//! configured tariff table and each amount is rounded to six decimals.

use std::collections::BTreeMap;

use chatlake_shared::{
    ChatlakeError, ConversationRecord, EstimatorConfig, INVALID_DATE_SENTINEL, Result, Role,
    TariffRate, TokenTotals, TokenUsageRow, format_report_date,
};

/// Characters per estimated token.
pub const CHARS_PER_TOKEN: u64 = 4;

/// `ceil(chars / 4)` over the characters (not bytes) of `text`.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(CHARS_PER_TOKEN)
}

/// Round a USD amount to six decimal places.
pub fn round_usd(amount: f64) -> f64 {
    (amount * 1_000_000.0).round() / 1_000_000.0
}

/// Static model → rate mapping.
#[derive(Debug, Clone, Default)]
pub struct TariffTable {
    rates: BTreeMap<String, TariffRate>,
}

impl TariffTable {
    pub fn new(rates: BTreeMap<String, TariffRate>) -> Self {
        Self { rates }
    }

    pub fn rate(&self, model: &str) -> Result<TariffRate> {
        self.rates
            .get(model)
            .copied()
            .ok_or_else(|| ChatlakeError::config(format!("no tariff for model '{model}'")))
    }
}

/// One conversation's estimate, with the priced halves kept for totals.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenEstimate {
    pub row: TokenUsageRow,
    pub input_cost_usd: f64,
    pub output_cost_usd: f64,
}

/// Estimator bound to one model and region for a whole run.
#[derive(Debug, Clone)]
pub struct TokenEstimator {
    model: String,
    region: String,
    rate: TariffRate,
}

impl TokenEstimator {
    pub fn new(model: impl Into<String>, region: impl Into<String>, table: &TariffTable) -> Result<Self> {
        let model = model.into();
        let rate = table.rate(&model)?;
        Ok(Self {
            model,
            region: region.into(),
            rate,
        })
    }

    pub fn from_config(config: &EstimatorConfig) -> Result<Self> {
        let table = TariffTable::new(config.tariffs.clone());
        Self::new(&config.model, &config.region, &table)
    }

    /// Estimate one conversation.
    ///
    /// Input text is every user and system turn plus every retrieval chunk;
    /// output text is every assistant turn. A missing history counts as empty.
    pub fn estimate(&self, conversation: &ConversationRecord) -> TokenEstimate {
        let mut input = String::new();
        let mut output = String::new();
        for turn in conversation.history.iter().flatten() {
            match turn.role {
                Role::User | Role::System => input.push_str(&turn.text),
                Role::Assistant => output.push_str(&turn.text),
            }
            for chunk in &turn.chunks {
                input.push_str(chunk);
            }
        }

        let token_pregunta = estimate_tokens(&input);
        let token_respuesta = estimate_tokens(&output);
        let input_cost_usd = round_usd(token_pregunta as f64 * self.rate.input_per_token);
        let output_cost_usd = round_usd(token_respuesta as f64 * self.rate.output_per_token);

        TokenEstimate {
            row: TokenUsageRow {
                conversation_id: conversation.conversation_id.clone(),
                user_id: conversation.user_id.clone(),
                fecha: conversation
                    .date()
                    .map(format_report_date)
                    .unwrap_or_else(|| INVALID_DATE_SENTINEL.to_string()),
                token_pregunta,
                token_respuesta,
                tokens_total: token_pregunta + token_respuesta,
                costo_estimado_usd: round_usd(input_cost_usd + output_cost_usd),
                modelo: self.model.clone(),
                region: self.region.clone(),
            },
            input_cost_usd,
            output_cost_usd,
        }
    }
}

/// Run-level totals and per-conversation averages.
pub fn summarize(estimates: &[TokenEstimate]) -> TokenTotals {
    let conversations = estimates.len();
    let input_tokens: u64 = estimates.iter().map(|e| e.row.token_pregunta).sum();
    let output_tokens: u64 = estimates.iter().map(|e| e.row.token_respuesta).sum();
    let input_cost_usd = round_usd(estimates.iter().map(|e| e.input_cost_usd).sum());
    let output_cost_usd = round_usd(estimates.iter().map(|e| e.output_cost_usd).sum());
    let total_cost_usd = round_usd(estimates.iter().map(|e| e.row.costo_estimado_usd).sum());

    let average = |value: f64| {
        if conversations == 0 {
            0.0
        } else {
            value / conversations as f64
        }
    };

    TokenTotals {
        conversations,
        input_tokens,
        output_tokens,
        input_cost_usd,
        output_cost_usd,
        total_cost_usd,
        average_cost_per_conversation: round_usd(average(total_cost_usd)),
        average_input_tokens: average(input_tokens as f64),
        average_output_tokens: average(output_tokens as f64),
    }
}
