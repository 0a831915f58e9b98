//! Models offered by setup flows, per provider.
//!
//! Kept separate from each provider's `models()` so a wizard can present a
//! short curated list; every entry must still be accepted by the provider.

/// Curated choices for `provider`, best first. Empty for unknown names.
pub fn offered_models(provider: &str) -> &'static [&'static str] {
    match provider {
        "anthropic" => &[
            "claude-sonnet-4-5-20250929",
            "claude-haiku-4-5-20251001",
            "claude-opus-4-1",
            "claude-3-5-sonnet-20241022",
        ],
        "openai" => &["gpt-4-turbo-preview", "gpt-4", "gpt-3.5-turbo"],
        "gemini" => &["gemini-1.5-pro", "gemini-1.5-flash", "gemini-pro"],
        "bedrock" => &[
            "anthropic.claude-3-5-sonnet-20241022-v2:0",
            "anthropic.claude-3-opus-20240229-v1:0",
            "anthropic.claude-3-haiku-20240307-v1:0",
        ],
        "meta" => &[
            "Llama-4-Maverick-17B-128E-Instruct-FP8",
            "Llama-3.3-70B-Instruct",
        ],
        "ollama" => &["llama3.2", "qwen2.5-coder", "mistral"],
        _ => &[],
    }
}

/// The first offered model, used when a caller names none.
pub fn default_model(provider: &str) -> Option<&'static str> {
    offered_models(provider).first().copied()
}
