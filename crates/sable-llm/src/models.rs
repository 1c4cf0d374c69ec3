use sable_core::provider::ModelLimits;

/// Static description of a known model.
#[derive(Clone, Debug)]
pub struct ModelSpec {
    pub name: &'static str,
    pub display_name: &'static str,
    pub limits: ModelLimits,
}

pub static CLAUDE_OPUS_4_6: ModelSpec = ModelSpec {
    name: "claude-opus-4-6",
    display_name: "Claude Opus 4.6",
    limits: ModelLimits {
        context_limit: 200_000,
        output_limit: 128_000,
        input_limit: None,
    },
};

pub static CLAUDE_SONNET_4_5: ModelSpec = ModelSpec {
    name: "claude-sonnet-4-5-20250929",
    display_name: "Claude Sonnet 4.5",
    limits: ModelLimits {
        context_limit: 200_000,
        output_limit: 128_000,
        input_limit: None,
    },
};

pub static CLAUDE_HAIKU_4_5: ModelSpec = ModelSpec {
    name: "claude-haiku-4-5-20251001",
    display_name: "Claude Haiku 4.5",
    limits: ModelLimits {
        context_limit: 200_000,
        output_limit: 128_000,
        input_limit: None,
    },
};

static ALL_MODELS: &[&ModelSpec] = &[&CLAUDE_OPUS_4_6, &CLAUDE_SONNET_4_5, &CLAUDE_HAIKU_4_5];

pub fn find_model(name: &str) -> Option<&'static ModelSpec> {
    ALL_MODELS.iter().find(|m| m.name == name).copied()
}

pub fn default_model() -> &'static ModelSpec {
    &CLAUDE_SONNET_4_5
}

pub fn all_models() -> &'static [&'static ModelSpec] {
    ALL_MODELS
}
