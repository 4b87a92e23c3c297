use crate::scanner::RawPayload;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::OnceLock;

/// Software tag stored for payloads read from a `parameters` chunk.
pub const STABLE_DIFFUSION_SOFTWARE: &str = "Stable Diffusion";
/// Software tag stored for payloads read from a NovelAI `Comment` chunk.
pub const NOVELAI_SOFTWARE: &str = "NovelAI";

pub const PROMPT_KEY: &str = "Prompt";
pub const NEGATIVE_PROMPT_KEY: &str = "Negative prompt";
const NEGATIVE_PROMPT_PREFIX: &str = "Negative prompt: ";

/// Fixed order and labels of the NovelAI description summary.
const NOVELAI_DESCRIPTION_KEYS: &[&str] = &["steps", "height", "width", "scale", "seed", "sampler"];

/// The attributes the store persists for an image's embedded metadata.
/// All fields are empty when nothing could be extracted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationAttributes {
    pub software: String,
    pub prompt: String,
    pub negative_prompt: String,
    pub description: String,
}

impl GenerationAttributes {
    pub fn is_empty(&self) -> bool {
        self.software.is_empty()
            && self.prompt.is_empty()
            && self.negative_prompt.is_empty()
            && self.description.is_empty()
    }
}

/// Open-ended key/value result of the parameter-block grammar.
///
/// Keys keep their first-seen position; a repeated key overwrites the value
/// in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterMap {
    entries: Vec<(String, String)>,
}

impl ParameterMap {
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(existing, _)| *existing == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Scalar settings, i.e. everything except the two prompt entries.
    pub fn settings(&self) -> impl Iterator<Item = (&str, &str)> {
        self.iter()
            .filter(|(key, _)| *key != PROMPT_KEY && *key != NEGATIVE_PROMPT_KEY)
    }
}

/// `Key: value` pairs inside a settings line. A key starts with an uppercase
/// ASCII letter; a value runs until the next comma.
fn pair_regex() -> &'static Regex {
    static PAIR: OnceLock<Regex> = OnceLock::new();
    PAIR.get_or_init(|| {
        Regex::new(r"([A-Z][a-zA-Z0-9 ]*): ([^,]+)(?:, )?").expect("invalid key/value pattern")
    })
}

fn line_starts_with_pair(line: &str) -> bool {
    pair_regex()
        .find(line)
        .map(|found| found.start() == 0)
        .unwrap_or(false)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Prompt,
    NegativePrompt,
    Settings,
}

/// Parses a Stable-Diffusion style parameter block.
///
/// Format: `{prompt}\nNegative prompt: {neg}\nSteps: N, Sampler: X, ...`
///
/// Lines are consumed in three phases. The positive prompt accumulates until
/// a line starts with `Negative prompt: ` or with a `Key: value` pair; the
/// negative prompt accumulates until a line starts with a pair; from then on
/// every line is scanned for pairs. A first line that already starts with a
/// pair therefore leaves the positive prompt empty.
pub fn parse_parameter_block(raw: &str) -> ParameterMap {
    let mut data = ParameterMap::default();
    let mut prompt = String::new();
    let mut negative_prompt = String::new();
    let mut phase = Phase::Prompt;

    for line in raw.lines() {
        if phase == Phase::Prompt {
            if let Some(rest) = line.strip_prefix(NEGATIVE_PROMPT_PREFIX) {
                negative_prompt.push_str(rest);
                phase = Phase::NegativePrompt;
                continue;
            }
            if line_starts_with_pair(line) {
                phase = Phase::Settings;
            } else {
                prompt.push('\n');
                prompt.push_str(line);
                continue;
            }
        }

        if phase == Phase::NegativePrompt {
            if line_starts_with_pair(line) {
                phase = Phase::Settings;
            } else {
                negative_prompt.push('\n');
                negative_prompt.push_str(line);
                continue;
            }
        }

        for captures in pair_regex().captures_iter(line) {
            let (Some(key), Some(value)) = (captures.get(1), captures.get(2)) else {
                continue;
            };
            data.insert(key.as_str(), value.as_str().trim());
        }
    }

    data.insert(PROMPT_KEY, prompt.trim());
    data.insert(NEGATIVE_PROMPT_KEY, negative_prompt.trim());
    data
}

/// Projects a parsed parameter block onto the persisted attributes.
///
/// The two prompts map directly; the scalar settings are kept, in the order
/// they appeared, as a `Key: value, ...` description.
pub fn attributes_from_parameters(data: &ParameterMap) -> GenerationAttributes {
    let description = data
        .settings()
        .map(|(key, value)| format!("{}: {}", key, value))
        .collect::<Vec<_>>()
        .join(", ");

    GenerationAttributes {
        software: STABLE_DIFFUSION_SOFTWARE.to_string(),
        prompt: data.get(PROMPT_KEY).unwrap_or_default().to_string(),
        negative_prompt: data.get(NEGATIVE_PROMPT_KEY).unwrap_or_default().to_string(),
        description,
    }
}

/// Parses a NovelAI `Comment` JSON payload.
///
/// Returns `None` when the payload is not a JSON object; the caller treats
/// that the same as "no metadata".
pub fn parse_novelai_comment(raw: &str) -> Option<GenerationAttributes> {
    let value: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(err) => {
            log::warn!("Invalid NovelAI comment JSON: {}", err);
            return None;
        }
    };
    let object = value.as_object()?;

    let description = NOVELAI_DESCRIPTION_KEYS
        .iter()
        .map(|key| format!("{}: {}", key, render_scalar(object.get(*key))))
        .collect::<Vec<_>>()
        .join(", ");

    Some(GenerationAttributes {
        software: NOVELAI_SOFTWARE.to_string(),
        prompt: render_scalar(object.get("prompt")),
        negative_prompt: render_scalar(object.get("uc")),
        description,
    })
}

/// Renders a JSON value as plain text: strings without quotes, missing or
/// null as empty.
fn render_scalar(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(Value::Number(number)) => number.to_string(),
        Some(Value::Bool(boolean)) => boolean.to_string(),
        Some(other) => other.to_string(),
    }
}

/// Turns an extracted payload into persisted attributes, choosing the
/// grammar by the payload's shape. Unparsable payloads yield empty
/// attributes.
pub fn parse_payload(payload: &RawPayload) -> GenerationAttributes {
    match payload {
        RawPayload::Parameters(text) => attributes_from_parameters(&parse_parameter_block(text)),
        RawPayload::NovelAiComment(text) => parse_novelai_comment(text).unwrap_or_default(),
    }
}
