//! State tokens: the text a build verb prints and a script concatenates.
//!
//! Each action becomes `+<tag>:<hex>`, where `<hex>` is the lowercase hex
//! encoding of the action's JSON payload. Hex never contains `+` or shell
//! metacharacters, so tokens can be glued together with plain string
//! concatenation and decoded by splitting on `+`.

use crate::action::Action;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Marks the start of every token.
pub const TOKEN_PREFIX: char = '+';

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("failed to serialize '{tag}' action: {source}")]
    Payload {
        tag: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("state must start with '+', found '{0}'")]
    MissingDelimiter(String),

    #[error("state token '{0}' has no action tag")]
    MissingTag(String),

    #[error("unknown action tag '{0}'")]
    UnknownTag(String),

    #[error("state token '{tag}' is not valid hex: {source}")]
    Hex {
        tag: String,
        #[source]
        source: hex::FromHexError,
    },

    #[error("state token '{tag}' has a malformed payload: {source}")]
    Payload {
        tag: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Encode one action as a state token.
pub fn encode(action: &Action) -> Result<String, EncodeError> {
    let tag = action.tag();
    let payload = match action {
        Action::NewParser(p) => serde_json::to_vec(p),
        Action::AddArgument(p) => serde_json::to_vec(p),
        Action::AddSubparserGroup(p) => serde_json::to_vec(p),
        Action::AddSubcommand(p) => serde_json::to_vec(p),
        Action::SetDefaults(p) => serde_json::to_vec(p),
    }
    .map_err(|source| EncodeError::Payload { tag, source })?;

    Ok(format!("{TOKEN_PREFIX}{tag}:{}", hex::encode(payload)))
}

/// Decode a concatenation of state tokens, in order.
///
/// Whitespace around tokens is ignored and an empty stream decodes to no
/// actions. Any malformed token fails the whole stream.
pub fn decode(stream: &str) -> Result<Vec<Action>, DecodeError> {
    let stream = stream.trim();
    if stream.is_empty() {
        return Ok(Vec::new());
    }

    let rest = stream.strip_prefix(TOKEN_PREFIX).ok_or_else(|| {
        let head: String = stream.chars().take(16).collect();
        DecodeError::MissingDelimiter(head)
    })?;

    rest.split(TOKEN_PREFIX).map(str::trim).map(decode_token).collect()
}

fn decode_token(token: &str) -> Result<Action, DecodeError> {
    let (tag, hex_payload) = token
        .split_once(':')
        .filter(|(tag, _)| !tag.is_empty())
        .ok_or_else(|| DecodeError::MissingTag(token.to_string()))?;

    let bytes = hex::decode(hex_payload.trim()).map_err(|source| DecodeError::Hex {
        tag: tag.to_string(),
        source,
    })?;

    match tag {
        "new" => payload(tag, &bytes).map(Action::NewParser),
        "add_arg" => payload(tag, &bytes).map(Action::AddArgument),
        "add_subparser" => payload(tag, &bytes).map(Action::AddSubparserGroup),
        "add_subcommand" => payload(tag, &bytes).map(Action::AddSubcommand),
        "set_defaults" => payload(tag, &bytes).map(Action::SetDefaults),
        other => Err(DecodeError::UnknownTag(other.to_string())),
    }
}

fn payload<T: DeserializeOwned>(tag: &str, bytes: &[u8]) -> Result<T, DecodeError> {
    serde_json::from_slice(bytes).map_err(|source| DecodeError::Payload {
        tag: tag.to_string(),
        source,
    })
}
