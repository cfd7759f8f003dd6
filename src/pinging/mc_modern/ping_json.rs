use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::pinging::error::DecodeError;

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct PingVersion {
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "lenient_int")]
    pub protocol: i32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PingPlayer {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PingPlayerInfo {
    #[serde(default, deserialize_with = "lenient_int")]
    pub max: i64,
    #[serde(deserialize_with = "lenient_int")]
    pub online: i64,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient")]
    pub sample: Option<Vec<PingPlayer>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PingMod {
    #[serde(default)]
    pub modid: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PingModInfo {
    #[serde(rename = "type", default)]
    pub ty: String,
    #[serde(rename = "modList", default)]
    pub mod_list: Vec<PingMod>,
}

/// Accepts numbers and numeric strings; anything else, or a value out of
/// range, becomes the default.
fn lenient_int<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<i64> + Default,
{
    let value = Value::deserialize(deserializer)?;
    let number = match &value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    Ok(number
        .and_then(|n| T::try_from(n).ok())
        .unwrap_or_default())
}

/// Optional sections that do not have the expected shape are dropped instead
/// of failing the whole document.
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: serde::de::DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

/// A rich-text component as sent in `description`. Only `text` and `extra`
/// are interpreted; styling keys are carried along untouched.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ChatComponent {
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra: Vec<Value>,
    #[serde(flatten)]
    pub style: serde_json::Map<String, Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum Description {
    Plain(String),
    Chat(ChatComponent),
    Other(Value),
}

impl Default for Description {
    fn default() -> Self {
        Description::Plain(String::new())
    }
}

impl Description {
    /// The flat message of the day.
    pub fn text(&self) -> &str {
        match self {
            Description::Plain(text) => text.as_str(),
            Description::Chat(component) => component.text.as_str(),
            Description::Other(_) => "",
        }
    }

    /// Older servers send only `extra` segments with an empty `text`; rebuild
    /// the flat text from them.
    pub fn normalize(&mut self) {
        if let Description::Chat(component) = self {
            if component.text.is_empty() && !component.extra.is_empty() {
                component.text = component.extra.iter().map(segment_text).collect();
            }
        }
    }
}

fn segment_text(segment: &Value) -> &str {
    match segment {
        Value::String(text) => text.as_str(),
        Value::Object(fields) => fields.get("text").and_then(Value::as_str).unwrap_or(""),
        _ => "",
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PingResponse {
    #[serde(default)]
    pub version: PingVersion,
    pub players: PingPlayerInfo,
    #[serde(default)]
    pub description: Description,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient")]
    pub favicon: Option<String>,
    #[serde(
        rename = "enforcesSecureChat",
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient"
    )]
    pub enforces_secure_chat: Option<bool>,
    #[serde(
        rename = "previewsChat",
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient"
    )]
    pub previews_chat: Option<bool>,
    #[serde(
        rename = "modinfo",
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient"
    )]
    pub mods: Option<PingModInfo>,
}

impl PingResponse {
    /// Decodes a status document, requiring `players.online`, and normalizes
    /// the description.
    pub fn from_json(data: &[u8]) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_slice(data)?;
        if value.pointer("/players/online").is_none() {
            return Err(DecodeError::MissingField("players.online"));
        }

        let mut response: PingResponse = serde_json::from_value(value)?;
        response.description.normalize();
        Ok(response)
    }

    /// The server icon as PNG bytes, if the server sent one.
    pub fn favicon_png(&self) -> Option<Result<Vec<u8>, base64::DecodeError>> {
        self.favicon.as_deref().map(decode_favicon)
    }
}

fn decode_favicon(uri: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let encoded = match uri.split_once(";base64,") {
        Some((_, data)) => data,
        None => uri,
    };
    // some servers wrap the encoded icon across lines
    let encoded: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    base64::decode(encoded)
}
