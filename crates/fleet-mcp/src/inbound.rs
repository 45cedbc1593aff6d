//! Single entry point for interpreting chat messages addressed to the fleet.

use serde_json::{Map as JsonMap, Value as JsonValue};

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedMessage {
    /// A JSON object carrying a `command` field; remaining fields are args.
    Structured {
        command: String,
        args: JsonMap<String, JsonValue>,
    },
    /// Best-effort free text with the leading mention removed.
    Text {
        mention: Option<String>,
        body: String,
    },
}

impl ParsedMessage {
    pub fn is_structured(&self) -> bool {
        matches!(self, ParsedMessage::Structured { .. })
    }
}

pub fn parse_inbound_message(raw: &str) -> Option<ParsedMessage> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.starts_with('{')
        && let Ok(JsonValue::Object(mut map)) = serde_json::from_str::<JsonValue>(trimmed)
        && let Some(JsonValue::String(command)) = map.remove("command")
        && !command.trim().is_empty()
    {
        let args = match map.remove("args") {
            Some(JsonValue::Object(args)) if map.is_empty() => args,
            Some(other) => {
                map.insert("args".to_string(), other);
                map
            }
            None => map,
        };
        return Some(ParsedMessage::Structured {
            command: command.trim().to_string(),
            args,
        });
    }
    let (mention, body) = split_mention(trimmed);
    Some(ParsedMessage::Text {
        mention,
        body: body.to_string(),
    })
}

/// `<@123>`, `<@!123>` or `@name` at the very start.
fn split_mention(text: &str) -> (Option<String>, &str) {
    if let Some(rest) = text.strip_prefix("<@")
        && let Some(end) = rest.find('>')
    {
        let id = rest[..end].trim_start_matches(['!', '&']);
        if !id.is_empty() {
            return (Some(id.to_string()), rest[end + 1..].trim_start());
        }
    }
    if let Some(rest) = text.strip_prefix('@') {
        let end = rest
            .find(|c: char| !(c.is_alphanumeric() || matches!(c, '_' | '-' | '.')))
            .unwrap_or(rest.len());
        if end > 0 {
            let body = rest[end..].trim_start_matches([':', ',']).trim_start();
            return (Some(rest[..end].to_string()), body);
        }
    }
    (None, text)
}
