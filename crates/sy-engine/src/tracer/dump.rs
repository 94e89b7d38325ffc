//! Message snapshots rendered as XML

use quick_xml::escape::escape;
use serde_json::Value;
use sy_common::{Body, Exchange};

/// Controls how much of a message ends up in a snapshot.
///
/// `include_streams` only affects cached stream bodies. Stream caching runs
/// after the tracer and debugger advices in a channel, so their snapshots see
/// the raw one-shot stream and render the stream placeholder either way; a
/// step further down the route sees the cached body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumpOptions {
    pub body_max_chars: usize,
    pub include_streams: bool,
    pub include_exception: bool,
}

impl Default for DumpOptions {
    fn default() -> Self {
        Self {
            body_max_chars: sy_config::DEFAULT_BODY_MAX_CHARS,
            include_streams: false,
            include_exception: true,
        }
    }
}

fn header_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn header_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Body text for a snapshot. Streams are never consumed for display, so a
/// one-shot stream always renders as a placeholder regardless of
/// `include_streams`.
pub fn body_text(body: &Body, options: &DumpOptions) -> String {
    let text = match body {
        Body::Empty => return "[Body is null]".to_string(),
        Body::Stream(_) => return "[Body is instance of stream]".to_string(),
        Body::Cached(_) if !options.include_streams => {
            return "[Body is instance of cached-stream]".to_string()
        }
        other => other.as_text().unwrap_or_default(),
    };
    clip(text, options.body_max_chars)
}

fn clip(text: String, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text;
    }
    let kept: String = text.chars().take(max_chars).collect();
    format!(
        "{}... [Body clipped after {} chars, total length is {}]",
        kept, max_chars, total
    )
}

/// Render the exchange's message as a `<message>` element, each line
/// prefixed with `indent` spaces
pub fn message_as_xml(exchange: &Exchange, options: &DumpOptions, indent: usize) -> String {
    let pad = " ".repeat(indent);
    let message = exchange.message();
    let mut xml = String::new();

    xml.push_str(&format!(
        "{}<message exchangeId=\"{}\" exchangePattern=\"{}\">\n",
        pad,
        escape(exchange.id()),
        exchange.pattern()
    ));

    if !message.headers().is_empty() {
        xml.push_str(&format!("{}  <headers>\n", pad));
        for (key, value) in message.headers() {
            xml.push_str(&format!(
                "{}    <header key=\"{}\" type=\"{}\">{}</header>\n",
                pad,
                escape(key.as_str()),
                header_type(value),
                escape(header_text(value).as_str())
            ));
        }
        xml.push_str(&format!("{}  </headers>\n", pad));
    }

    let body = message.body();
    xml.push_str(&format!(
        "{}  <body type=\"{}\">{}</body>\n",
        pad,
        body.type_name(),
        escape(body_text(body, options).as_str())
    ));

    if options.include_exception {
        if let Some(failure) = exchange.failure() {
            let node = failure
                .node_id
                .as_deref()
                .map(|n| format!(" nodeId=\"{}\"", escape(n)))
                .unwrap_or_default();
            xml.push_str(&format!(
                "{}  <exception kind=\"{}\"{}>{}</exception>\n",
                pad,
                escape(failure.kind.as_str()),
                node,
                escape(failure.message.as_str())
            ));
        }
    }

    xml.push_str(&format!("{}</message>", pad));
    xml
}
