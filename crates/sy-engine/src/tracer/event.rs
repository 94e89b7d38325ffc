//! Immutable traced snapshots and their XML/JSON renderings

use chrono::{DateTime, Utc};
use quick_xml::escape::escape;
use serde::{Serialize, Serializer};

pub const ROOT_TAG: &str = "backlogTracerEventMessage";
pub const LIST_TAG: &str = "backlogTracerEventMessages";
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f%z";

/// Indent the message XML is rendered at, placing it inside an event that
/// sits inside an event list
pub const MESSAGE_INDENT: usize = 4;

/// One traced snapshot, immutable once recorded
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TracedEvent {
    uid: u64,
    #[serde(serialize_with = "serialize_timestamp")]
    timestamp: DateTime<Utc>,
    route_id: Option<String>,
    /// Absent for the synthetic event recorded at route entry
    to_node: Option<String>,
    exchange_id: String,
    #[serde(rename = "message")]
    message_as_xml: String,
}

fn serialize_timestamp<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&ts.format(TIMESTAMP_FORMAT).to_string())
}

impl TracedEvent {
    pub fn new(
        uid: u64,
        route_id: Option<String>,
        to_node: Option<String>,
        exchange_id: impl Into<String>,
        message_as_xml: String,
    ) -> Self {
        Self {
            uid,
            timestamp: Utc::now(),
            route_id,
            to_node,
            exchange_id: exchange_id.into(),
            message_as_xml,
        }
    }

    pub fn uid(&self) -> u64 {
        self.uid
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn route_id(&self) -> Option<&str> {
        self.route_id.as_deref()
    }

    pub fn to_node(&self) -> Option<&str> {
        self.to_node.as_deref()
    }

    pub fn exchange_id(&self) -> &str {
        &self.exchange_id
    }

    pub fn message_as_xml(&self) -> &str {
        &self.message_as_xml
    }

    /// True if the event targets this node or belongs to this route
    pub fn is_for(&self, id: &str) -> bool {
        self.to_node.as_deref() == Some(id) || self.route_id.as_deref() == Some(id)
    }

    /// Render as a `backlogTracerEventMessage` element.
    ///
    /// `toNode` falls back to the route id for route-entry events. The
    /// message XML is embedded exactly as it was rendered when the event was
    /// created, so multi-line text inside it is never altered.
    pub fn to_xml(&self, indent: usize) -> String {
        let pad = " ".repeat(indent);
        let route_id = self.route_id.as_deref().unwrap_or_default();
        let to_node = self.to_node.as_deref().unwrap_or(route_id);

        let mut xml = String::new();
        xml.push_str(&format!("{}<{}>\n", pad, ROOT_TAG));
        xml.push_str(&format!("{}  <uid>{}</uid>\n", pad, self.uid));
        xml.push_str(&format!(
            "{}  <timestamp>{}</timestamp>\n",
            pad,
            self.timestamp.format(TIMESTAMP_FORMAT)
        ));
        xml.push_str(&format!("{}  <routeId>{}</routeId>\n", pad, escape(route_id)));
        xml.push_str(&format!("{}  <toNode>{}</toNode>\n", pad, escape(to_node)));
        xml.push_str(&format!(
            "{}  <exchangeId>{}</exchangeId>\n",
            pad,
            escape(self.exchange_id.as_str())
        ));
        xml.push_str(&self.message_as_xml);
        xml.push('\n');
        xml.push_str(&format!("{}</{}>", pad, ROOT_TAG));
        xml
    }
}

/// Wrap events in a `backlogTracerEventMessages` list element
pub fn events_to_xml(events: &[TracedEvent]) -> String {
    let mut xml = format!("<{}>\n", LIST_TAG);
    for event in events {
        xml.push_str(&event.to_xml(2));
        xml.push('\n');
    }
    xml.push_str(&format!("</{}>", LIST_TAG));
    xml
}

/// Render events as a JSON array
pub fn events_to_json(events: &[TracedEvent]) -> serde_json::Result<String> {
    serde_json::to_string_pretty(events)
}
