use std::fmt;

use bincode::{Decode, Encode};

use crate::data::Data;

/// Correlation token for stateful settings. `high == 0` marks a context
/// created by this client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Context {
    pub high: u32,
    pub low: u32,
}

impl Context {
    pub const fn new(high: u32, low: u32) -> Self {
        Self { high, low }
    }
}

impl From<(u32, u32)> for Context {
    fn from((high, low): (u32, u32)) -> Self {
        Self { high, low }
    }
}

/// Destination server, by id or by name awaiting lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Id(u32),
    Name(String),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Id(id) => write!(f, "#{id}"),
            Target::Name(name) => write!(f, "'{name}'"),
        }
    }
}

impl From<u32> for Target {
    fn from(value: u32) -> Self {
        Target::Id(value)
    }
}

impl From<&str> for Target {
    fn from(value: &str) -> Self {
        Target::Name(value.to_string())
    }
}

impl From<String> for Target {
    fn from(value: String) -> Self {
        Target::Name(value)
    }
}

/// Setting identifier, by id or by name awaiting lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Setting {
    Id(u32),
    Name(String),
}

impl From<u32> for Setting {
    fn from(value: u32) -> Self {
        Setting::Id(value)
    }
}

impl From<&str> for Setting {
    fn from(value: &str) -> Self {
        Setting::Name(value.to_string())
    }
}

impl From<String> for Setting {
    fn from(value: String) -> Self {
        Setting::Name(value)
    }
}

/// Caller-facing record. The setting may still be a name.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub setting: Setting,
    pub data: Data,
    pub tag: Option<String>,
}

impl Record {
    pub fn new(setting: impl Into<Setting>, data: impl Into<Data>) -> Self {
        Self {
            setting: setting.into(),
            data: data.into(),
            tag: None,
        }
    }

    /// Overrides the type tag that would otherwise be derived from the data.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }
}

/// Fully resolved record as it travels on the wire.
#[derive(Debug, Clone, Encode, Decode, PartialEq)]
pub struct WireRecord {
    pub setting: u32,
    pub tag: String,
    pub data: Data,
}

impl WireRecord {
    pub fn new(setting: u32, data: impl Into<Data>, tag: Option<String>) -> Self {
        let data = data.into();
        let tag = tag.unwrap_or_else(|| data.tag());
        Self { setting, tag, data }
    }
}

/// One framed unit of traffic.
///
/// `request > 0` is a new request, `request < 0` answers request `-request`,
/// and `request == 0` is a one-way message.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub target: u32,
    pub context: Context,
    pub request: i32,
    pub records: Vec<WireRecord>,
}

impl Packet {
    pub fn is_reply(&self) -> bool {
        self.request < 0
    }

    pub fn is_message(&self) -> bool {
        self.request == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_record_derives_missing_tag() {
        let record = WireRecord::new(3, Data::Word(7), None);
        assert_eq!(record.tag, "w");

        let record = WireRecord::new(3, Data::Word(7), Some("v[K]".to_string()));
        assert_eq!(record.tag, "v[K]");
    }

    #[test]
    fn record_builder_keeps_names() {
        let record = Record::new("temperatures", Data::None).with_tag("_");
        assert_eq!(record.setting, Setting::Name("temperatures".to_string()));
        assert_eq!(record.tag.as_deref(), Some("_"));
    }

    #[test]
    fn packet_framing_kind() {
        let packet = Packet {
            target: 1,
            context: Context::default(),
            request: -4,
            records: vec![],
        };
        assert!(packet.is_reply());
        assert!(!packet.is_message());
    }
}
