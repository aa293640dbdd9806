use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A command of the cache protocol.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    Get,
    Put,
    Close,
    /// Any command this server does not know.
    #[default]
    #[serde(other)]
    Unknown,
}

impl AsRef<str> for Command {
    fn as_ref(&self) -> &str {
        match self {
            Command::Get => "get",
            Command::Put => "put",
            Command::Close => "close",
            Command::Unknown => "unknown",
        }
    }
}

/// A request sent by the build tool.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Request {
    #[serde(rename = "ID")]
    pub id: i64,

    #[serde(rename = "Command", default)]
    pub command: Command,

    #[serde(
        rename = "ActionID",
        default,
        with = "base64_bytes",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub action_id: Vec<u8>,

    #[serde(
        rename = "OutputID",
        default,
        with = "base64_bytes",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub output_id: Vec<u8>,

    /// The name `OutputID` had in older toolchains.
    #[serde(
        rename = "ObjectID",
        default,
        with = "base64_bytes_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub object_id: Option<Vec<u8>>,

    /// Length of the body record following a `put`.
    #[serde(rename = "BodySize", default, skip_serializing_if = "is_zero")]
    pub body_size: i64,
}

impl Request {
    /// Folds the legacy `ObjectID` into `OutputID`, which it overrides.
    pub fn normalize(mut self) -> Self {
        if let Some(object_id) = self.object_id.take() {
            self.output_id = object_id;
        }
        self
    }

    /// Whether this request is followed by a body record.
    pub fn has_body(&self) -> bool {
        self.command == Command::Put && self.body_size > 0
    }
}

/// The body record following a `put`, a base64 encoded JSON string.
#[derive(Debug, Deserialize, Serialize)]
#[serde(transparent)]
pub struct Body(#[serde(with = "base64_bytes")] pub Vec<u8>);

/// A response to the build tool.
///
/// Empty fields are omitted on the wire, except for the `ID`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Response {
    #[serde(rename = "ID")]
    pub id: i64,

    #[serde(rename = "Err", default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,

    #[serde(
        rename = "KnownCommands",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub known_commands: Vec<Command>,

    #[serde(rename = "Miss", default, skip_serializing_if = "is_false")]
    pub miss: bool,

    #[serde(
        rename = "OutputID",
        default,
        with = "base64_bytes",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub output_id: Vec<u8>,

    #[serde(rename = "Size", default, skip_serializing_if = "is_zero")]
    pub size: i64,

    #[serde(rename = "TimeNanos", default, skip_serializing_if = "is_zero")]
    pub time_nanos: i64,

    #[serde(rename = "DiskPath", default, skip_serializing_if = "Option::is_none")]
    pub disk_path: Option<PathBuf>,
}

impl Response {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    /// The first record of every session, announcing the supported commands.
    pub fn handshake(readonly: bool) -> Self {
        let mut known_commands = vec![Command::Close, Command::Get];
        if !readonly {
            known_commands.push(Command::Put);
        }
        Self {
            known_commands,
            ..Default::default()
        }
    }

    pub fn error(id: i64, err: impl ToString) -> Self {
        Self {
            id,
            err: Some(err.to_string()),
            ..Default::default()
        }
    }
}

fn is_zero(value: &i64) -> bool {
    *value == 0
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// (De)serializes bytes as a standard base64 string. `null` reads as empty.
mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(encoded) => STANDARD.decode(encoded).map_err(de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}

mod base64_bytes_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => super::base64_bytes::serialize(bytes, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        #[derive(Deserialize)]
        struct Wrapper(#[serde(with = "super::base64_bytes")] Vec<u8>);

        Ok(Option::<Wrapper>::deserialize(deserializer)?.map(|Wrapper(bytes)| bytes))
    }
}
