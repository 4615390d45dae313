use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const STATUS_OK: u16 = 200;
pub const STATUS_NO_CONTENT: u16 = 204;
pub const STATUS_NOT_FOUND: u16 = 404;
pub const STATUS_INTERNAL_ERROR: u16 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    Request,
    Response,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    ServerGetEnv,
    ServerGetProp,
    ServerExit,
    ServerAddFilterPattern,
    ServerClearAllFilterPattern,
    ServerGetAllFilterPattern,
    ServerExecuteHttpRequest,
    ServerDownloadFile,
    ServerSetClientName,
    ClientExecuteHttpRequest,
    HeartBeat,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ServerGetEnv => "SERVER_GET_ENV",
            Self::ServerGetProp => "SERVER_GET_PROP",
            Self::ServerExit => "SERVER_EXIT",
            Self::ServerAddFilterPattern => "SERVER_ADD_FILTER_PATTERN",
            Self::ServerClearAllFilterPattern => "SERVER_CLEAR_ALL_FILTER_PATTERN",
            Self::ServerGetAllFilterPattern => "SERVER_GET_ALL_FILTER_PATTERN",
            Self::ServerExecuteHttpRequest => "SERVER_EXECUTE_HTTP_REQUEST",
            Self::ServerDownloadFile => "SERVER_DOWNLOAD_FILE",
            Self::ServerSetClientName => "SERVER_SET_CLIENT_NAME",
            Self::ClientExecuteHttpRequest => "CLIENT_EXECUTE_HTTP_REQUEST",
            Self::HeartBeat => "HEART_BEAT",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("command payload is missing")]
    Missing,
    #[error("command payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub command: Command,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "base64_bytes"
    )]
    pub payload: Option<Vec<u8>>,
}

impl CommandRequest {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            payload: None,
        }
    }

    pub fn with_bytes(command: Command, payload: Vec<u8>) -> Self {
        Self {
            command,
            payload: Some(payload),
        }
    }

    pub fn with_json<T: Serialize>(command: Command, value: &T) -> Result<Self, PayloadError> {
        Ok(Self {
            command,
            payload: Some(serde_json::to_vec(value)?),
        })
    }

    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T, PayloadError> {
        let payload = self.payload.as_deref().ok_or(PayloadError::Missing)?;
        Ok(serde_json::from_slice(payload)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub status: u16,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "base64_bytes"
    )]
    pub payload: Option<Vec<u8>>,
}

impl CommandResponse {
    pub fn ok() -> Self {
        Self {
            status: STATUS_OK,
            payload: None,
        }
    }

    pub fn ok_bytes(payload: Vec<u8>) -> Self {
        Self {
            status: STATUS_OK,
            payload: Some(payload),
        }
    }

    pub fn ok_json<T: Serialize>(value: &T) -> Result<Self, PayloadError> {
        Ok(Self {
            status: STATUS_OK,
            payload: Some(serde_json::to_vec(value)?),
        })
    }

    pub fn error(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            payload: Some(message.into().into_bytes()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }

    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T, PayloadError> {
        let payload = self.payload.as_deref().ok_or(PayloadError::Missing)?;
        Ok(serde_json::from_slice(payload)?)
    }

    pub fn payload_text(&self) -> Option<String> {
        self.payload
            .as_deref()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }
}

/// One framed message in either direction. A response carries the same id
/// as the request that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<CommandRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<CommandResponse>,
}

impl Envelope {
    pub fn request(id: impl Into<String>, request: CommandRequest) -> Self {
        Self {
            id: id.into(),
            kind: MessageKind::Request,
            request: Some(request),
            response: None,
        }
    }

    pub fn response(id: impl Into<String>, response: CommandResponse) -> Self {
        Self {
            id: id.into(),
            kind: MessageKind::Response,
            request: None,
            response: Some(response),
        }
    }

    pub fn fresh_id(prefix: &str) -> String {
        format!("{prefix}-{}", Uuid::new_v4())
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.id.is_empty() {
            return Err("envelope id must not be empty");
        }
        match self.kind {
            MessageKind::Request => {
                if self.request.is_none() {
                    return Err("REQUEST envelope is missing its request body");
                }
                if self.response.is_some() {
                    return Err("REQUEST envelope must not carry a response body");
                }
            }
            MessageKind::Response => {
                if self.response.is_none() {
                    return Err("RESPONSE envelope is missing its response body");
                }
                if self.request.is_some() {
                    return Err("RESPONSE envelope must not carry a request body");
                }
            }
        }
        Ok(())
    }

    /// Heart-beat frames are excluded from debug logging on both sides.
    pub fn is_heart_beat(&self) -> bool {
        matches!(
            self.request.as_ref().map(|request| request.command),
            Some(Command::HeartBeat)
        )
    }

    pub fn command(&self) -> Option<Command> {
        self.request.as_ref().map(|request| request.command)
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match bytes {
            Some(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = Option::<String>::deserialize(deserializer)?;
        match text {
            Some(text) => STANDARD
                .decode(text.as_bytes())
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
