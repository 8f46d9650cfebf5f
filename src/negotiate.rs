//! Negotiate response model and decoder.
//!
//! The negotiate endpoint answers with a flat JSON object discriminated by
//! key presence: an `error`, a redirect (`url` + `accessToken`), or a
//! payload keyed by `negotiateVersion`. [`NegotiationResponse`] models that
//! as a sum type so unreachable field combinations cannot be represented.
//!
//! The decoder walks a [`serde_json::Value`] by hand instead of deriving
//! `Deserialize`: every failure must identify the exact key path that broke
//! (`availableTransports[0].transferFormats[1]`), and the discrimination
//! rules cut across what a derive can express.

use std::fmt;

use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::transport::{TransferFormat, TransportDescription, TransportKind};

/// One segment of a coding path: an object key or an array index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    /// An object key.
    Key(&'static str),
    /// An array index.
    Index(usize),
}

/// The location of a decode failure, as a sequence of keys and indices.
///
/// Displays as `availableTransports[0].transferFormats[1]`; the empty path
/// displays as `root`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CodingPath(Vec<PathSegment>);

impl CodingPath {
    /// The root of the document.
    #[must_use]
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// A new path with `segment` appended.
    #[must_use]
    pub fn child(&self, segment: PathSegment) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment);
        Self(segments)
    }

    /// The segments of this path, outermost first.
    #[must_use]
    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }
}

impl fmt::Display for CodingPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("root");
        }
        for (i, segment) in self.0.iter().enumerate() {
            match segment {
                PathSegment::Key(key) => {
                    if i > 0 {
                        f.write_str(".")?;
                    }
                    f.write_str(key)?;
                }
                PathSegment::Index(index) => write!(f, "[{index}]")?,
            }
        }
        Ok(())
    }
}

/// A structured negotiate decode failure: what went wrong, and where.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NegotiateDecodeError {
    /// A value had the wrong JSON type.
    #[error("type mismatch at {path}: expected {expected}, found {found}")]
    TypeMismatch {
        /// Where the mismatched value sits.
        path: CodingPath,
        /// The JSON type the decoder required.
        expected: &'static str,
        /// The JSON type actually present.
        found: &'static str,
    },

    /// A required key was absent.
    #[error("key not found at {path}: {key}")]
    KeyNotFound {
        /// The object the key was expected in.
        path: CodingPath,
        /// The missing key.
        key: &'static str,
    },

    /// A required key was present but null.
    #[error("value not found at {path}: {key} was null")]
    ValueNotFound {
        /// The object holding the null.
        path: CodingPath,
        /// The key whose value was null.
        key: &'static str,
    },

    /// A value was well-typed but semantically invalid.
    #[error("data corrupted at {path}: {message}")]
    DataCorrupted {
        /// Where the invalid value sits.
        path: CodingPath,
        /// What made it invalid.
        message: String,
    },
}

/// A decoded negotiate response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationResponse {
    /// The server refuses to open a connection.
    Error {
        /// The server's refusal message.
        message: String,
    },
    /// The client must retry negotiation at `url`, using `access_token` as
    /// bearer. The URL replaces the connection URL for all later requests.
    Redirection {
        /// The new base URL.
        url: Url,
        /// The bearer token for subsequent requests.
        access_token: String,
    },
    /// Legacy (`negotiateVersion: 0`) payload.
    PayloadV0 {
        /// The server-assigned connection handle, also used as the `id`
        /// query parameter.
        connection_id: String,
        /// Transports the server is willing to speak.
        available_transports: Vec<TransportDescription>,
    },
    /// Current (`negotiateVersion >= 1`) payload.
    PayloadV1 {
        /// The externally visible connection handle.
        connection_id: String,
        /// The routing key passed as the `id` query parameter.
        connection_token: String,
        /// Transports the server is willing to speak.
        available_transports: Vec<TransportDescription>,
    },
}

impl NegotiationResponse {
    /// Decode a negotiate response body.
    ///
    /// # Errors
    ///
    /// Returns a [`NegotiateDecodeError`] identifying the offending key path
    /// when the body is not a JSON object of one of the known shapes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, NegotiateDecodeError> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| NegotiateDecodeError::DataCorrupted {
                path: CodingPath::root(),
                message: format!("response body is not valid JSON: {e}"),
            })?;
        Self::from_value(&value)
    }

    /// Decode an already-parsed JSON value.
    ///
    /// # Errors
    ///
    /// See [`from_slice`](Self::from_slice).
    pub fn from_value(value: &Value) -> Result<Self, NegotiateDecodeError> {
        let root = CodingPath::root();
        let object = match value {
            Value::Object(object) => object,
            other => {
                return Err(NegotiateDecodeError::TypeMismatch {
                    path: root,
                    expected: "object",
                    found: json_type_name(other),
                })
            }
        };

        // Discrimination order: error, then redirect, then payload.
        if let Some(message) = object.get("error").and_then(Value::as_str) {
            return Ok(Self::Error {
                message: message.to_owned(),
            });
        }

        if object.contains_key("url") {
            return decode_redirection(object, &root);
        }

        decode_payload(object, &root)
    }

    /// The advertised transports, when this is a payload variant.
    #[must_use]
    pub fn available_transports(&self) -> Option<&[TransportDescription]> {
        match self {
            Self::PayloadV0 {
                available_transports,
                ..
            }
            | Self::PayloadV1 {
                available_transports,
                ..
            } => Some(available_transports),
            _ => None,
        }
    }
}

fn decode_redirection(
    object: &serde_json::Map<String, Value>,
    root: &CodingPath,
) -> Result<NegotiationResponse, NegotiateDecodeError> {
    let url_str = match object.get("url") {
        Some(Value::Null) | None => {
            return Err(NegotiateDecodeError::ValueNotFound {
                path: root.clone(),
                key: "url",
            })
        }
        Some(Value::String(s)) => s,
        Some(other) => {
            return Err(NegotiateDecodeError::TypeMismatch {
                path: root.child(PathSegment::Key("url")),
                expected: "string",
                found: json_type_name(other),
            })
        }
    };
    let url = Url::parse(url_str).map_err(|e| NegotiateDecodeError::DataCorrupted {
        path: root.child(PathSegment::Key("url")),
        message: format!("invalid URL {url_str:?}: {e}"),
    })?;
    let access_token = required_string(object, root, "accessToken")?;
    Ok(NegotiationResponse::Redirection {
        url,
        access_token: access_token.to_owned(),
    })
}

fn decode_payload(
    object: &serde_json::Map<String, Value>,
    root: &CodingPath,
) -> Result<NegotiationResponse, NegotiateDecodeError> {
    let version = match object.get("negotiateVersion") {
        None => {
            return Err(NegotiateDecodeError::KeyNotFound {
                path: root.clone(),
                key: "negotiateVersion",
            })
        }
        Some(Value::Null) => {
            return Err(NegotiateDecodeError::ValueNotFound {
                path: root.clone(),
                key: "negotiateVersion",
            })
        }
        Some(value) => value.as_i64().ok_or(NegotiateDecodeError::TypeMismatch {
            path: root.child(PathSegment::Key("negotiateVersion")),
            expected: "integer",
            found: json_type_name(value),
        })?,
    };

    let connection_id = required_string(object, root, "connectionId")?.to_owned();

    if version >= 1 {
        let connection_token = required_string(object, root, "connectionToken")?.to_owned();
        let available_transports = decode_transports(object, root)?;
        Ok(NegotiationResponse::PayloadV1 {
            connection_id,
            connection_token,
            available_transports,
        })
    } else {
        let available_transports = decode_transports(object, root)?;
        Ok(NegotiationResponse::PayloadV0 {
            connection_id,
            available_transports,
        })
    }
}

fn decode_transports(
    object: &serde_json::Map<String, Value>,
    root: &CodingPath,
) -> Result<Vec<TransportDescription>, NegotiateDecodeError> {
    let entries = match object.get("availableTransports") {
        None => {
            return Err(NegotiateDecodeError::KeyNotFound {
                path: root.clone(),
                key: "availableTransports",
            })
        }
        Some(Value::Null) => {
            return Err(NegotiateDecodeError::ValueNotFound {
                path: root.clone(),
                key: "availableTransports",
            })
        }
        Some(Value::Array(entries)) => entries,
        Some(other) => {
            return Err(NegotiateDecodeError::TypeMismatch {
                path: root.child(PathSegment::Key("availableTransports")),
                expected: "array",
                found: json_type_name(other),
            })
        }
    };

    let transports_path = root.child(PathSegment::Key("availableTransports"));
    entries
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            let entry_path = transports_path.child(PathSegment::Index(index));
            decode_transport_entry(entry, &entry_path)
        })
        .collect()
}

fn decode_transport_entry(
    entry: &Value,
    path: &CodingPath,
) -> Result<TransportDescription, NegotiateDecodeError> {
    let object = match entry {
        Value::Object(object) => object,
        other => {
            return Err(NegotiateDecodeError::TypeMismatch {
                path: path.clone(),
                expected: "object",
                found: json_type_name(other),
            })
        }
    };

    let kind_str = required_string(object, path, "transport")?;
    let transport =
        TransportKind::from_wire(kind_str).ok_or_else(|| NegotiateDecodeError::DataCorrupted {
            path: path.child(PathSegment::Key("transport")),
            message: format!("invalid TransportKind value {kind_str:?}"),
        })?;

    let formats = match object.get("transferFormats") {
        None => {
            return Err(NegotiateDecodeError::KeyNotFound {
                path: path.clone(),
                key: "transferFormats",
            })
        }
        Some(Value::Null) => {
            return Err(NegotiateDecodeError::ValueNotFound {
                path: path.clone(),
                key: "transferFormats",
            })
        }
        Some(Value::Array(formats)) => formats,
        Some(other) => {
            return Err(NegotiateDecodeError::TypeMismatch {
                path: path.child(PathSegment::Key("transferFormats")),
                expected: "array",
                found: json_type_name(other),
            })
        }
    };

    let formats_path = path.child(PathSegment::Key("transferFormats"));
    let transfer_formats = formats
        .iter()
        .enumerate()
        .map(|(index, value)| {
            let format_path = formats_path.child(PathSegment::Index(index));
            let s = value.as_str().ok_or(NegotiateDecodeError::TypeMismatch {
                path: format_path.clone(),
                expected: "string",
                found: json_type_name(value),
            })?;
            TransferFormat::from_wire(s).ok_or_else(|| NegotiateDecodeError::DataCorrupted {
                path: format_path,
                message: format!("invalid TransferFormat value {s:?}"),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(TransportDescription {
        transport,
        transfer_formats,
    })
}

fn required_string<'a>(
    object: &'a serde_json::Map<String, Value>,
    path: &CodingPath,
    key: &'static str,
) -> Result<&'a str, NegotiateDecodeError> {
    match object.get(key) {
        None => Err(NegotiateDecodeError::KeyNotFound {
            path: path.clone(),
            key,
        }),
        Some(Value::Null) => Err(NegotiateDecodeError::ValueNotFound {
            path: path.clone(),
            key,
        }),
        Some(Value::String(s)) => Ok(s),
        Some(other) => Err(NegotiateDecodeError::TypeMismatch {
            path: path.child(PathSegment::Key(key)),
            expected: "string",
            found: json_type_name(other),
        }),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
