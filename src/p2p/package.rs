//! Wire envelope codec for the p2p protocol
//!
//! Every frame on the wire is one JSON-encoded [`Package`]: a package type
//! from a small closed set, a command name, an opaque JSON object body and
//! an optional correlation tag. Tags are content-addressed — the same
//! logical request yields the same tag on every connection — which is what
//! makes duplicate collapsing and request rerouting possible.

use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Protocol version carried in every envelope and in every tag preimage.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Alt-chain marker carried in every envelope and in every tag preimage.
pub const PROTOCOL_ALT: &str = "1";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PackageError {
    #[error("invalid package type {0}")]
    InvalidType(u64),
    #[error("package body must be a JSON object")]
    InvalidBody,
    #[error("malformed package: {0}")]
    Malformed(String),
}

/// The closed set of wire package types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PackageType {
    System = 0,
    Ping = 10,
    Pong = 11,
    Talk = 20,
    Request = 30,
    Response = 31,
}

impl PackageType {
    pub fn from_wire(value: u64) -> Result<Self, PackageError> {
        match value {
            0 => Ok(PackageType::System),
            10 => Ok(PackageType::Ping),
            11 => Ok(PackageType::Pong),
            20 => Ok(PackageType::Talk),
            30 => Ok(PackageType::Request),
            31 => Ok(PackageType::Response),
            other => Err(PackageError::InvalidType(other)),
        }
    }

    pub fn as_wire(self) -> u64 {
        self as u64
    }

    /// Request-kind packages carry a tag and expect a correlated reply.
    pub fn expects_response(self) -> bool {
        matches!(self, PackageType::Ping | PackageType::Request)
    }
}

impl Serialize for PackageType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.as_wire())
    }
}

impl<'de> Deserialize<'de> for PackageType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = u64::deserialize(deserializer)?;
        PackageType::from_wire(value).map_err(serde::de::Error::custom)
    }
}

/// One decoded wire envelope. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Package {
    pub version: String,
    pub alt: String,
    #[serde(rename = "type")]
    pub package_type: PackageType,
    pub command: String,
    pub body: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

/// Raw deserialization target; the numeric type field is validated
/// separately so a bad value maps to `InvalidType`, not a parse error.
#[derive(Deserialize)]
struct WirePackage {
    version: String,
    alt: String,
    #[serde(rename = "type")]
    package_type: u64,
    command: String,
    body: Value,
    #[serde(default)]
    tag: Option<String>,
}

impl Package {
    /// Build an envelope from a command body. A `tag` key inside the body
    /// is lifted into the envelope's tag field, mirroring how responses
    /// carry the request tag inside their body until they hit the wire.
    pub fn from_parts(
        package_type: PackageType,
        command: &str,
        body: &Value,
    ) -> Result<Self, PackageError> {
        let mut body_map = body_object(body).ok_or(PackageError::InvalidBody)?;
        let tag = match body_map.remove("tag") {
            Some(Value::String(tag)) => Some(tag),
            Some(_) => return Err(PackageError::InvalidBody),
            None => None,
        };

        Ok(Package {
            version: PROTOCOL_VERSION.to_string(),
            alt: PROTOCOL_ALT.to_string(),
            package_type,
            command: command.to_string(),
            body: Value::Object(body_map),
            tag,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, PackageError> {
        if !self.body.is_object() {
            return Err(PackageError::InvalidBody);
        }
        serde_json::to_vec(self).map_err(|e| PackageError::Malformed(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PackageError> {
        let wire: WirePackage =
            serde_json::from_slice(bytes).map_err(|e| PackageError::Malformed(e.to_string()))?;
        let package_type = PackageType::from_wire(wire.package_type)?;
        if !wire.body.is_object() {
            return Err(PackageError::InvalidBody);
        }

        Ok(Package {
            version: wire.version,
            alt: wire.alt,
            package_type,
            command: wire.command,
            body: wire.body,
            tag: wire.tag,
        })
    }
}

/// Derive the content-addressed correlation tag for a logical request.
///
/// Pure and deterministic across connections and processes: the preimage
/// is the canonical (recursively key-sorted) JSON of the envelope fields,
/// with any previously attached `tag` key stripped from the body so a tag
/// never feeds back into itself. SHA-256, base64-encoded.
pub fn calculate_tag(
    package_type: PackageType,
    command: &str,
    body: &Value,
) -> Result<String, PackageError> {
    let mut body_map = body_object(body).ok_or(PackageError::InvalidBody)?;
    body_map.remove("tag");

    let preimage = json!({
        "version": PROTOCOL_VERSION,
        "alt": PROTOCOL_ALT,
        "type": package_type.as_wire(),
        "command": command,
        "body": canonical_json(&Value::Object(body_map)),
    });

    let digest = Sha256::digest(canonical_json(&preimage).as_bytes());
    Ok(general_purpose::STANDARD.encode(digest))
}

/// Clone a request body into object form. `Null` maps to the empty
/// object; primitives and arrays are rejected.
pub(crate) fn body_object(body: &Value) -> Option<Map<String, Value>> {
    match body {
        Value::Object(map) => Some(map.clone()),
        Value::Null => Some(Map::new()),
        _ => None,
    }
}

fn canonical_json(value: &Value) -> String {
    serde_json::to_string(&sort_keys(value)).unwrap_or_default()
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), sort_keys(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}
