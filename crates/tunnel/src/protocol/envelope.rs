//! Request and response envelopes carried through the tunnel.
//!
//! An envelope is framed as `[u32 head length][serialized head][raw body]`. Only the head goes
//! through the [`Serializer`] collaborator, the body is never re-encoded.

use crate::ensure;
use crate::protocol::{CodecError, ProtocolError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, Request, Response, StatusCode, Uri};
use http_body_util::Full;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Header carrying the route version of a tunneled request.
pub const API_VERSION_HEADER: &str = "api-version";

const HEAD_LENGTH_SIZE: usize = 4;

/// Encodes and decodes envelope heads to bytes.
///
/// Any format with a stable byte round trip works.
pub trait Serializer: Send + Sync + 'static {
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError>;

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, ProtocolError>;
}

/// JSON heads through `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(CodecError::serialize)
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, ProtocolError> {
        serde_json::from_slice(bytes).map_err(ProtocolError::malformed_envelope)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHead {
    pub method: String,
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    /// Topic the reply is published to in event mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseHead {
    pub status: u16,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
}

/// A head plus its raw body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope<H> {
    pub head: H,
    pub body: Bytes,
}

pub type RequestEnvelope = Envelope<RequestHead>;
pub type ResponseEnvelope = Envelope<ResponseHead>;

impl<H> Envelope<H>
where
    H: Serialize + DeserializeOwned,
{
    pub fn new(head: H, body: Bytes) -> Self {
        Self { head, body }
    }

    pub fn encode<S: Serializer>(&self, serializer: &S) -> Result<Bytes, CodecError> {
        let head = serializer.serialize(&self.head)?;
        let head_len = u32::try_from(head.len()).map_err(CodecError::serialize)?;

        let mut buf = BytesMut::with_capacity(HEAD_LENGTH_SIZE + head.len() + self.body.len());
        buf.put_u32(head_len);
        buf.put_slice(&head);
        buf.put_slice(&self.body);
        Ok(buf.freeze())
    }

    pub fn decode<S: Serializer>(mut bytes: Bytes, serializer: &S) -> Result<Self, ProtocolError> {
        ensure!(bytes.len() >= HEAD_LENGTH_SIZE, ProtocolError::malformed_envelope("missing head length"));
        let head_len = bytes.get_u32() as usize;
        ensure!(
            bytes.len() >= head_len,
            ProtocolError::malformed_envelope(format!("head length {head_len} exceeds {} remaining bytes", bytes.len()))
        );

        let head_bytes = bytes.split_to(head_len);
        let head = serializer.deserialize(&head_bytes)?;
        Ok(Self { head, body: bytes })
    }
}

impl RequestEnvelope {
    /// Captures an outbound request, the body is taken as is.
    pub fn from_request(request: Request<Bytes>, reply_to: Option<String>) -> Self {
        let (parts, body) = request.into_parts();
        let version = parts.headers.get(API_VERSION_HEADER).and_then(|v| v.to_str().ok()).map(str::to_string);
        let head = RequestHead {
            method: parts.method.to_string(),
            uri: parts.uri.to_string(),
            version,
            headers: header_pairs(&parts.headers),
            reply_to,
        };
        Self { head, body }
    }

    /// Builds the synthetic request handed to the local http handler.
    pub fn into_request(self) -> Result<Request<Full<Bytes>>, ProtocolError> {
        let method = Method::from_bytes(self.head.method.as_bytes()).map_err(ProtocolError::malformed_envelope)?;
        let uri = self.head.uri.parse::<Uri>().map_err(ProtocolError::malformed_envelope)?;
        let mut headers = header_map(self.head.headers)?;

        if let Some(version) = self.head.version {
            if !headers.contains_key(API_VERSION_HEADER) {
                let value = HeaderValue::from_str(&version).map_err(ProtocolError::malformed_envelope)?;
                headers.insert(API_VERSION_HEADER, value);
            }
        }

        let mut request = Request::new(Full::new(self.body));
        *request.method_mut() = method;
        *request.uri_mut() = uri;
        *request.headers_mut() = headers;
        Ok(request)
    }
}

impl ResponseEnvelope {
    pub fn from_response(response: Response<Bytes>) -> Self {
        let (parts, body) = response.into_parts();
        let head = ResponseHead { status: parts.status.as_u16(), headers: header_pairs(&parts.headers) };
        Self { head, body }
    }

    pub fn into_response(self) -> Result<Response<Bytes>, ProtocolError> {
        let status = StatusCode::from_u16(self.head.status).map_err(ProtocolError::malformed_envelope)?;
        let headers = header_map(self.head.headers)?;

        let mut response = Response::new(self.body);
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| match value.to_str() {
            Ok(value) => Some((name.as_str().to_string(), value.to_string())),
            Err(_) => {
                trace!(header = %name, "skip non-visible-ascii header value");
                None
            }
        })
        .collect()
}

fn header_map(pairs: Vec<(String, String)>) -> Result<HeaderMap, ProtocolError> {
    let mut headers = HeaderMap::with_capacity(pairs.len());
    for (name, value) in pairs {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(ProtocolError::malformed_envelope)?;
        let value = HeaderValue::from_str(&value).map_err(ProtocolError::malformed_envelope)?;
        headers.append(name, value);
    }
    Ok(headers)
}
