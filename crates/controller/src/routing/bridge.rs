//! Protocol bridge: carries the canary tag across the edge-HTTP to
//! internal-gRPC hop without losing or mangling it.
//!
//! Inbound, the tag is extracted and validated once, at the first hop;
//! a value that fails validation is treated as absent so the request
//! proceeds untagged to stable instead of being rejected. Outbound, the
//! already-validated tag is re-attached as gRPC metadata under the same
//! well-known key, so both sides of the hop resolve the same canary id.

use crate::routing::tag::{Tag, CANARY_TAG_FIELD};
use http::HeaderMap;
use tonic::metadata::{Ascii, MetadataMap, MetadataValue};
use tonic::service::Interceptor;
use tonic::Request;
use tracing::debug;

/// Extracts the tag from edge HTTP headers. Malformed values are dropped,
/// not propagated.
#[must_use]
pub fn tag_from_headers(headers: &HeaderMap) -> Tag {
    let raw = headers
        .get(CANARY_TAG_FIELD)
        .and_then(|value| value.to_str().ok());
    let tag = Tag::parse(raw);
    if tag.id().is_none() {
        if let Some(raw) = raw {
            if !raw.is_empty() {
                debug!(field = CANARY_TAG_FIELD, value = %raw, "Dropping malformed canary tag");
            }
        }
    }
    tag
}

/// Extracts the tag on the inbound side of the internal gRPC hop.
#[must_use]
pub fn tag_from_metadata(metadata: &MetadataMap) -> Tag {
    Tag::parse(
        metadata
            .get(CANARY_TAG_FIELD)
            .and_then(|value| value.to_str().ok()),
    )
}

/// Attaches a validated tag to an outbound gRPC request. A `Tag::NONE`
/// leaves the request untouched.
pub fn attach_tag<T>(request: &mut Request<T>, tag: Tag) {
    if let Some(id) = tag.id() {
        // The id serializes to ASCII digits, so this cannot fail; guard
        // anyway rather than panic inside the request path.
        if let Ok(value) = id.to_string().parse::<MetadataValue<Ascii>>() {
            request.metadata_mut().insert(CANARY_TAG_FIELD, value);
        }
    }
}

/// Tonic interceptor that stamps every outbound request on a channel with
/// the tag extracted at the edge. Built per-request by the hop that owns
/// the inbound HTTP side.
#[derive(Debug, Clone, Copy)]
pub struct CanaryTagInterceptor {
    tag: Tag,
}

impl CanaryTagInterceptor {
    #[must_use]
    pub fn new(tag: Tag) -> Self {
        Self { tag }
    }
}

impl Interceptor for CanaryTagInterceptor {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, tonic::Status> {
        attach_tag(&mut request, self.tag);
        Ok(request)
    }
}
