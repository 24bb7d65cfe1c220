use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{CaptureOrigin, Header, RequestId, TabId};

/// One captured request/response pair.
///
/// Created on the first filter-matching event for a composite key and
/// mutated by every subsequent event for that key via [`RequestRecord::apply`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub tab: TabId,
    pub request_id: RequestId,
    pub url: String,
    pub method: String,
    pub resource_type: String,
    pub created_at: DateTime<Utc>,
    /// URL of the document that initiated the request, when known.
    pub initiator: Option<String>,
    pub request_headers: Vec<Header>,
    pub response_headers: Vec<Header>,
    pub request_body: Option<String>,
    pub response_body: Option<String>,
    /// Whether `response_body` is base64-encoded rather than text.
    pub body_base64: bool,
    pub status_code: Option<u16>,
    pub status_line: Option<String>,
    pub from_cache: bool,
    pub remote_ip: Option<String>,
    pub completed: bool,
    /// Which capture path last wrote this record.
    pub capture: CaptureOrigin,
}

impl RequestRecord {
    /// Fully-defaulted record for a fresh composite key. Field values are
    /// filled in by the first [`RequestRecord::apply`].
    pub fn new(tab: TabId, request_id: RequestId, created_at: DateTime<Utc>) -> Self {
        Self {
            tab,
            request_id,
            url: String::new(),
            method: String::new(),
            resource_type: String::new(),
            created_at,
            initiator: None,
            request_headers: Vec::new(),
            response_headers: Vec::new(),
            request_body: None,
            response_body: None,
            body_base64: false,
            status_code: None,
            status_line: None,
            from_cache: false,
            remote_ip: None,
            completed: false,
            capture: CaptureOrigin::Interception,
        }
    }

    /// Shallow-merge a patch: every populated patch field overwrites the
    /// corresponding record field, untouched fields survive.
    pub fn apply(&mut self, patch: RecordPatch) {
        if let Some(url) = patch.url {
            self.url = url;
        }
        if let Some(method) = patch.method {
            self.method = method;
        }
        if let Some(resource_type) = patch.resource_type {
            self.resource_type = resource_type;
        }
        if let Some(initiator) = patch.initiator {
            self.initiator = Some(initiator);
        }
        if let Some(request_headers) = patch.request_headers {
            self.request_headers = request_headers;
        }
        if let Some(response_headers) = patch.response_headers {
            self.response_headers = response_headers;
        }
        if let Some(request_body) = patch.request_body {
            self.request_body = Some(request_body);
        }
        if let Some(response_body) = patch.response_body {
            self.response_body = Some(response_body);
        }
        if let Some(body_base64) = patch.body_base64 {
            self.body_base64 = body_base64;
        }
        if let Some(status_code) = patch.status_code {
            self.status_code = Some(status_code);
        }
        if let Some(status_line) = patch.status_line {
            self.status_line = Some(status_line);
        }
        if let Some(from_cache) = patch.from_cache {
            self.from_cache = from_cache;
        }
        if let Some(remote_ip) = patch.remote_ip {
            self.remote_ip = Some(remote_ip);
        }
        if let Some(completed) = patch.completed {
            self.completed = completed;
        }
        if let Some(capture) = patch.capture {
            self.capture = capture;
        }
    }
}

/// Partial update for a [`RequestRecord`]. `None` fields are left untouched
/// on merge; last writer wins per field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordPatch {
    pub url: Option<String>,
    pub method: Option<String>,
    pub resource_type: Option<String>,
    pub initiator: Option<String>,
    pub request_headers: Option<Vec<Header>>,
    pub response_headers: Option<Vec<Header>>,
    pub request_body: Option<String>,
    pub response_body: Option<String>,
    pub body_base64: Option<bool>,
    pub status_code: Option<u16>,
    pub status_line: Option<String>,
    pub from_cache: Option<bool>,
    pub remote_ip: Option<String>,
    pub completed: Option<bool>,
    pub capture: Option<CaptureOrigin>,
}
