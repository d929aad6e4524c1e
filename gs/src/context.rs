//! Diagnostic context carried across task hand-offs
//!
//! A context is captured when a job is submitted and travels with it: to the
//! worker that runs it and to the retry timer that re-admits it. The receiver
//! enters [`DiagnosticContext::span`] for the duration of its work, so log
//! lines emitted there carry the caller's correlation data and nothing leaks
//! into the next job the task picks up.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{Span, info_span};
use uuid::Uuid;

use crate::domain::{JobId, RequestId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticContext {
    session: Uuid,
    request: Option<RequestId>,
    #[serde(default)]
    fields: BTreeMap<String, String>,
}

impl Default for DiagnosticContext {
    fn default() -> Self {
        Self::new()
    }
}

impl DiagnosticContext {
    /// Fresh context with a new time-ordered session id
    pub fn new() -> Self {
        Self {
            session: Uuid::now_v7(),
            request: None,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_request(mut self, request: RequestId) -> Self {
        self.request = Some(request);
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn session(&self) -> Uuid {
        self.session
    }

    pub fn request(&self) -> Option<RequestId> {
        self.request
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }

    /// Span scoping work done on behalf of `job` in `scheduler`
    pub fn span(&self, scheduler: &str, job: JobId) -> Span {
        info_span!(
            "job",
            scheduler,
            %job,
            session = %self.session,
            request = ?self.request,
            fields = ?self.fields,
        )
    }
}
