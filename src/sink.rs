//! Where sessions, snapshots and timelines are sent.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use reqwest::header::{AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE};
use serde_json::{Map, Value};
use tracing::debug;

use crate::encoder::{encode_session_metadata, SessionMetadata};
use crate::error::ReportableError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const BODY_PREVIEW_CHARS: usize = 100;

/// Returned by the collector when a session is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCredentials {
    pub id: String,
    pub key: String,
}

/// The remote end of a profiling session. Payloads are already framed.
pub trait TelemetrySink: Send + Sync {
    fn create_session(
        &self,
        metadata: &SessionMetadata,
    ) -> Result<SessionCredentials, ReportableError>;

    fn upload_snapshot(
        &self,
        session: &SessionCredentials,
        payload: &[u8],
    ) -> Result<(), ReportableError>;

    fn upload_timeline(
        &self,
        session: &SessionCredentials,
        payload: &[u8],
    ) -> Result<(), ReportableError>;

    /// Where a viewer can open the session, if the sink has such a place.
    fn session_url(&self, _session: &SessionCredentials) -> Option<String> {
        None
    }
}

fn preview(body: &str) -> String {
    body.chars().take(BODY_PREVIEW_CHARS).collect()
}

/// Turn a collector response into its JSON object or a reportable error.
pub fn interpret_response(
    uri: &str,
    status: u16,
    body: &str,
) -> Result<Map<String, Value>, ReportableError> {
    let object = match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(object)) => object,
        Ok(_) | Err(_) => {
            return Err(ReportableError::with_detail(
                "Received invalid data from the collector",
                format!("URI: {uri} Body:\n{}", preview(body)),
            ));
        }
    };

    if status != 200 {
        return Err(ReportableError::with_detail(
            "Failed connecting to the collector",
            format!("Error occurred sending data to {uri}, code: {status} msg: {}", Value::Object(object)),
        ));
    }

    if object.get("error").and_then(Value::as_bool).unwrap_or(false) {
        let message = object
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        return Err(ReportableError::new(format!(
            "Error from the collector: {message}"
        )));
    }

    Ok(object)
}

/// Pull the session id and key out of a handshake response.
pub fn credentials_from(object: &Map<String, Value>) -> Result<SessionCredentials, ReportableError> {
    let field = |name: &str| object.get(name).and_then(Value::as_str).map(str::to_string);
    match (field("id"), field("key")) {
        (Some(id), Some(key)) => Ok(SessionCredentials { id, key }),
        _ => Err(ReportableError::with_detail(
            "Received invalid response from the collector, please check logs",
            format!("Invalid response from the collector: {}", Value::Object(object.clone())),
        )),
    }
}

/// Posts gzip payloads to a collector over HTTP.
pub struct HttpSink {
    base_url: String,
    token: String,
    client: reqwest::blocking::Client,
}

impl HttpSink {
    pub fn new(base_url: &str, token: &str) -> Result<Self, ReportableError> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|err| {
                ReportableError::new("Failed to set up the HTTP client").with_cause(err)
            })?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            client,
        })
    }

    fn post(&self, path: &[&str], payload: Vec<u8>) -> Result<Map<String, Value>, ReportableError> {
        let uri = format!("{}/{}", self.base_url, path.join("/"));
        debug!(uri = %uri, bytes = payload.len(), "posting to collector");
        let response = self
            .client
            .post(&uri)
            .header(AUTHORIZATION, format!("token {}", self.token))
            .header(CONTENT_ENCODING, "gzip")
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(payload)
            .send()
            .map_err(|err| {
                ReportableError::with_detail("Failed connecting to the collector", format!("URI: {uri}"))
                    .with_cause(err)
            })?;
        let status = response.status().as_u16();
        let body = response.text().map_err(|err| {
            ReportableError::with_detail("Failed connecting to the collector", format!("URI: {uri}"))
                .with_cause(err)
        })?;
        interpret_response(&uri, status, &body)
    }
}

impl TelemetrySink for HttpSink {
    fn create_session(
        &self,
        metadata: &SessionMetadata,
    ) -> Result<SessionCredentials, ReportableError> {
        let payload = encode_session_metadata(metadata).map_err(|err| {
            ReportableError::new("Failed to encode the session description").with_cause(err)
        })?;
        let object = self.post(&["create"], payload)?;
        credentials_from(&object)
    }

    fn upload_snapshot(
        &self,
        session: &SessionCredentials,
        payload: &[u8],
    ) -> Result<(), ReportableError> {
        self.post(&[session.id.as_str(), session.key.as_str()], payload.to_vec())
            .map(|_| ())
    }

    fn upload_timeline(
        &self,
        session: &SessionCredentials,
        payload: &[u8],
    ) -> Result<(), ReportableError> {
        self.post(
            &[session.id.as_str(), session.key.as_str(), "timeline"],
            payload.to_vec(),
        )
            .map(|_| ())
    }

    fn session_url(&self, session: &SessionCredentials) -> Option<String> {
        Some(format!("{}/{}", self.base_url, session.id))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SinkCall {
    CreateSession(SessionMetadata),
    Snapshot { id: String, payload: Vec<u8> },
    Timeline { id: String, payload: Vec<u8> },
}

#[derive(Default)]
struct MemorySinkState {
    calls: Vec<SinkCall>,
    next_session: u32,
    fail_uploads: bool,
    reject_sessions: bool,
}

/// Records every call instead of sending it anywhere.
#[derive(Default)]
pub struct MemorySink {
    state: Mutex<MemorySinkState>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemorySinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make uploads fail until switched back. Failed uploads are still recorded.
    pub fn set_fail_uploads(&self, fail: bool) {
        self.state().fail_uploads = fail;
    }

    pub fn set_reject_sessions(&self, reject: bool) {
        self.state().reject_sessions = reject;
    }

    pub fn calls(&self) -> Vec<SinkCall> {
        self.state().calls.clone()
    }

    pub fn snapshots(&self) -> Vec<Vec<u8>> {
        self.state()
            .calls
            .iter()
            .filter_map(|call| match call {
                SinkCall::Snapshot { payload, .. } => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn timelines(&self) -> Vec<Vec<u8>> {
        self.state()
            .calls
            .iter()
            .filter_map(|call| match call {
                SinkCall::Timeline { payload, .. } => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    fn upload(&self, call: SinkCall) -> Result<(), ReportableError> {
        let mut state = self.state();
        state.calls.push(call);
        if state.fail_uploads {
            return Err(ReportableError::with_detail(
                "Failed connecting to the collector",
                "memory sink configured to fail",
            ));
        }
        Ok(())
    }
}

impl TelemetrySink for MemorySink {
    fn create_session(
        &self,
        metadata: &SessionMetadata,
    ) -> Result<SessionCredentials, ReportableError> {
        let mut state = self.state();
        state.calls.push(SinkCall::CreateSession(metadata.clone()));
        if state.reject_sessions {
            return Err(ReportableError::new("Error from the collector: invalid token"));
        }
        state.next_session += 1;
        Ok(SessionCredentials {
            id: format!("session-{}", state.next_session),
            key: "memory".to_string(),
        })
    }

    fn upload_snapshot(
        &self,
        session: &SessionCredentials,
        payload: &[u8],
    ) -> Result<(), ReportableError> {
        self.upload(SinkCall::Snapshot {
            id: session.id.clone(),
            payload: payload.to_vec(),
        })
    }

    fn upload_timeline(
        &self,
        session: &SessionCredentials,
        payload: &[u8],
    ) -> Result<(), ReportableError> {
        self.upload(SinkCall::Timeline {
            id: session.id.clone(),
            payload: payload.to_vec(),
        })
    }

    fn session_url(&self, session: &SessionCredentials) -> Option<String> {
        Some(format!("memory://{}", session.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::error::Error;

    use crate::sample::SampleKind;

    const URI: &str = "https://collector.example/create";

    #[test]
    fn test_ok_response_returns_object() {
        let object = interpret_response(URI, 200, r#"{"id":"abc","key":"k1"}"#).unwrap();
        assert_eq!(
            credentials_from(&object).unwrap(),
            SessionCredentials {
                id: "abc".into(),
                key: "k1".into()
            }
        );
    }

    #[test]
    fn test_unparseable_body_is_invalid_data() {
        let body = format!("<html>{}</html>", "x".repeat(300));
        let err = interpret_response(URI, 502, &body).unwrap_err();
        assert_eq!(err.user_message(), "Received invalid data from the collector");
        assert!(err.detail().starts_with(&format!("URI: {URI} Body:\n<html>")));
        // Only the first 100 characters of the body are kept.
        assert_eq!(err.detail().len(), format!("URI: {URI} Body:\n").len() + 100);

        let err = interpret_response(URI, 200, "[1, 2]").unwrap_err();
        assert_eq!(err.user_message(), "Received invalid data from the collector");
    }

    #[test]
    fn test_non_200_status_is_transport_error() {
        let err = interpret_response(URI, 500, r#"{"reason":"overloaded"}"#).unwrap_err();
        assert_eq!(err.user_message(), "Failed connecting to the collector");
        assert!(err.detail().contains("code: 500"));
        assert!(err.detail().contains("overloaded"));
    }

    #[test]
    fn test_error_flag_surfaces_message() {
        let err =
            interpret_response(URI, 200, r#"{"error":true,"message":"token revoked"}"#).unwrap_err();
        assert_eq!(err.user_message(), "Error from the collector: token revoked");
        assert!(err.source().is_none());

        let err = interpret_response(URI, 200, r#"{"error":true}"#).unwrap_err();
        assert_eq!(err.user_message(), "Error from the collector: unknown error");

        assert!(interpret_response(URI, 200, r#"{"error":false}"#).is_ok());
    }

    #[test]
    fn test_handshake_without_credentials_is_invalid() {
        let object = interpret_response(URI, 200, r#"{"id":"abc"}"#).unwrap();
        let err = credentials_from(&object).unwrap_err();
        assert_eq!(
            err.user_message(),
            "Received invalid response from the collector, please check logs"
        );
        assert!(err.detail().contains("\"id\":\"abc\""));
    }

    #[test]
    fn test_http_sink_urls() {
        let sink = HttpSink::new("https://collector.example/", "secret").unwrap();
        let session = SessionCredentials {
            id: "abc".into(),
            key: "k1".into(),
        };
        assert_eq!(
            sink.session_url(&session).as_deref(),
            Some("https://collector.example/abc")
        );
    }

    #[test]
    fn test_memory_sink_records_and_fails_on_demand() {
        let sink = MemorySink::new();
        let metadata = SessionMetadata {
            kind: SampleKind::Wall,
            interval: Duration::from_millis(5),
            files: BTreeMap::new(),
            versions: BTreeMap::new(),
            hardware: None,
            os: None,
            runtime: None,
            timeline: Vec::new(),
            categories: Vec::new(),
        };
        let session = sink.create_session(&metadata).unwrap();
        assert_eq!(session.id, "session-1");
        sink.upload_snapshot(&session, b"one").unwrap();
        sink.set_fail_uploads(true);
        assert!(sink.upload_timeline(&session, b"two").is_err());
        sink.set_fail_uploads(false);

        assert_eq!(sink.snapshots(), vec![b"one".to_vec()]);
        assert_eq!(sink.timelines(), vec![b"two".to_vec()]);
        assert_eq!(sink.calls().len(), 3);

        sink.set_reject_sessions(true);
        assert!(sink.create_session(&metadata).is_err());
    }
}
