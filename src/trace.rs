use http::HeaderMap;

/// Header the serverless front end sets on every inbound request.
pub const TRACE_CONTEXT_HEADER: &str = "X-Cloud-Trace-Context";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TraceError {
    #[error("X-Cloud-Trace-Context header is not set")]
    MissingHeader,
}

/// Format the fully-qualified trace name Cloud Logging expects.
pub fn trace_id(project_id: &str, trace: &str) -> String {
    format!("projects/{}/traces/{}", project_id, trace)
}

/// Derive the trace name for a request from its `X-Cloud-Trace-Context`
/// header (`TRACE_ID/SPAN_ID;o=OPTIONS`). Only the part before the first
/// `/` is used; a value without `/` is used whole. The value is not
/// validated, and bytes that are not UTF-8 are replaced rather than
/// rejected.
pub fn extract(project_id: &str, headers: &HeaderMap) -> Result<String, TraceError> {
    let raw = headers.get(TRACE_CONTEXT_HEADER).ok_or(TraceError::MissingHeader)?;
    let value = String::from_utf8_lossy(raw.as_bytes());

    if value.is_empty() {
        return Err(TraceError::MissingHeader);
    }

    let trace = value.split('/').next().unwrap_or_default();
    Ok(trace_id(project_id, trace))
}
