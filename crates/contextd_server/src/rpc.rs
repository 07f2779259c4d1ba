//! Transport-agnostic RPC handling.
//!
//! The HTTP listener lives outside this crate. It hands each call over as an
//! [`RpcRequest`] and writes back the [`RpcResponse`]. Bodies are extended
//! JSON (see [`contextd_codec::json`]).

use crate::error::{ContextError, ContextResult};
use crate::manager::ContextManager;
use contextd_codec::json::{from_json, to_json};
use contextd_codec::Value;
use contextd_journal::TransactionRequest;
use serde_json::{json, Value as Json};
use tracing::debug;

const CORS_HEADERS: [(&str, &str); 4] = [
    ("Access-Control-Allow-Origin", "*"),
    ("Access-Control-Allow-Methods", "POST, OPTIONS"),
    ("Access-Control-Allow-Headers", "Content-Type"),
    ("Access-Control-Max-Age", "86400"),
];

/// An inbound call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcRequest {
    /// HTTP method, any case.
    pub method: String,
    /// Request path. A query string is ignored.
    pub path: String,
    /// Raw body text.
    pub body: String,
}

impl RpcRequest {
    /// Creates a request.
    pub fn new(method: impl Into<String>, path: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            body: body.into(),
        }
    }

    /// A `POST` with a body.
    pub fn post(path: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new("POST", path, body)
    }

    /// An `OPTIONS` preflight.
    pub fn options(path: impl Into<String>) -> Self {
        Self::new("OPTIONS", path, "")
    }

    /// The path without its query string.
    pub fn route(&self) -> &str {
        self.path.split('?').next().unwrap_or_default()
    }

    fn method_is(&self, method: &str) -> bool {
        self.method.eq_ignore_ascii_case(method)
    }
}

/// An outbound reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers.
    pub headers: Vec<(String, String)>,
    /// Body text, empty for 204.
    pub body: String,
}

impl RpcResponse {
    fn json(status: u16, body: &Json) -> Self {
        let mut headers = cors_headers();
        headers.push(("Content-Type".into(), "application/json".into()));
        Self {
            status,
            headers,
            body: body.to_string(),
        }
    }

    /// 204 reply to a CORS preflight.
    pub fn preflight() -> Self {
        Self {
            status: 204,
            headers: cors_headers(),
            body: String::new(),
        }
    }

    /// 404 reply.
    pub fn not_found(message: &str) -> Self {
        Self::json(404, &json!({ "error": message }))
    }

    /// 405 reply.
    pub fn method_not_allowed(method: &str) -> Self {
        let mut response = Self::json(405, &json!({ "error": format!("method {method} not allowed") }));
        response.headers.push(("Allow".into(), "POST, OPTIONS".into()));
        response
    }

    /// Looks up a header, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Parses the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the body is not JSON.
    pub fn json_body(&self) -> serde_json::Result<Json> {
        serde_json::from_str(&self.body)
    }
}

fn cors_headers() -> Vec<(String, String)> {
    CORS_HEADERS
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

/// The result of an `exec` call as sent to clients.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecResponse {
    /// The request was committed.
    Ok {
        /// Resulting document with `_id` and `csn`.
        update_object: Value,
    },
    /// The request was rejected.
    Ng {
        /// Why.
        reason: String,
    },
}

impl ExecResponse {
    /// Folds an `exec` result into a reply.
    pub fn from_result(result: ContextResult<Value>) -> Self {
        match result {
            Ok(update_object) => ExecResponse::Ok { update_object },
            Err(e) => ExecResponse::Ng {
                reason: e.to_string(),
            },
        }
    }

    /// Returns true for a committed request.
    pub fn is_ok(&self) -> bool {
        matches!(self, ExecResponse::Ok { .. })
    }

    /// Renders the reply as extended JSON.
    pub fn to_json(&self) -> Json {
        match self {
            ExecResponse::Ok { update_object } => match to_json(update_object) {
                Ok(object) => json!({ "status": "OK", "updateObject": object }),
                Err(e) => json!({ "status": "NG", "reason": e.to_string() }),
            },
            ExecResponse::Ng { reason } => json!({ "status": "NG", "reason": reason }),
        }
    }
}

/// Parses an `exec` body: `{"csn": <observed csn>, "request": {...}}`.
///
/// A missing `csn` means no baseline.
///
/// # Errors
///
/// Returns [`ContextError::InvalidRequest`] if the body is not JSON, the csn
/// is not a non-negative integer, or the request is malformed.
pub fn parse_exec_body(body: &str) -> ContextResult<(u64, TransactionRequest)> {
    let json: Json = serde_json::from_str(body)
        .map_err(|e| ContextError::InvalidRequest(format!("malformed body: {e}")))?;
    let value = from_json(&json).map_err(|e| ContextError::InvalidRequest(e.to_string()))?;

    let csn = match value.get("csn") {
        None | Some(Value::Null) => 0,
        Some(csn) => csn
            .as_integer()
            .and_then(|n| u64::try_from(n).ok())
            .ok_or_else(|| {
                ContextError::InvalidRequest(format!("csn must be a non-negative integer, got {}", csn.type_name()))
            })?,
    };
    let request = value
        .get("request")
        .ok_or_else(|| ContextError::InvalidRequest("missing request".into()))?;
    Ok((csn, TransactionRequest::from_value(request)?))
}

/// Handles one call against a single context.
///
/// `OPTIONS` is answered on any path. `POST` on the exec route runs
/// [`ContextManager::exec`]; rejections are still 200 with an NG body.
pub async fn handle(manager: &ContextManager, request: &RpcRequest) -> RpcResponse {
    if request.method_is("OPTIONS") {
        return RpcResponse::preflight();
    }

    let route = request.route();
    if route != manager.config().exec_path() {
        debug!(database = manager.database(), route, "no such route");
        return RpcResponse::not_found(&format!("no route for {route}"));
    }
    if !request.method_is("POST") {
        return RpcResponse::method_not_allowed(&request.method);
    }

    let result = match parse_exec_body(&request.body) {
        Ok((csn, txn)) => {
            debug!(database = manager.database(), csn, kind = txn.kind.name(), "exec");
            manager.exec(csn, txn).await
        }
        Err(e) => Err(e),
    };
    RpcResponse::json(200, &ExecResponse::from_result(result).to_json())
}

#[cfg(test)]
mod tests {
    use super::*;
    use contextd_journal::TransactionType;

    #[test]
    fn exec_body_parses() {
        let (csn, request) = parse_exec_body(
            r#"{"csn": 3, "request": {"type": "INSERT", "target": "t1", "new": {"x": 1}}}"#,
        )
        .unwrap();
        assert_eq!(csn, 3);
        assert_eq!(request.target, "t1");
        assert_eq!(request.kind.name(), "insert");
    }

    #[test]
    fn exec_body_without_csn_has_no_baseline() {
        let (csn, request) =
            parse_exec_body(r#"{"request": {"type": "begin_import", "target": ""}}"#).unwrap();
        assert_eq!(csn, 0);
        assert_eq!(request.kind, TransactionType::BeginImport);
    }

    #[test]
    fn exec_body_errors() {
        for body in [
            "not json",
            r#"{"csn": -1, "request": {"type": "truncate", "target": ""}}"#,
            r#"{"csn": 1}"#,
            r#"{"csn": 1, "request": {"type": "launch", "target": "t"}}"#,
            r#"{"csn": 1.5, "request": {"type": "truncate", "target": ""}}"#,
        ] {
            assert!(
                matches!(parse_exec_body(body), Err(ContextError::InvalidRequest(_))),
                "{body}"
            );
        }
    }

    #[test]
    fn exec_response_json() {
        let ok = ExecResponse::Ok {
            update_object: Value::map([("csn", Value::Integer(1))]),
        };
        assert!(ok.is_ok());
        assert_eq!(ok.to_json(), json!({"status": "OK", "updateObject": {"csn": 1}}));

        let ng = ExecResponse::from_result(Err(ContextError::NotLeader));
        assert_eq!(ng.to_json(), json!({"status": "NG", "reason": "not leader"}));
    }

    #[test]
    fn routes_ignore_query() {
        let request = RpcRequest::post("/db/exec?trace=1", "");
        assert_eq!(request.route(), "/db/exec");
    }

    #[test]
    fn preflight_headers() {
        let response = RpcResponse::preflight();
        assert_eq!(response.status, 204);
        assert_eq!(response.header("access-control-allow-origin"), Some("*"));
        assert!(response.body.is_empty());
    }
}
