use async_trait::async_trait;
use keel_core::{KeelError, KeelResult, Reason, ToolCall, ToolKind, ToolResult};
use keel_tools::{ExecLimits, Tool, ToolDescriptor};
use reqwest::Method;
use tracing::info;

const MAX_RESPONSE_SIZE: usize = 5 * 1024 * 1024; // 5MB

/// HTTP tool: get, head, post, put, delete.
///
/// The destination host has already been checked against the role's
/// allowlist. Redirects are not followed, since a redirect target would
/// bypass that check.
pub struct HttpTool {
    descriptor: ToolDescriptor,
    client: reqwest::Client,
    block_private: bool,
}

impl HttpTool {
    /// Build the HTTP client. Fails only if TLS cannot be initialised.
    pub fn new() -> KeelResult<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("keel/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| KeelError::Tool(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            descriptor: ToolDescriptor::new(
                ToolKind::Http,
                "Make an HTTP request to an allowlisted host.",
                &["get", "head", "post", "put", "delete"],
            ),
            client,
            block_private: true,
        })
    }

    /// Permit loopback and private-range destinations.
    pub fn allow_private_hosts(mut self) -> Self {
        self.block_private = false;
        self
    }
}

/// Check if a host names a private/internal network address (SSRF prevention).
pub fn is_private_host(host: &str) -> bool {
    let host = host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_ascii_lowercase();
    if host == "localhost" || host.ends_with(".localhost") || host.starts_with("metadata.") {
        return true;
    }
    match host.parse::<std::net::IpAddr>() {
        Ok(std::net::IpAddr::V4(ip)) => {
            ip.is_loopback()
                || ip.is_private()
                || ip.is_link_local()
                || ip.is_unspecified()
                || ip.is_broadcast()
        }
        Ok(std::net::IpAddr::V6(ip)) => {
            ip.is_loopback()
                || ip.is_unspecified()
                // fc00::/7 unique local, fe80::/10 link local
                || (ip.segments()[0] & 0xfe00) == 0xfc00
                || (ip.segments()[0] & 0xffc0) == 0xfe80
        }
        Err(_) => false,
    }
}

#[async_trait]
impl Tool for HttpTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn execute(&self, call: &ToolCall, _limits: &ExecLimits) -> KeelResult<ToolResult> {
        let url = call.str_arg("url");
        let parsed = match reqwest::Url::parse(url) {
            Ok(u) => u,
            Err(e) => {
                return Ok(ToolResult::failure(
                    Reason::permanent(format!("invalid URL '{url}': {e}")),
                    "",
                ))
            }
        };
        if !matches!(parsed.scheme(), "http" | "https") {
            return Ok(ToolResult::failure(
                Reason::permanent(format!(
                    "unsupported scheme '{}'; only http and https are allowed",
                    parsed.scheme()
                )),
                "",
            ));
        }
        if self.block_private && parsed.host_str().is_some_and(is_private_host) {
            return Ok(ToolResult::failure(
                Reason::new(
                    keel_core::ReasonCode::ForbiddenDestination,
                    format!("'{url}' targets a private or internal address"),
                ),
                "",
            ));
        }

        let method = match call.operation.as_str() {
            "get" => Method::GET,
            "head" => Method::HEAD,
            "post" => Method::POST,
            "put" => Method::PUT,
            "delete" => Method::DELETE,
            other => {
                return Ok(ToolResult::failure(
                    Reason::permanent(format!("unsupported HTTP operation '{other}'")),
                    "",
                ))
            }
        };

        info!(url = %url, method = %method, "HTTP request");

        let mut request = self.client.request(method, parsed);
        if let Some(headers) = call.arguments["headers"].as_object() {
            for (key, value) in headers {
                if let Some(v) = value.as_str() {
                    request = request.header(key.as_str(), v);
                }
            }
        }
        match &call.arguments["body"] {
            serde_json::Value::Null => {}
            serde_json::Value::String(s) => request = request.body(s.clone()),
            other => request = request.json(other),
        }

        let mut response = request
            .send()
            .await
            .map_err(|e| KeelError::Tool(format!("HTTP request failed: {e}")))?;
        let status = response.status();

        let mut body = Vec::new();
        let mut truncated = false;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| KeelError::Tool(format!("failed to read response body: {e}")))?
        {
            let room = MAX_RESPONSE_SIZE - body.len();
            if chunk.len() > room {
                body.extend_from_slice(&chunk[..room]);
                truncated = true;
                break;
            }
            body.extend_from_slice(&chunk);
        }
        let mut text = String::from_utf8_lossy(&body).into_owned();
        if truncated {
            text.push_str(&format!("... [truncated at {MAX_RESPONSE_SIZE} bytes]"));
        }

        let code = i32::from(status.as_u16());
        if status.is_success() || status.is_redirection() {
            Ok(ToolResult::success(text).with_exit_code(code))
        } else {
            let reason = if status.is_server_error() || status.as_u16() == 429 {
                Reason::transient(format!("HTTP {status}"))
            } else {
                Reason::permanent(format!("HTTP {status}"))
            };
            Ok(ToolResult::failure(reason, text).with_exit_code(code))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use keel_core::{ReasonCode, Role};
    use serde_json::json;
    use wiremock::matchers::{body_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn call(op: &str, args: serde_json::Value) -> ToolCall {
        ToolCall::new(Role::Admin, ToolKind::Http, op, args)
    }

    fn tool() -> HttpTool {
        HttpTool::new().unwrap().allow_private_hosts()
    }

    #[test]
    fn test_private_host_detection() {
        assert!(is_private_host("localhost"));
        assert!(is_private_host("127.0.0.1"));
        assert!(is_private_host("10.1.2.3"));
        assert!(is_private_host("192.168.0.10"));
        assert!(is_private_host("169.254.169.254"));
        assert!(is_private_host("[::1]"));
        assert!(is_private_host("metadata.google.internal"));
        assert!(!is_private_host("docs.rs"));
        assert!(!is_private_host("8.8.8.8"));
    }

    #[tokio::test]
    async fn test_private_hosts_blocked_by_default() {
        let result = HttpTool::new()
            .unwrap()
            .execute(
                &call("get", json!({"url": "http://127.0.0.1:9/"})),
                &ExecLimits::default(),
            )
            .await
            .unwrap();
        assert_eq!(result.reason().unwrap().code, ReasonCode::ForbiddenDestination);
    }

    #[tokio::test]
    async fn test_get_returns_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/crate"))
            .respond_with(ResponseTemplate::new(200).set_body_string("tokio docs"))
            .mount(&server)
            .await;

        let result = tool()
            .execute(
                &call("get", json!({"url": format!("{}/crate", server.uri())})),
                &ExecLimits::default(),
            )
            .await
            .unwrap();
        assert!(!result.is_error());
        assert_eq!(result.output, "tokio docs");
        assert_eq!(result.exit_code, Some(200));
    }

    #[tokio::test]
    async fn test_post_sends_body_and_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/submit"))
            .and(header("x-token", "abc"))
            .and(body_string("payload"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let result = tool()
            .execute(
                &call(
                    "post",
                    json!({
                        "url": format!("{}/submit", server.uri()),
                        "headers": {"x-token": "abc"},
                        "body": "payload",
                    }),
                ),
                &ExecLimits::default(),
            )
            .await
            .unwrap();
        assert!(!result.is_error());
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let server = MockServer::start().await;
        Mock::given(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(path("/down"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let t = tool();
        let missing = t
            .execute(
                &call("get", json!({"url": format!("{}/missing", server.uri())})),
                &ExecLimits::default(),
            )
            .await
            .unwrap();
        assert_eq!(missing.reason().unwrap().code, ReasonCode::Permanent);

        let down = t
            .execute(
                &call("get", json!({"url": format!("{}/down", server.uri())})),
                &ExecLimits::default(),
            )
            .await
            .unwrap();
        assert_eq!(down.reason().unwrap().code, ReasonCode::Transient);
    }

    #[tokio::test]
    async fn test_redirects_not_followed() {
        let server = MockServer::start().await;
        Mock::given(path("/hop"))
            .respond_with(
                ResponseTemplate::new(302).insert_header("location", "https://attacker.example/"),
            )
            .mount(&server)
            .await;

        let result = tool()
            .execute(
                &call("get", json!({"url": format!("{}/hop", server.uri())})),
                &ExecLimits::default(),
            )
            .await
            .unwrap();
        assert_eq!(result.exit_code, Some(302));
    }

    #[tokio::test]
    async fn test_non_http_scheme_rejected() {
        let result = tool()
            .execute(
                &call("get", json!({"url": "file:///etc/passwd"})),
                &ExecLimits::default(),
            )
            .await
            .unwrap();
        assert!(result.is_error());
    }
}
