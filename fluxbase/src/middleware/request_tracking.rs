//! Request tracking layers
//!
//! Request ID generation and propagation plus masking of credential
//! headers in logs. The request id is returned in `X-Request-Id` and
//! logged alongside any error.

use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    sensitive_headers::SetSensitiveRequestHeadersLayer,
};

/// Headers that must never appear in logs
pub const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "cookie",
    "set-cookie",
    "apikey",
    "x-service-key",
    "x-csrf-token",
];

/// Layer generating `x-request-id` for requests that lack one
pub fn request_id_layer() -> SetRequestIdLayer<MakeRequestUuid> {
    SetRequestIdLayer::x_request_id(MakeRequestUuid)
}

/// Layer copying `x-request-id` onto the response
pub fn request_id_propagation_layer() -> PropagateRequestIdLayer {
    PropagateRequestIdLayer::x_request_id()
}

/// Layer masking credential headers before tracing sees them
pub fn sensitive_headers_layer() -> SetSensitiveRequestHeadersLayer {
    let headers = SENSITIVE_HEADERS
        .iter()
        .map(|h| h.parse().expect("valid header name"))
        .collect::<Vec<_>>();

    SetSensitiveRequestHeadersLayer::new(headers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sensitive_headers_cover_credentials() {
        assert!(SENSITIVE_HEADERS.contains(&"authorization"));
        assert!(SENSITIVE_HEADERS.contains(&"apikey"));
        assert!(SENSITIVE_HEADERS.contains(&"x-service-key"));
        assert!(SENSITIVE_HEADERS.contains(&"cookie"));
    }

    #[test]
    fn test_layers_construct() {
        let _ = request_id_layer();
        let _ = request_id_propagation_layer();
        let _ = sensitive_headers_layer();
    }
}
