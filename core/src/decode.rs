//! Response validation and body decoding.

use serde::de::DeserializeOwned;

use crate::error::{HttpError, InternalError, Result, TransportError};
use crate::http::HttpResponseInfo;
use crate::transport::DataResponse;

/// Apply the status policy: 1xx, 2xx and 3xx pass; everything else becomes
/// an `HttpError` carrying the status and headers.
pub fn validate(response: Option<HttpResponseInfo>) -> Result<HttpResponseInfo> {
    let response = response.ok_or(InternalError::NoResponse)?;
    if response.category().is_success() {
        Ok(response)
    } else {
        Err(HttpError::new(response.status, response.headers).into())
    }
}

/// Decode a JSON body. An empty body decodes from `null`, so unit-like and
/// optional targets succeed without content.
pub fn decode_json<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    let decoded = if body.iter().all(u8::is_ascii_whitespace) {
        serde_json::from_value(serde_json::Value::Null)
    } else {
        serde_json::from_slice(body)
    };
    decoded.map_err(|e| InternalError::CouldNotParse(e.to_string()).into())
}

/// Turn a finished data or upload task into a decoded value.
pub(crate) fn finish_data<T: DeserializeOwned>(result: std::result::Result<DataResponse, TransportError>) -> Result<T> {
    let data = result?;
    validate(data.response)?;
    decode_json(&data.body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NetworkingError;
    use crate::status::StatusCategory;
    use bytes::Bytes;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Item {
        id: u32,
        name: String,
    }

    fn response(status: u16, body: &'static str) -> std::result::Result<DataResponse, TransportError> {
        Ok(DataResponse {
            response: Some(HttpResponseInfo::new(status).with_header("x-request-id", "abc")),
            body: Bytes::from_static(body.as_bytes()),
        })
    }

    #[test]
    fn decodes_success_body() {
        let item: Item = finish_data(response(200, r#"{"id":1,"name":"a"}"#)).unwrap();
        assert_eq!(item, Item { id: 1, name: "a".to_string() });
    }

    #[test]
    fn empty_body_is_success_for_unit() {
        finish_data::<()>(response(204, "")).unwrap();
        assert_eq!(finish_data::<Option<Item>>(response(200, "  ")).unwrap(), None);
    }

    #[test]
    fn empty_body_fails_for_struct() {
        let err = finish_data::<Item>(response(200, "")).unwrap_err();
        assert!(matches!(err, NetworkingError::Internal(InternalError::CouldNotParse(_))));
    }

    #[test]
    fn redirect_status_is_success() {
        let value: serde_json::Value = finish_data(response(304, "")).unwrap();
        assert!(value.is_null());
    }

    #[test]
    fn client_and_server_errors_carry_status_and_headers() {
        let err = finish_data::<Item>(response(404, "missing")).unwrap_err();
        match err {
            NetworkingError::Http(http) => {
                assert_eq!(http.status, 404);
                assert_eq!(http.category, StatusCategory::ClientError);
                assert_eq!(http.headers.get("x-request-id").map(String::as_str), Some("abc"));
            }
            other => panic!("unexpected {other:?}"),
        }
        let err = finish_data::<Item>(response(503, "")).unwrap_err();
        assert_eq!(err.status_code(), Some(503));
    }

    #[test]
    fn unknown_status_is_failure() {
        let err = finish_data::<()>(response(42, "")).unwrap_err();
        assert!(matches!(err, NetworkingError::Http(HttpError { category: StatusCategory::Unknown, .. })));
    }

    #[test]
    fn missing_response_wrapper_fails() {
        let err = finish_data::<()>(Ok(DataResponse::default())).unwrap_err();
        assert_eq!(err, NetworkingError::Internal(InternalError::NoResponse));
    }

    #[test]
    fn transport_errors_are_wrapped() {
        let err = finish_data::<()>(Err(TransportError::new("URLError", -1009, "offline"))).unwrap_err();
        assert_eq!(
            err,
            NetworkingError::Transport(TransportError::new("URLError", -1009, "ignored"))
        );
    }

    #[test]
    fn malformed_body_is_a_parse_error() {
        let err = finish_data::<Item>(response(200, "not json")).unwrap_err();
        assert!(matches!(err, NetworkingError::Internal(InternalError::CouldNotParse(_))));
    }
}
