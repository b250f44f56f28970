//! Multipart batch framing and response demultiplexing.
//!
//! The envelope is a single `POST .../?comp=batch` whose `multipart/mixed`
//! body carries one `application/http` part per sub-request. Sub-request
//! bodies are not framed; this protocol covers header/metadata-only batched
//! operations such as batched deletes.

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, Request, Response, StatusCode};
use pipesign_core::{Error, Result};

/// Headers owned by the envelope; they never appear on a framed part.
const ENVELOPE_OWNED: [&str; 3] = [
    crate::constants::X_MS_VERSION,
    "content-type",
    "content-transfer-encoding",
];

/// One demultiplexed part of a batch response.
#[derive(Debug, Clone)]
pub struct SubResponse {
    /// Status of this sub-request.
    pub status: StatusCode,
    /// Headers the service returned for this sub-request.
    pub headers: HeaderMap,
    /// Body of this part, usually an error payload on failure.
    pub body: Bytes,
}

impl SubResponse {
    /// Whether this sub-request succeeded.
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Terminal result of one batch call.
///
/// Partial results are never dropped: a single failing item moves the whole
/// call to `PartialFailure` with both maps populated. Envelope-level
/// transport failures propagate as plain errors before any per-item result
/// exists.
#[derive(Debug)]
pub enum BatchOutcome {
    /// Every sub-request succeeded. Entries keep submission order.
    AllSucceeded(Vec<(String, SubResponse)>),
    /// At least one sub-request failed.
    PartialFailure {
        /// Successful items, keyed by caller identity, in submission order.
        succeeded: Vec<(String, SubResponse)>,
        /// Failed items, keyed by caller identity, in submission order.
        failed: Vec<(String, SubResponse)>,
    },
}

/// Serialize signed sub-requests into one multipart body.
///
/// Each part carries its Content-ID (the 0-based submission index), the
/// request line, and the sub-request's own headers with the envelope-owned
/// ones stripped.
pub(crate) fn frame_envelope(boundary: &str, subs: &[Request<Bytes>]) -> Result<String> {
    let mut s = String::with_capacity(256 * subs.len());

    for (idx, req) in subs.iter().enumerate() {
        s.push_str(&format!("--{boundary}\r\n"));
        s.push_str("Content-Type: application/http\r\n");
        s.push_str("Content-Transfer-Encoding: binary\r\n");
        s.push_str(&format!("Content-ID: {idx}\r\n\r\n"));

        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|paq| paq.as_str())
            .unwrap_or("/");
        s.push_str(&format!("{} {} HTTP/1.1\r\n", req.method(), path_and_query));

        for (name, value) in req.headers() {
            if ENVELOPE_OWNED.contains(&name.as_str()) {
                continue;
            }
            s.push_str(&format!("{}: {}\r\n", name, value.to_str()?));
        }
        s.push_str("\r\n");
    }
    s.push_str(&format!("--{boundary}--\r\n"));

    Ok(s)
}

/// Demultiplex a `multipart/mixed` batch response into per-part responses
/// keyed by Content-ID.
///
/// A part without a Content-ID is a whole-batch failure answer; it
/// surfaces as an envelope-level service error.
pub(crate) fn parse_envelope_response(
    resp: &Response<Bytes>,
) -> Result<Vec<(usize, SubResponse)>> {
    let content_type = resp
        .headers()
        .get(CONTENT_TYPE)
        .ok_or_else(|| Error::unexpected("batch response has no content-type"))?
        .to_str()?;
    let boundary = content_type
        .split("boundary=")
        .nth(1)
        .map(|b| b.trim_matches('"'))
        .ok_or_else(|| {
            Error::unexpected(format!(
                "batch response content-type has no boundary: {content_type}"
            ))
        })?;

    let body = std::str::from_utf8(resp.body())
        .map_err(|e| Error::unexpected("batch response body is not utf-8").with_source(e))?;

    let delimiter = format!("--{boundary}");
    let mut parts = Vec::new();

    for chunk in body.split(delimiter.as_str()).skip(1) {
        // The terminator renders as an empty "--" chunk.
        if chunk.starts_with("--") {
            break;
        }
        let chunk = chunk.trim_start_matches("\r\n");

        let (part_headers, payload) = chunk
            .split_once("\r\n\r\n")
            .ok_or_else(|| Error::unexpected("batch response part has no header section"))?;

        let content_id = part_headers
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("content-id")
                    .then(|| value.trim().parse::<usize>().ok())
                    .flatten()
            });

        let sub = parse_sub_response(payload)?;
        let Some(content_id) = content_id else {
            // The service answers a rejected envelope with one id-less part.
            return Err(Error::service(
                sub.status,
                format!(
                    "batch envelope rejected: {}",
                    String::from_utf8_lossy(&sub.body)
                ),
            ));
        };

        parts.push((content_id, sub));
    }

    Ok(parts)
}

/// Parse one embedded `HTTP/1.1` response: status line, headers, body.
fn parse_sub_response(payload: &str) -> Result<SubResponse> {
    let (status_line, rest) = payload
        .split_once("\r\n")
        .ok_or_else(|| Error::unexpected("batch response part has no status line"))?;

    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| {
            Error::unexpected(format!("malformed status line in batch part: {status_line}"))
        })?;

    let (header_block, body) = match rest.split_once("\r\n\r\n") {
        Some((headers, body)) => (headers, body),
        // A part may end right after its headers.
        None => (rest.trim_end_matches("\r\n"), ""),
    };

    let mut headers = HeaderMap::new();
    for line in header_block.lines().filter(|l| !l.is_empty()) {
        let (name, value) = line.split_once(':').ok_or_else(|| {
            Error::unexpected(format!("malformed header in batch part: {line}"))
        })?;
        headers.insert(
            name.trim().parse::<http::header::HeaderName>()?,
            value.trim().parse::<http::HeaderValue>()?,
        );
    }

    Ok(SubResponse {
        status,
        headers,
        body: Bytes::copy_from_slice(body.trim_end_matches("\r\n").as_bytes()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sub_request(path: &str) -> Request<Bytes> {
        Request::delete(format!("https://account.blob.core.windows.net{path}"))
            .header("x-ms-date", "Tue, 01 Mar 2022 08:12:34 GMT")
            .header("x-ms-version", "2019-12-12")
            .header("authorization", "SharedKey account:c2ln")
            .body(Bytes::new())
            .unwrap()
    }

    #[test]
    fn test_frame_envelope_layout() {
        let subs = vec![sub_request("/container/a"), sub_request("/container/b")];
        let body = frame_envelope("batch_d1a4d218", &subs).unwrap();

        assert_eq!(body.matches("--batch_d1a4d218\r\n").count(), 2);
        assert!(body.ends_with("--batch_d1a4d218--\r\n"));
        assert!(body.contains("Content-ID: 0\r\n"));
        assert!(body.contains("Content-ID: 1\r\n"));
        assert!(body.contains("DELETE /container/a HTTP/1.1\r\n"));
        assert!(body.contains("DELETE /container/b HTTP/1.1\r\n"));
        assert!(body.contains("authorization: SharedKey account:c2ln\r\n"));
        // the envelope owns the version header
        assert!(!body.contains("x-ms-version"));
    }

    fn canned_response(body: &str) -> Response<Bytes> {
        Response::builder()
            .status(StatusCode::ACCEPTED)
            .header(
                CONTENT_TYPE,
                "multipart/mixed; boundary=batchresponse_d1a4d218",
            )
            .body(Bytes::copy_from_slice(body.as_bytes()))
            .unwrap()
    }

    #[test]
    fn test_parse_envelope_response_with_mixed_results() {
        let body = "--batchresponse_d1a4d218\r\n\
                    Content-Type: application/http\r\n\
                    Content-ID: 0\r\n\
                    \r\n\
                    HTTP/1.1 202 Accepted\r\n\
                    x-ms-request-id: r0\r\n\
                    \r\n\
                    --batchresponse_d1a4d218\r\n\
                    Content-Type: application/http\r\n\
                    Content-ID: 1\r\n\
                    \r\n\
                    HTTP/1.1 404 The specified blob does not exist.\r\n\
                    x-ms-request-id: r1\r\n\
                    \r\n\
                    BlobNotFound\r\n\
                    --batchresponse_d1a4d218\r\n\
                    Content-Type: application/http\r\n\
                    Content-ID: 2\r\n\
                    \r\n\
                    HTTP/1.1 202 Accepted\r\n\
                    \r\n\
                    --batchresponse_d1a4d218--\r\n";

        let parts = parse_envelope_response(&canned_response(body)).unwrap();
        assert_eq!(parts.len(), 3);

        assert_eq!(parts[0].0, 0);
        assert_eq!(parts[0].1.status, StatusCode::ACCEPTED);
        assert_eq!(parts[0].1.headers.get("x-ms-request-id").unwrap(), "r0");

        assert_eq!(parts[1].0, 1);
        assert_eq!(parts[1].1.status, StatusCode::NOT_FOUND);
        assert_eq!(parts[1].1.body, Bytes::from_static(b"BlobNotFound"));

        assert_eq!(parts[2].0, 2);
        assert!(parts[2].1.is_success());
    }

    #[test]
    fn test_part_without_content_id_is_an_envelope_error() {
        let body = "--batchresponse_d1a4d218\r\n\
                    Content-Type: application/http\r\n\
                    \r\n\
                    HTTP/1.1 403 Server failed to authenticate the request.\r\n\
                    \r\n\
                    AuthenticationFailed\r\n\
                    --batchresponse_d1a4d218--\r\n";

        let err = parse_envelope_response(&canned_response(body)).unwrap_err();
        assert_eq!(err.status(), Some(StatusCode::FORBIDDEN));
    }

    #[test]
    fn test_missing_boundary_is_rejected() {
        let resp = Response::builder()
            .status(StatusCode::ACCEPTED)
            .header(CONTENT_TYPE, "application/xml")
            .body(Bytes::new())
            .unwrap();

        assert!(parse_envelope_response(&resp).is_err());
    }
}
