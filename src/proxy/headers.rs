use hyper::header::{HeaderMap, HeaderName, CONTENT_LENGTH};

/// Connection-scoped headers that must never cross the proxy.
pub const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop_header(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|hop| hop.eq_ignore_ascii_case(name))
}

/// Drop every value of every hop-by-hop header.
pub fn remove_hop_by_hop_headers(headers: &mut HeaderMap) {
    let hop_by_hop: Vec<HeaderName> = headers
        .keys()
        .filter(|name| is_hop_by_hop_header(name.as_str()))
        .cloned()
        .collect();
    for name in hop_by_hop {
        headers.remove(name);
    }
}

/// Headers to send on the next leg. Hop-by-hop headers are dropped, and so is
/// `Content-Length`: the body may have been truncated to the capture limit, so
/// the length is recomputed from what is actually sent.
pub fn forwardable_headers(source: &HeaderMap) -> HeaderMap {
    let mut headers = source.clone();
    remove_hop_by_hop_headers(&mut headers);
    headers.remove(CONTENT_LENGTH);
    headers
}
