use axum::http::HeaderMap;

/// Identity shared by every client that arrives without forwarding headers.
pub const UNKNOWN_IDENTITY: &str = "unknown";

/// Pick the client identity used for de-duplication.
///
/// Headers are consulted in priority order: the first hop of
/// `x-forwarded-for`, then `x-client-ip`, then `x-real-ip`. Nothing is
/// validated; whatever the proxy put there is the identity.
pub fn resolve_identity(headers: &HeaderMap) -> String {
    header_str(headers, "x-forwarded-for")
        .and_then(|v| non_empty(v.split(',').next().unwrap_or(v)))
        .or_else(|| header_str(headers, "x-client-ip").and_then(non_empty))
        .or_else(|| header_str(headers, "x-real-ip").and_then(non_empty))
        .unwrap_or_else(|| UNKNOWN_IDENTITY.to_string())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
