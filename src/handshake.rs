use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::SystemTime;

use crate::transport::ConnectionMeta;

/// Immutable snapshot of the request that established the connection,
/// captured when a socket is constructed. One per socket, read-only
/// afterwards.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub headers: http::HeaderMap,
    /// Time of the socket creation.
    pub issued: SystemTime,
    pub address: Option<SocketAddr>,
    /// Whether the request came from another origin.
    pub xdomain: bool,
    /// Whether the connection is secure.
    pub secure: bool,
    /// The request url.
    pub url: String,
    /// The url query merged with the query carried by the namespace
    /// connection, the latter taking precedence.
    pub query: HashMap<String, String>,
}

impl Handshake {
    pub(crate) fn new(meta: &ConnectionMeta, ns_query: &HashMap<String, String>) -> Self {
        let mut query = meta
            .uri
            .query()
            .map(parse_query)
            .unwrap_or_default();
        query.extend(ns_query.iter().map(|(k, v)| (k.clone(), v.clone())));

        Self {
            headers: meta.headers.clone(),
            issued: SystemTime::now(),
            address: meta.remote_addr,
            xdomain: meta.headers.contains_key(http::header::ORIGIN),
            secure: meta.secure,
            url: meta.uri.to_string(),
            query,
        }
    }
}

/// Parse an `a=1&b=2` query string. Empty segments are skipped, a missing
/// `=` yields an empty value.
pub(crate) fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}
