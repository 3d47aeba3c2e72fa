//! Framework-neutral view of an incoming request.

use actix_web::HttpRequest;
use percent_encoding::percent_decode_str;

/// Attributes of a request the scanner and the rate limiter look at
#[derive(Debug, Clone, Default)]
pub struct RequestFacts {
    pub method: String,
    /// Raw (still encoded) path
    pub path: String,
    /// Raw query string without the leading `?`
    pub query: String,
    /// Header names are lowercase
    pub headers: Vec<(String, String)>,
    pub client_ip: String,
    /// Authenticated user id, when the upstream auth layer supplied one
    pub user_id: Option<String>,
}

impl RequestFacts {
    /// Build facts from an actix request.
    ///
    /// The client IP is the first `X-Forwarded-For` hop when
    /// `trust_forwarded_for` is set, otherwise the peer address. The user id
    /// is read from `user_header` only when one is given.
    pub fn from_http(req: &HttpRequest, trust_forwarded_for: bool, user_header: Option<&str>) -> Self {
        let headers: Vec<(String, String)> = req
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();

        let forwarded = if trust_forwarded_for {
            req.headers()
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        } else {
            None
        };
        let client_ip = forwarded
            .or_else(|| req.peer_addr().map(|addr| addr.ip().to_string()))
            .unwrap_or_else(|| "unknown".to_string());

        let user_id = user_header
            .and_then(|name| req.headers().get(name))
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        Self {
            method: req.method().as_str().to_string(),
            path: req.path().to_string(),
            query: req.query_string().to_string(),
            headers,
            client_ip,
            user_id,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn decoded_path(&self) -> String {
        percent_decode_str(&self.path).decode_utf8_lossy().into_owned()
    }

    /// Decoded path with `;` segment parameters removed, the form routers
    /// dispatch on
    pub fn route_path(&self) -> String {
        route_path(&self.path)
    }

    /// Decoded query parameters in order of appearance
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        url::form_urlencoded::parse(self.query.as_bytes())
            .into_owned()
            .collect()
    }

    pub fn query_param(&self, name: &str) -> Option<String> {
        url::form_urlencoded::parse(self.query.as_bytes())
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    /// Length of path plus query in bytes
    pub fn uri_len(&self) -> usize {
        if self.query.is_empty() {
            self.path.len()
        } else {
            self.path.len() + 1 + self.query.len()
        }
    }
}

/// Percent-decode `raw` and drop `;` parameters from every segment
pub fn route_path(raw: &str) -> String {
    percent_decode_str(raw)
        .decode_utf8_lossy()
        .split('/')
        .map(|segment| segment.split(';').next().unwrap_or_default())
        .collect::<Vec<_>>()
        .join("/")
}

/// True when `raw` has dot segments, `;` parameters or backslashes once
/// decoded, i.e. the path a backend routes on may differ from the one seen
pub fn is_ambiguous_path(raw: &str) -> bool {
    let decoded = percent_decode_str(raw).decode_utf8_lossy();
    decoded.contains(';')
        || decoded.contains('\\')
        || decoded.split('/').any(|segment| segment == "." || segment == "..")
}
