//! Query-string admission parameters

use hyper::header::{HeaderName, HeaderValue};
use url::form_urlencoded;
use url::Url;

use crate::config::MAX_TIMEOUT;
use crate::error::{Error, Result};
use crate::tls::SkipTlsChecks;

/// A header directive from a `request_header[...]` / `response_header[...]`
/// parameter, validated at parse time.
#[derive(Debug, Clone)]
pub struct HeaderDirective {
    pub name: HeaderName,
    pub value: HeaderValue,
}

/// Everything the gateway consumes from the inbound query string.
///
/// Reserved parameters are consumed here and never forwarded; the upstream
/// URL is exactly the `url` parameter, including any query string of its
/// own.
#[derive(Debug, Clone)]
pub struct ProxyParams {
    pub token: Option<String>,
    pub target_url: Url,
    pub timeout_override: Option<u64>,
    pub follow_redirects: bool,
    pub skip_tls_checks: SkipTlsChecks,
    pub request_headers: Vec<HeaderDirective>,
    pub response_headers: Vec<HeaderDirective>,
}

impl ProxyParams {
    /// Parse the raw query string once.
    pub fn parse(query: Option<&str>) -> Result<Self> {
        let query = query.unwrap_or("");

        let mut token = None;
        let mut raw_url: Option<String> = None;
        let mut timeout_override = None;
        let mut follow_redirects = false;
        let mut skip_tls_checks = SkipTlsChecks::default();
        let mut request_headers: Vec<HeaderDirective> = Vec::new();
        let mut response_headers: Vec<HeaderDirective> = Vec::new();

        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "token" => token = Some(value.into_owned()),
                "url" => raw_url = Some(value.into_owned()),
                "timeout" => {
                    // Non-numeric values are ignored; numeric values are
                    // clamped into the permitted per-request range.
                    if let Ok(secs) = value.parse::<u64>() {
                        timeout_override = Some(secs.clamp(1, MAX_TIMEOUT));
                    }
                }
                "follow_redirects" => follow_redirects = parse_bool(&value),
                "skip_tls_checks" => skip_tls_checks = SkipTlsChecks::parse(&value),
                key => {
                    if let Some(name) = bracketed(key, "request_header")
                        .or_else(|| bracketed(key, "request_headers"))
                    {
                        push_directive(&mut request_headers, name, &value)?;
                    } else if let Some(name) = bracketed(key, "response_header") {
                        push_directive(&mut response_headers, name, &value)?;
                    }
                    // Anything else is not ours and not forwarded either:
                    // the upstream URL carries its own query string.
                }
            }
        }

        let raw_url = raw_url.ok_or_else(|| Error::bad_target("Target URL required"))?;
        let target_url = Url::parse(&raw_url)
            .map_err(|e| Error::bad_target(format!("Invalid target URL: {}", e)))?;

        match target_url.scheme() {
            "http" | "https" | "ws" | "wss" => {}
            other => {
                return Err(Error::bad_target(format!(
                    "Unsupported target scheme '{}'",
                    other
                )));
            }
        }
        if target_url.host_str().is_none() {
            return Err(Error::bad_target("Target URL has no host"));
        }

        Ok(Self {
            token,
            target_url,
            timeout_override,
            follow_redirects,
            skip_tls_checks,
            request_headers,
            response_headers,
        })
    }

    /// Effective timeout in seconds: the per-request override, else the
    /// instance default.
    pub fn effective_timeout(&self, instance_default: u64) -> u64 {
        self.timeout_override.unwrap_or(instance_default)
    }
}

/// `{true, 1, yes, on}` case-insensitive; everything else is false.
fn parse_bool(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

/// Extract NAME from `prefix[NAME]`.
fn bracketed<'a>(key: &'a str, prefix: &str) -> Option<&'a str> {
    key.strip_prefix(prefix)?
        .strip_prefix('[')?
        .strip_suffix(']')
}

/// Append a header directive, replacing any earlier entry with the same
/// case-insensitive name (last occurrence wins, first position kept).
fn push_directive(directives: &mut Vec<HeaderDirective>, name: &str, value: &str) -> Result<()> {
    let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| Error::bad_target(format!("Invalid header name '{}'", name)))?;
    let value = HeaderValue::from_str(value)
        .map_err(|_| Error::bad_target(format!("Invalid value for header '{}'", name)))?;

    if let Some(existing) = directives.iter_mut().find(|d| d.name == name) {
        existing.value = value;
    } else {
        directives.push(HeaderDirective { name, value });
    }
    Ok(())
}
