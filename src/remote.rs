use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("unsupported scheme in `{url}`, only `{expected}://` references are accepted")]
pub struct UnsupportedSchemeError {
    pub url: String,
    pub expected: String,
}

// A `<scheme>://<bucket>/<key>` reference to an object in remote storage.
// `object` carries no leading slash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteUrl {
    pub bucket: String,
    pub object: String,
}

fn url_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([a-z0-9]+)://([^/]+)(?:/(.*))?$").unwrap())
}

impl RemoteUrl {
    // `Ok(None)` when `s` does not look like a url at all; such strings are
    // plain scalars to the callers. A url with the wrong scheme is an error.
    pub fn parse(s: &str, expected_scheme: &str) -> Result<Option<RemoteUrl>, UnsupportedSchemeError> {
        let Some(caps) = url_regex().captures(s) else {
            return Ok(None);
        };
        if &caps[1] != expected_scheme {
            return Err(UnsupportedSchemeError {
                url: s.to_string(),
                expected: expected_scheme.to_string(),
            });
        }
        Ok(Some(RemoteUrl {
            bucket: caps[2].to_string(),
            object: caps.get(3).map(|m| m.as_str()).unwrap_or("").to_string(),
        }))
    }
}
