//! Origin policy: which browser origins may receive CORS headers.
//!
//! Evaluated in order:
//!
//! 1. No `Origin` header → allowed (curl, native apps, server-to-server)
//! 2. Exact match with a configured development origin → allowed
//! 3. `https://<label>.ngrok-free.app`, label of `[a-z0-9-]+`, any case → allowed
//! 4. Anything else → denied

use regex::{Regex, RegexBuilder};

/// Pattern for ngrok tunnel origins. Anchored on both ends so suffixes such as
/// `.ngrok-free.app.attacker.com` never match.
const TUNNEL_ORIGIN_PATTERN: &str = r"^https://[a-z0-9-]+\.ngrok-free\.app$";

/// Result of evaluating a request's `Origin` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OriginDecision {
    /// No `Origin` header; nothing to reflect.
    Absent,
    /// Allowed; the origin is reflected verbatim.
    Allowed(String),
    Denied,
}

impl OriginDecision {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, OriginDecision::Denied)
    }

    /// Origin to put in `Access-Control-Allow-Origin`.
    pub fn reflected_origin(&self) -> Option<&str> {
        match self {
            OriginDecision::Allowed(origin) => Some(origin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OriginPolicy {
    exact: Vec<String>,
    tunnel: Regex,
}

impl OriginPolicy {
    /// # Errors
    ///
    /// Fails only if the built-in tunnel pattern does not compile.
    pub fn new<I, T>(exact: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let tunnel = RegexBuilder::new(TUNNEL_ORIGIN_PATTERN)
            .case_insensitive(true)
            .build()?;

        Ok(Self {
            exact: exact.into_iter().map(Into::into).collect(),
            tunnel,
        })
    }

    pub fn evaluate(&self, origin: Option<&str>) -> OriginDecision {
        let Some(origin) = origin else {
            return OriginDecision::Absent;
        };

        if self.exact.iter().any(|allowed| allowed == origin) || self.tunnel.is_match(origin) {
            OriginDecision::Allowed(origin.to_string())
        } else {
            OriginDecision::Denied
        }
    }

    pub fn is_allowed(&self, origin: Option<&str>) -> bool {
        self.evaluate(origin).is_allowed()
    }
}
