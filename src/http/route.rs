//! Route key derivation
//!
//! Requests share a rate limit when they have the same method and path
//! template. Snowflake ids collapse to a placeholder, except the ids that
//! directly follow `channels` or `guilds`: those are major parameters and
//! get a bucket of their own.

use reqwest::Method;
use std::fmt;

/// Minimum digits for a path segment to be treated as a snowflake
const SNOWFLAKE_MIN_DIGITS: usize = 17;

const MAJOR_PARAMETERS: &[&str] = &["channels", "guilds"];

const ID_PLACEHOLDER: &str = ":id";

/// Normalized identifier of one rate-limit bucket, e.g.
/// `DELETE /channels/123456789012345678/messages/:id`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteKey(String);

impl RouteKey {
    pub fn new(method: &Method, path: &str) -> Self {
        let path = path.split(['?', '#']).next().unwrap_or_default();

        let mut key = String::with_capacity(method.as_str().len() + 1 + path.len());
        key.push_str(method.as_str());
        key.push(' ');

        let mut previous = "";
        for (i, segment) in path.trim_start_matches('/').split('/').enumerate() {
            key.push('/');
            if is_snowflake(segment) && !(i > 0 && MAJOR_PARAMETERS.contains(&previous)) {
                key.push_str(ID_PLACEHOLDER);
            } else {
                key.push_str(segment);
            }
            previous = segment;
        }

        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn is_snowflake(segment: &str) -> bool {
    segment.len() >= SNOWFLAKE_MIN_DIGITS && segment.bytes().all(|b| b.is_ascii_digit())
}
