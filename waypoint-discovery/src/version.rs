//! Version selection
//!
//! Selectors follow NPM range syntax and are evaluated with [`semver`]:
//!
//! | Selector | Meaning |
//! |----------|---------|
//! | `*`, `x`, empty | any version |
//! | `1.0.4` | exactly `1.0.4` |
//! | `1.0`, `1.x` | `>=1.0.0 <1.1.0`, `>=1.0.0 <2.0.0` |
//! | `^1.0.4` | `>=1.0.4 <2.0.0` |
//! | `~1.0.4` | `>=1.0.4 <1.1.0` |
//! | `>=1.0.0 <1.2.0` | both comparators |
//! | `1.0.0 - 1.2.0` | `>=1.0.0 <=1.2.0` |
//! | `^1 \|\| ^3` | either range |
//!
//! The highest matching version always wins.

use crate::error::{DiscoveryError, Result};
use semver::{Version, VersionReq};
use std::fmt;
use std::str::FromStr;

/// Parse a version, tolerating a leading `v` and missing minor/patch parts.
pub fn parse_version(raw: &str) -> std::result::Result<Version, semver::Error> {
    let trimmed = raw.trim();
    let trimmed = trimmed
        .strip_prefix('v')
        .or_else(|| trimmed.strip_prefix('V'))
        .unwrap_or(trimmed);

    let split = trimmed.find(['-', '+']).unwrap_or(trimmed.len());
    let (core, suffix) = trimmed.split_at(split);
    let padding = match core.matches('.').count() {
        0 => ".0.0",
        1 => ".0",
        _ => "",
    };

    Version::parse(&format!("{}{}{}", core, padding, suffix))
}

/// A parsed version selector
#[derive(Debug, Clone)]
pub enum VersionSelector {
    /// Matches every version
    Any,
    /// Matches a version satisfying at least one requirement
    Ranges(Vec<VersionReq>),
}

impl VersionSelector {
    /// Whether `version` satisfies this selector
    pub fn matches(&self, version: &Version) -> bool {
        match self {
            Self::Any => true,
            Self::Ranges(reqs) => reqs.iter().any(|req| req.matches(version)),
        }
    }

    /// Highest version in `versions` satisfying this selector
    pub fn best_match<'a, I>(&self, versions: I) -> Option<&'a Version>
    where
        I: IntoIterator<Item = &'a Version>,
    {
        versions.into_iter().filter(|v| self.matches(v)).max()
    }
}

impl FromStr for VersionSelector {
    type Err = DiscoveryError;

    fn from_str(selector: &str) -> Result<Self> {
        let mut reqs = Vec::new();

        for alternative in selector.split("||") {
            let alternative = alternative.trim();
            if is_wildcard(alternative) {
                return Ok(Self::Any);
            }

            let translated = translate_range(alternative);
            let req = VersionReq::parse(&translated).map_err(|e| {
                DiscoveryError::InvalidVersionRange {
                    selector: selector.to_string(),
                    message: e.to_string(),
                }
            })?;
            reqs.push(req);
        }

        Ok(Self::Ranges(reqs))
    }
}

impl fmt::Display for VersionSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => write!(f, "*"),
            Self::Ranges(reqs) => {
                let parts: Vec<String> = reqs.iter().map(|r| r.to_string()).collect();
                write!(f, "{}", parts.join(" || "))
            }
        }
    }
}

/// Resolve `selector` against `versions`, returning the highest match.
pub fn resolve<'a, I>(versions: I, selector: &str) -> Result<Option<&'a Version>>
where
    I: IntoIterator<Item = &'a Version>,
{
    Ok(selector.parse::<VersionSelector>()?.best_match(versions))
}

fn is_wildcard(s: &str) -> bool {
    matches!(s, "" | "*" | "x" | "X")
}

fn is_operator(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| matches!(c, '<' | '>' | '=' | '^' | '~'))
}

// NPM range (space separated) to semver requirement (comma separated).
fn translate_range(range: &str) -> String {
    if let Some((low, high)) = range.split_once(" - ") {
        return format!(">={}, <={}", strip_v(low.trim()), strip_v(high.trim()));
    }

    let mut comparators = Vec::new();
    let mut pending_op: Option<&str> = None;

    for token in range.split_whitespace() {
        if is_operator(token) {
            pending_op = Some(token);
            continue;
        }

        let token = match pending_op.take() {
            Some(op) => format!("{}{}", op, token),
            None => token.to_string(),
        };
        comparators.push(translate_comparator(&token));
    }

    if let Some(op) = pending_op {
        // Dangling operator; let the parser report it.
        comparators.push(op.to_string());
    }

    comparators.join(", ")
}

fn translate_comparator(token: &str) -> String {
    let split = token
        .find(|c: char| !matches!(c, '<' | '>' | '=' | '^' | '~'))
        .unwrap_or(token.len());
    let (op, version) = token.split_at(split);
    let version = strip_v(version);

    if !op.is_empty() {
        return format!("{}{}", op, version);
    }

    let has_wildcard = version.split('.').any(is_wildcard);
    if has_wildcard {
        version
            .split('.')
            .map(|part| if is_wildcard(part) { "*" } else { part })
            .collect::<Vec<_>>()
            .join(".")
    } else {
        // A bare version is exact in NPM, caret in Cargo.
        format!("={}", version)
    }
}

fn strip_v(version: &str) -> &str {
    version
        .strip_prefix('v')
        .or_else(|| version.strip_prefix('V'))
        .unwrap_or(version)
}
