// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Namespace identifiers (NSIDs) and the `/xrpc/` path parser
//!
//! An NSID is a reverse-DNS-style dotted ASCII string (`io.example.ping`)
//! naming one XRPC method. Requests arrive as `/xrpc/<nsid>` paths, so the
//! hot-path parser here works directly on the path bytes rather than going
//! through a URL library or a regex.

use std::fmt;
use std::str::FromStr;

/// Errors from [`Nsid::from_str`] and [`parse_xrpc_path`].
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum NsidError {
    #[error("invalid xrpc path")]
    InvalidPath,
    #[error("invalid nsid: {0:?}")]
    InvalidNsid(String),
}

/// A validated namespace identifier.
///
/// Guaranteed to consist of at least two non-empty dot-separated segments of
/// ASCII alphanumerics with interior hyphens.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Nsid(String);

impl Nsid {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The domain-authority part: everything before the final segment.
    pub fn authority(&self) -> &str {
        let dot = self.0.rfind('.').expect("validated nsid has a dot");
        &self.0[..dot]
    }

    /// The method name: the final segment.
    pub fn name(&self) -> &str {
        let dot = self.0.rfind('.').expect("validated nsid has a dot");
        &self.0[dot + 1..]
    }
}

impl FromStr for Nsid {
    type Err = NsidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || NsidError::InvalidNsid(s.to_owned());

        let mut segments = 0;
        for segment in s.split('.') {
            if segment.is_empty()
                || !segment.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
                || segment.starts_with('-')
                || segment.ends_with('-')
            {
                return Err(invalid());
            }
            segments += 1;
        }
        if segments < 2 {
            return Err(invalid());
        }
        Ok(Nsid(s.to_owned()))
    }
}

impl fmt::Display for Nsid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Nsid {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Extract the method NSID from an `/xrpc/<nsid>` request path.
///
/// Accepts either a bare path or a full URL (the pathname is located first).
/// The NSID portion must be ASCII alphanumerics with `-` and `.` allowed only
/// after an alphanumeric byte, be at least two bytes long, and may carry one
/// trailing `/` immediately before the query string or end of input.
///
/// Returns the NSID substring, excluding any trailing slash or query.
pub fn parse_xrpc_path(input: &str) -> Result<&str, NsidError> {
    let path = pathname(input);
    let rest = path.strip_prefix("/xrpc/").ok_or(NsidError::InvalidPath)?;

    let bytes = rest.as_bytes();
    let mut end = bytes.len();
    let mut prev_alnum = false;
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'0'..=b'9' | b'A'..=b'Z' | b'a'..=b'z' => prev_alnum = true,
            b'-' | b'.' => {
                if !prev_alnum {
                    return Err(NsidError::InvalidPath);
                }
                prev_alnum = false;
            }
            b'/' => {
                // only a trailing slash, directly before '?' or end-of-string
                match bytes.get(i + 1) {
                    None | Some(b'?') => {
                        end = i;
                        break;
                    }
                    Some(_) => return Err(NsidError::InvalidPath),
                }
            }
            b'?' => {
                end = i;
                break;
            }
            _ => return Err(NsidError::InvalidPath),
        }
    }

    let nsid = &rest[..end];
    if nsid.len() < 2 || !nsid.as_bytes()[end - 1].is_ascii_alphanumeric() {
        return Err(NsidError::InvalidPath);
    }
    Ok(nsid)
}

/// Reduce a full URL to its pathname; bare paths pass through unchanged.
fn pathname(input: &str) -> &str {
    let Some(scheme_end) = input.find("://") else {
        return input;
    };
    let after_authority = &input[scheme_end + 3..];
    match after_authority.find('/') {
        Some(slash) => &after_authority[slash..],
        // URL with no path at all, e.g. "https://example.com"
        None => "",
    }
}
