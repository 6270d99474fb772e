//! Candidate key generation.
//!
//! Turns a request method and URL into the ordered list of fixture names the
//! request could map to, from fully literal down to "first segment literal,
//! rest wildcard".

use std::fmt;

/// Joins the method and path segments in a fixture filename.
pub const DELIMITER: char = '-';

/// Leading character that marks a filename segment as a wildcard.
pub const WILDCARD: char = '_';

/// Extension every fixture file carries.
pub const FIXTURE_EXTENSION: &str = "json";

/// One segment of a route key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    /// Must equal the request segment exactly
    Literal(String),
    /// Stands in for any single segment
    Wildcard,
}

impl Segment {
    pub fn is_wildcard(&self) -> bool {
        matches!(self, Segment::Wildcard)
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Literal(value) => f.write_str(value),
            Segment::Wildcard => write!(f, "{}", WILDCARD),
        }
    }
}

/// A lookup hypothesis for a request: lower-cased method plus path segments,
/// with trailing segments generalized to wildcards.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CandidateKey {
    pub method: String,
    pub segments: Vec<Segment>,
}

impl CandidateKey {
    /// Number of wildcard segments.
    pub fn wildcard_count(&self) -> usize {
        self.segments.iter().filter(|s| s.is_wildcard()).count()
    }

    /// The full key as a flat token list, in the shape a fixture filename
    /// would parse into.
    ///
    /// A method or literal containing the delimiter cannot survive a round
    /// trip through a filename, so it is split into several literals here.
    pub fn normalized_tokens(&self) -> Vec<Segment> {
        let mut tokens = Vec::with_capacity(self.segments.len() + 1);
        push_split(&mut tokens, &self.method);
        for segment in &self.segments {
            match segment {
                Segment::Literal(value) => push_split(&mut tokens, value),
                Segment::Wildcard => tokens.push(Segment::Wildcard),
            }
        }
        tokens
    }
}

fn push_split(tokens: &mut Vec<Segment>, value: &str) {
    tokens.extend(
        value
            .split(DELIMITER)
            .map(|part| Segment::Literal(part.to_string())),
    );
}

impl fmt::Display for CandidateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.method)?;
        for segment in &self.segments {
            write!(f, "{}{}", DELIMITER, segment)?;
        }
        Ok(())
    }
}

/// Split the path portion of a URL into its non-empty segments.
pub fn path_segments(url: &str) -> Vec<&str> {
    let path = url.split('?').next().unwrap_or("");
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Generate candidate keys for a request, most specific first.
///
/// A path with `n` segments yields exactly `n` candidates. A path with no
/// segments yields none.
pub fn generate(method: &str, url: &str) -> Vec<CandidateKey> {
    let hierarchy = path_segments(url);
    let method = method.to_lowercase();

    let mut candidates: Vec<CandidateKey> = (0..hierarchy.len())
        .map(|literal_upto| CandidateKey {
            method: method.clone(),
            segments: hierarchy
                .iter()
                .enumerate()
                .map(|(i, segment)| {
                    if i <= literal_upto {
                        Segment::Literal((*segment).to_string())
                    } else {
                        Segment::Wildcard
                    }
                })
                .collect(),
        })
        .collect();

    candidates.reverse();
    candidates
}

/// Render candidates the way `X-Debug-Paths` carries them.
pub fn join_candidates(candidates: &[CandidateKey]) -> String {
    candidates
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(",")
}
