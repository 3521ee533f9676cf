//! Cache key namespace.
//!
//! Data keys are `<purpose>:<scope>:<fingerprint>`. Every key of one purpose
//! shares the literal `<purpose>:` prefix, which is what makes
//! [`CachePurpose::pattern`] cheap to scan. Coordination keys live under
//! `lock:` and `lock:bg:`, a segment no purpose can produce.

use std::borrow::Cow;
use std::fmt;

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Fingerprints longer than this are replaced by their SHA-256 digest.
const MAX_FINGERPRINT_LEN: usize = 128;
const HASHED_FINGERPRINT_PREFIX: &str = "h:";
const GLOBAL_SCOPE: &str = "global";

/// What a cached value is for. Each purpose owns a disjoint key prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CachePurpose {
    /// Salon directory listings, keyed by filter set.
    SalonsList,
    /// Free-text salon search.
    SalonsSearch,
    /// One salon's public profile, keyed by slug.
    SalonDetail,
    ArtistsList,
    ArtistDetail,
    /// Reviews of one salon, scoped by the salon id.
    ReviewsList,
    /// Blog post listings.
    PostsList,
    PostDetail,
    CategoriesList,
    /// Aggregated counters for dashboards and landing pages.
    StatsSummary,
}

impl CachePurpose {
    pub const ALL: [CachePurpose; 10] = [
        Self::SalonsList,
        Self::SalonsSearch,
        Self::SalonDetail,
        Self::ArtistsList,
        Self::ArtistDetail,
        Self::ReviewsList,
        Self::PostsList,
        Self::PostDetail,
        Self::CategoriesList,
        Self::StatsSummary,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SalonsList => "salons:list",
            Self::SalonsSearch => "salons:search",
            Self::SalonDetail => "salon:detail",
            Self::ArtistsList => "artists:list",
            Self::ArtistDetail => "artist:detail",
            Self::ReviewsList => "reviews:list",
            Self::PostsList => "posts:list",
            Self::PostDetail => "post:detail",
            Self::CategoriesList => "categories:list",
            Self::StatsSummary => "stats:summary",
        }
    }

    /// Matches every key of this purpose, whatever its scope or parameters.
    pub fn pattern(self) -> String {
        format!("{}:*", self.as_str())
    }

    /// Matches every key of this purpose under one scope.
    pub fn scoped_pattern(self, scope: &Scope) -> String {
        format!("{}:{}:*", self.as_str(), escape_glob(&scope.segment()))
    }
}

impl fmt::Display for CachePurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a key is site-wide or belongs to a parent entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    Global,
    /// Identifier of the owning entity (for example a salon id).
    Parent(String),
}

impl Scope {
    pub fn parent(id: impl fmt::Display) -> Self {
        Self::Parent(id.to_string())
    }

    /// The key segment for this scope. Parent ids are percent-escaped where
    /// they could collide with the global segment or span a `:` separator.
    fn segment(&self) -> Cow<'_, str> {
        match self {
            Self::Global => Cow::Borrowed(GLOBAL_SCOPE),
            Self::Parent(id) if id == GLOBAL_SCOPE => Cow::Borrowed("%67lobal"),
            Self::Parent(id) if id.contains(['%', ':']) => {
                Cow::Owned(id.replace('%', "%25").replace(':', "%3A"))
            }
            Self::Parent(id) => Cow::Borrowed(id),
        }
    }
}

/// A fully-qualified logical cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    purpose: CachePurpose,
    scope: Scope,
    fingerprint: String,
}

impl CacheKey {
    /// Build a key from an already-computed fingerprint.
    pub fn new(purpose: CachePurpose, scope: Scope, fingerprint: impl Into<String>) -> Self {
        Self {
            purpose,
            scope,
            fingerprint: compact(fingerprint.into()),
        }
    }

    /// Key for a listing query; the filter object is fingerprinted canonically.
    pub fn listing(purpose: CachePurpose, scope: Scope, filters: &Value) -> Self {
        Self::new(purpose, scope, fingerprint_filters(filters))
    }

    /// Key for a single entity page looked up by slug.
    pub fn detail(purpose: CachePurpose, slug: &str) -> Self {
        Self::new(purpose, Scope::Global, slug)
    }

    /// Key for a search; terms differing only in case or spacing share a key.
    pub fn search(purpose: CachePurpose, scope: Scope, term: &str) -> Self {
        let normalized = term
            .split_whitespace()
            .map(str::to_lowercase)
            .collect::<Vec<_>>()
            .join(" ");
        Self::new(purpose, scope, normalized)
    }

    pub fn purpose(&self) -> CachePurpose {
        self.purpose
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn render(&self) -> String {
        format!(
            "{}:{}:{}",
            self.purpose.as_str(),
            self.scope.segment(),
            self.fingerprint
        )
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Primary (stampede) lock for a data key.
pub fn lock_key(key: &str) -> String {
    format!("lock:{key}")
}

/// Background revalidation lock for a data key.
pub fn background_lock_key(key: &str) -> String {
    format!("lock:bg:{key}")
}

/// Sorted-key compact JSON, independent of the order fields were inserted.
pub fn fingerprint_filters(filters: &Value) -> String {
    let mut out = String::new();
    write_canonical(filters, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(fields) => {
            let mut entries: Vec<_> = fields.iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            out.push('{');
            for (index, (key, field)) in entries.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(field, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn compact(fingerprint: String) -> String {
    if fingerprint.len() <= MAX_FINGERPRINT_LEN {
        return fingerprint;
    }
    let mut hasher = Sha256::new();
    hasher.update(fingerprint.as_bytes());
    format!("{HASHED_FINGERPRINT_PREFIX}{}", hex::encode(hasher.finalize()))
}

/// Escape glob metacharacters so a literal segment can sit inside a pattern.
fn escape_glob(segment: &str) -> String {
    let mut escaped = String::with_capacity(segment.len());
    for ch in segment.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}
