// ABOUTME: Changeset and comment records produced by the XML parser
// ABOUTME: Maps raw element attributes onto typed, nullable fields

use std::collections::HashMap;

use chrono::{DateTime, NaiveDateTime};
use rust_decimal::Decimal;

use super::parser::ParseError;

/// One edit session as read from a dump or replication diff.
///
/// Every field other than `id` and `created_at` is optional: absent attributes
/// map to `None`, never to a default value.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangesetRecord {
    pub id: i64,
    pub user_id: Option<i64>,
    pub user_name: Option<String>,
    pub created_at: NaiveDateTime,
    pub closed_at: Option<NaiveDateTime>,
    /// Only present in newer dump formats
    pub open: Option<bool>,
    pub bbox: Option<BoundingBox>,
    pub num_changes: Option<i32>,
    pub tags: HashMap<String, String>,
    pub comments: Vec<Comment>,
}

/// A discussion comment attached to a changeset, in document order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Comment {
    pub user_id: Option<i64>,
    pub user_name: Option<String>,
    pub date: Option<NaiveDateTime>,
    pub text: Option<String>,
}

/// Bounds of a changeset's edits. Individual bounds may be missing in old dumps.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BoundingBox {
    pub min_lat: Option<Decimal>,
    pub max_lat: Option<Decimal>,
    pub min_lon: Option<Decimal>,
    pub max_lon: Option<Decimal>,
}

impl BoundingBox {
    /// True when all four bounds are known, so an envelope can be built.
    pub fn is_complete(&self) -> bool {
        self.min_lat.is_some()
            && self.max_lat.is_some()
            && self.min_lon.is_some()
            && self.max_lon.is_some()
    }
}

/// Attributes of one element, decoded and unescaped.
///
/// Built by the parser for `changeset` and `comment` elements and consumed by
/// the typed constructors below, which apply the per-field defaulting rules.
#[derive(Debug, Default)]
pub(crate) struct Attributes {
    element: &'static str,
    position: u64,
    values: HashMap<String, String>,
}

impl Attributes {
    pub(crate) fn new(element: &'static str, position: u64) -> Self {
        Self {
            element,
            position,
            values: HashMap::new(),
        }
    }

    pub(crate) fn insert(&mut self, key: String, value: String) {
        self.values.insert(key, value);
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub(crate) fn take(&mut self, key: &str) -> Option<String> {
        self.values.remove(key)
    }

    pub(crate) fn require(&mut self, key: &'static str) -> Result<String, ParseError> {
        self.take(key).ok_or(ParseError::MissingAttribute {
            element: self.element,
            attribute: key,
            position: self.position,
        })
    }

    fn parse_opt<T: std::str::FromStr>(&self, key: &'static str) -> Result<Option<T>, ParseError> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|_| self.invalid(key, raw)),
        }
    }

    fn timestamp_opt(&self, key: &'static str) -> Result<Option<NaiveDateTime>, ParseError> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => parse_timestamp(raw)
                .map(Some)
                .ok_or_else(|| self.invalid(key, raw)),
        }
    }

    fn invalid(&self, key: &'static str, raw: &str) -> ParseError {
        ParseError::InvalidAttribute {
            element: self.element,
            attribute: key,
            value: raw.to_string(),
            position: self.position,
        }
    }
}

impl ChangesetRecord {
    /// Build a record from the attributes of a `changeset` element.
    ///
    /// Tags and comments are filled in later as child elements arrive.
    pub(crate) fn from_attributes(mut attrs: Attributes) -> Result<Self, ParseError> {
        let raw_id = attrs.require("id")?;
        let id = raw_id
            .trim()
            .parse::<i64>()
            .map_err(|_| attrs.invalid("id", &raw_id))?;
        let raw_created = attrs.require("created_at")?;
        let created_at =
            parse_timestamp(&raw_created).ok_or_else(|| attrs.invalid("created_at", &raw_created))?;

        let bbox = BoundingBox {
            min_lat: attrs.parse_opt("min_lat")?,
            max_lat: attrs.parse_opt("max_lat")?,
            min_lon: attrs.parse_opt("min_lon")?,
            max_lon: attrs.parse_opt("max_lon")?,
        };

        Ok(Self {
            id,
            user_id: attrs.parse_opt("uid")?,
            closed_at: attrs.timestamp_opt("closed_at")?,
            open: attrs.parse_opt("open")?,
            num_changes: attrs.parse_opt("num_changes")?,
            bbox: (bbox != BoundingBox::default()).then_some(bbox),
            user_name: attrs.take("user"),
            created_at,
            tags: HashMap::new(),
            comments: Vec::new(),
        })
    }

    /// Minimal record, mostly useful for building fixtures.
    pub fn new(id: i64, created_at: NaiveDateTime) -> Self {
        Self {
            id,
            user_id: None,
            user_name: None,
            created_at,
            closed_at: None,
            open: None,
            bbox: None,
            num_changes: None,
            tags: HashMap::new(),
            comments: Vec::new(),
        }
    }

    /// Tags in the shape the `hstore` column expects.
    pub fn hstore_tags(&self) -> HashMap<String, Option<String>> {
        self.tags
            .iter()
            .map(|(k, v)| (k.clone(), Some(v.clone())))
            .collect()
    }
}

impl Comment {
    pub(crate) fn from_attributes(mut attrs: Attributes) -> Result<Self, ParseError> {
        Ok(Self {
            user_id: attrs.parse_opt("uid")?,
            date: attrs.timestamp_opt("date")?,
            user_name: attrs.take("user"),
            text: None,
        })
    }
}

/// Parse the timestamp formats seen in changeset dumps.
///
/// Dumps use RFC 3339 with a `Z` suffix; some older tooling wrote a space
/// instead of `T` and omitted the zone, which is read as UTC.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.naive_utc());
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
}
