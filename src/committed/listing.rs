//! Prefix / after / delimiter listing over any record cursor.

use crate::committed::iterator::RecordIterator;
use crate::error::Result;
use crate::storage::Record;

/// One item of a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Listing {
    Object(Record),
    /// keys sharing this prefix up to and including the delimiter
    CommonPrefix(String),
}

impl Listing {
    pub fn path(&self) -> &str {
        match self {
            Listing::Object(record) => record.key.as_str(),
            Listing::CommonPrefix(prefix) => prefix,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    pub prefix: String,
    /// return only paths strictly greater than this one
    pub after: Option<String>,
    pub delimiter: Option<String>,
    pub limit: Option<usize>,
}

impl ListOptions {
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Self::default()
        }
    }

    pub fn after(mut self, after: impl Into<String>) -> Self {
        self.after = Some(after.into());
        self
    }

    pub fn delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.delimiter = Some(delimiter.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// first key the listing can possibly return
    pub(crate) fn start_key(&self) -> String {
        match &self.after {
            Some(after) if after.as_str() >= self.prefix.as_str() => format!("{}\u{0}", after),
            _ => self.prefix.clone(),
        }
    }
}

/// Smallest string greater than every string starting with `prefix`.
///
/// `None` when no such string exists (empty prefix or all chars maximal).
pub(crate) fn prefix_upper_bound(prefix: &str) -> Option<String> {
    let mut chars: Vec<char> = prefix.chars().collect();
    while let Some(last) = chars.pop() {
        let next = match last as u32 {
            0xD7FF => Some('\u{E000}'),
            c => char::from_u32(c + 1),
        };
        if let Some(next) = next {
            chars.push(next);
            return Some(chars.into_iter().collect());
        }
    }
    None
}

/// The common prefix `key` collapses into, if any.
pub(crate) fn common_prefix<'a>(key: &'a str, prefix: &str, delimiter: &str) -> Option<&'a str> {
    if delimiter.is_empty() {
        return None;
    }
    let rest = key.get(prefix.len()..)?;
    rest.find(delimiter)
        .map(|pos| &key[..prefix.len() + pos + delimiter.len()])
}

/// List `iter` according to `options`, seeking past collapsed prefixes.
pub fn list_records<I: RecordIterator + ?Sized>(iter: &mut I, options: &ListOptions) -> Result<Vec<Listing>> {
    let limit = options.limit.unwrap_or(usize::MAX);
    let mut out = Vec::new();
    if limit == 0 {
        return Ok(out);
    }
    iter.seek_ge(&options.start_key())?;

    while let Some(record) = iter.next().transpose()? {
        if !record.key.starts_with(&options.prefix) {
            break;
        }
        let collapsed = options
            .delimiter
            .as_deref()
            .and_then(|d| common_prefix(record.key.as_str(), &options.prefix, d))
            .map(str::to_string);

        match collapsed {
            Some(common) => {
                let already_returned = options.after.as_deref().is_some_and(|a| common.as_str() <= a);
                if !already_returned {
                    out.push(Listing::CommonPrefix(common.clone()));
                }
                match prefix_upper_bound(&common) {
                    Some(next) => iter.seek_ge(&next)?,
                    None => break,
                }
            }
            None => out.push(Listing::Object(record)),
        }
        if out.len() >= limit {
            break;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::committed::iterator::VecRecordIterator;
    use crate::storage::{Entry, Key};

    fn records(keys: &[&str]) -> VecRecordIterator {
        VecRecordIterator::new(
            keys.iter()
                .map(|k| Record::new(Key::new(*k).unwrap(), Entry::new(format!("data/{}", k), 1, "c")))
                .collect(),
        )
    }

    fn paths(listing: &[Listing]) -> Vec<&str> {
        listing.iter().map(Listing::path).collect()
    }

    #[test]
    fn test_prefix_and_after() {
        let mut iter = records(&["a/1", "a/2", "b/1", "b/2", "c"]);
        let out = list_records(&mut iter, &ListOptions::with_prefix("b/")).unwrap();
        assert_eq!(paths(&out), vec!["b/1", "b/2"]);

        let mut iter = records(&["a/1", "a/2", "b/1", "b/2", "c"]);
        let out = list_records(&mut iter, &ListOptions::default().after("a/2").limit(2)).unwrap();
        assert_eq!(paths(&out), vec!["b/1", "b/2"]);
    }

    #[test]
    fn test_delimiter_collapses() {
        let mut iter = records(&["a/x/1", "a/x/2", "a/y", "b/1", "top"]);
        let out = list_records(&mut iter, &ListOptions::default().delimiter("/")).unwrap();
        assert_eq!(paths(&out), vec!["a/", "b/", "top"]);
        assert!(matches!(out[0], Listing::CommonPrefix(_)));

        let mut iter = records(&["a/x/1", "a/x/2", "a/y", "b/1", "top"]);
        let out = list_records(&mut iter, &ListOptions::with_prefix("a/").delimiter("/")).unwrap();
        assert_eq!(paths(&out), vec!["a/x/", "a/y"]);
    }

    #[test]
    fn test_after_a_common_prefix() {
        let mut iter = records(&["a/1", "a/2", "b/1"]);
        let out = list_records(&mut iter, &ListOptions::default().delimiter("/").after("a/")).unwrap();
        assert_eq!(paths(&out), vec!["b/"]);
    }

    #[test]
    fn test_upper_bound() {
        assert_eq!(prefix_upper_bound("a/").as_deref(), Some("a0"));
        assert_eq!(prefix_upper_bound(""), None);
    }
}
