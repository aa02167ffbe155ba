use std::fmt;

use http::HeaderMap;
use tracing::debug;

use super::{InvalidMetadataValue, MetadataKey, MetadataValue, is_reserved_header};

/// An ordered multimap of custom gRPC metadata.
///
/// Entries keep their insertion order, also across different keys, and a
/// key may appear more than once.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct MetadataMap {
    entries: Vec<(MetadataKey, MetadataValue)>,
}

/// Iterator over the entries of a [`MetadataMap`] in insertion order.
#[derive(Debug, Clone)]
pub struct Iter<'a> {
    inner: std::slice::Iter<'a, (MetadataKey, MetadataValue)>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (&'a MetadataKey, &'a MetadataValue);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|(k, v)| (k, v))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl MetadataMap {
    /// Create an empty `MetadataMap`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty `MetadataMap` with room for `capacity` entries.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Append an entry, keeping existing entries of the same key.
    pub fn append(
        &mut self,
        key: MetadataKey,
        value: impl Into<MetadataValue>,
    ) -> Result<(), InvalidMetadataValue> {
        let value = value.into();
        if key.is_binary() != value.is_binary() {
            return Err(InvalidMetadataValue::new());
        }
        self.entries.push((key, value));
        Ok(())
    }

    /// Replace all entries of `key` with a single entry,
    /// returning the first value that was replaced.
    pub fn insert(
        &mut self,
        key: MetadataKey,
        value: impl Into<MetadataValue>,
    ) -> Result<Option<MetadataValue>, InvalidMetadataValue> {
        let value = value.into();
        if key.is_binary() != value.is_binary() {
            return Err(InvalidMetadataValue::new());
        }
        let previous = self.remove(key.as_str());
        self.entries.push((key, value));
        Ok(previous)
    }

    /// Get the first value of `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.entries
            .iter()
            .find_map(|(k, v)| (*k == *key).then_some(v))
    }

    /// Get all values of `key` in insertion order.
    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a MetadataValue> + 'a {
        self.entries
            .iter()
            .filter_map(move |(k, v)| (*k == *key).then_some(v))
    }

    /// Whether at least one entry of `key` exists.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Remove all entries of `key`, returning the first removed value.
    pub fn remove(&mut self, key: &str) -> Option<MetadataValue> {
        let mut first = None;
        self.entries.retain(|(k, v)| {
            if *k == *key {
                if first.is_none() {
                    first = Some(v.clone());
                }
                false
            } else {
                true
            }
        });
        first
    }

    /// Move all entries of `other` to the end of this map.
    pub fn extend(&mut self, other: Self) {
        self.entries.extend(other.entries);
    }

    /// Number of entries, counting repeated keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over all entries in insertion order.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            inner: self.entries.iter(),
        }
    }

    /// Build a `MetadataMap` from received headers.
    ///
    /// Reserved protocol headers are dropped, as are binary values which
    /// are not valid base64.
    #[must_use]
    pub fn from_headers(headers: HeaderMap) -> Self {
        let mut map = Self::with_capacity(headers.len());
        for (name, value) in headers.iter() {
            if is_reserved_header(name.as_str()) {
                continue;
            }
            let key = MetadataKey::from_header_name(name.clone());
            match MetadataValue::from_header_value(value, key.is_binary()) {
                Some(value) => map.entries.push((key, value)),
                None => debug!("dropping undecodable binary metadata entry '{key}'"),
            }
        }
        map
    }

    /// Convert into headers, leaving out reserved protocol headers.
    #[must_use]
    pub fn into_sanitized_headers(self) -> HeaderMap {
        let mut headers = HeaderMap::with_capacity(self.entries.len());
        for (key, value) in self.entries {
            if is_reserved_header(key.as_str()) {
                debug!("skipping reserved header '{key}' in custom metadata");
                continue;
            }
            match value.to_header_value() {
                Ok(value) => {
                    headers.append(key.as_header_name().clone(), value);
                }
                Err(err) => debug!("skipping metadata entry '{key}': {err}"),
            }
        }
        headers
    }
}

impl fmt::Debug for MetadataMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<'a> IntoIterator for &'a MetadataMap {
    type Item = (&'a MetadataKey, &'a MetadataValue);
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;

    use super::*;

    #[test]
    fn duplicates_keep_order() {
        let mut map = MetadataMap::new();
        map.append(MetadataKey::from_static("x-a"), "1").unwrap();
        map.append(MetadataKey::from_static("x-b"), "2").unwrap();
        map.append(MetadataKey::from_static("x-a"), "3").unwrap();

        let values: Vec<_> = map.get_all("X-A").filter_map(|v| v.to_str()).collect();
        assert_eq!(values, ["1", "3"]);

        let keys: Vec<_> = map.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, ["x-a", "x-b", "x-a"]);
    }

    #[test]
    fn kind_mismatch_is_rejected() {
        let mut map = MetadataMap::new();
        assert!(
            map.append(MetadataKey::from_static("x-a-bin"), "text")
                .is_err()
        );
        assert!(
            map.append(
                MetadataKey::from_static("x-a"),
                MetadataValue::from_binary(&b"\x00"[..])
            )
            .is_err()
        );
        assert!(map.is_empty());
    }

    #[test]
    fn insert_replaces_all() {
        let mut map = MetadataMap::new();
        map.append(MetadataKey::from_static("x-a"), "1").unwrap();
        map.append(MetadataKey::from_static("x-a"), "2").unwrap();
        let previous = map.insert(MetadataKey::from_static("x-a"), "3").unwrap();
        assert_eq!(previous.unwrap().to_str(), Some("1"));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn headers_drop_reserved() {
        let mut headers = HeaderMap::new();
        headers.insert("grpc-status", HeaderValue::from_static("0"));
        headers.insert("content-type", HeaderValue::from_static("application/grpc"));
        headers.insert("x-request-id", HeaderValue::from_static("abc"));
        headers.insert("x-trace-bin", HeaderValue::from_static("AAE"));

        let map = MetadataMap::from_headers(headers);
        assert_eq!(map.len(), 2);
        assert_eq!(map.get("x-request-id").unwrap().to_str(), Some("abc"));
        assert_eq!(map.get("x-trace-bin").unwrap().as_bytes(), b"\x00\x01");

        let headers = map.into_sanitized_headers();
        assert_eq!(headers["x-trace-bin"], "AAE");
        assert!(headers.get("grpc-status").is_none());
    }
}
