//! Route compression dictionary

use std::collections::HashMap;

use super::Route;

/// Bidirectional route name <-> code mapping negotiated at handshake
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteDictionary {
    codes: HashMap<String, u16>,
    names: HashMap<u16, String>,
}

impl RouteDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a name -> code table
    ///
    /// If two names share a code, the first one kept wins and the later
    /// entry is dropped so both maps stay inverses of each other.
    pub fn from_map(map: HashMap<String, u16>) -> Self {
        let mut entries: Vec<_> = map.into_iter().collect();
        entries.sort();

        let mut dict = Self::default();
        for (name, code) in entries {
            if dict.names.contains_key(&code) {
                tracing::warn!("Route code {} reused by '{}', ignoring", code, name);
                continue;
            }
            dict.names.insert(code, name.clone());
            dict.codes.insert(name, code);
        }
        dict
    }

    pub fn compress(&self, route: &str) -> Option<u16> {
        self.codes.get(route).copied()
    }

    pub fn decompress(&self, code: u16) -> Option<&str> {
        self.names.get(&code).map(String::as_str)
    }

    /// Pick the wire form for an outgoing route name
    pub fn encode_route(&self, route: &str) -> Route {
        match self.compress(route) {
            Some(code) => Route::Code(code),
            None => Route::Name(route.to_string()),
        }
    }

    /// Turn a decoded route into a name where possible
    pub fn resolve(&self, route: Route) -> Route {
        match route {
            Route::Code(code) => match self.decompress(code) {
                Some(name) => Route::Name(name.to_string()),
                None => {
                    tracing::warn!("Failed to decompress route, code={}", code);
                    Route::Unresolved(code)
                }
            },
            other => other,
        }
    }

    /// The name -> code table, as advertised in a handshake response
    pub fn to_map(&self) -> HashMap<String, u16> {
        self.codes.clone()
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RouteDictionary {
        let mut map = HashMap::new();
        map.insert("connector.entryHandler.hello".to_string(), 1);
        map.insert("onChat".to_string(), 2);
        RouteDictionary::from_map(map)
    }

    #[test]
    fn test_compress_decompress_symmetry() {
        let dict = sample();
        for route in ["connector.entryHandler.hello", "onChat"] {
            let code = dict.compress(route).unwrap();
            assert_eq!(dict.decompress(code), Some(route));
        }
        assert_eq!(dict.compress("missing"), None);
        assert_eq!(dict.decompress(99), None);
    }

    #[test]
    fn test_encode_and_resolve() {
        let dict = sample();
        assert_eq!(dict.encode_route("onChat"), Route::Code(2));
        assert_eq!(dict.encode_route("other"), Route::name("other"));

        assert_eq!(dict.resolve(Route::Code(1)), Route::name("connector.entryHandler.hello"));
        assert_eq!(dict.resolve(Route::Code(42)), Route::Unresolved(42));
        assert_eq!(dict.resolve(Route::name("x")), Route::name("x"));
    }

    #[test]
    fn test_duplicate_codes_keep_maps_inverse() {
        let mut map = HashMap::new();
        map.insert("a".to_string(), 1);
        map.insert("b".to_string(), 1);
        let dict = RouteDictionary::from_map(map);

        assert_eq!(dict.len(), 1);
        assert_eq!(dict.decompress(1), Some("a"));
        assert_eq!(dict.compress("b"), None);
    }
}
