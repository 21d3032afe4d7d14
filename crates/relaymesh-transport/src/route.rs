/// Which endpoint an inbound WebSocket upgrade targeted.
///
/// Only the path and the `hash` / `id` query parameters matter; whether they
/// are present and valid is decided by the protocol layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// `/signal?hash=<topic>&id=<client id>`: an end client.
    Signal {
        hash: Option<String>,
        id: Option<String>,
    },
    /// `/relay?hash=<infohash>&id=<node id>`: another tracker.
    Relay {
        hash: Option<String>,
        id: Option<String>,
    },
    /// Any other path.
    Unsupported { path: String },
}

impl Route {
    /// Classify a request target.
    pub fn parse(path: &str, query: Option<&str>) -> Self {
        let (hash, id) = query.map(params).unwrap_or_default();
        match path {
            "/signal" => Route::Signal { hash, id },
            "/relay" => Route::Relay { hash, id },
            other => Route::Unsupported {
                path: other.to_string(),
            },
        }
    }
}

fn params(query: &str) -> (Option<String>, Option<String>) {
    let mut hash = None;
    let mut id = None;
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            "hash" if hash.is_none() => hash = Some(value.into_owned()),
            "id" if id.is_none() => id = Some(value.into_owned()),
            _ => {}
        }
    }
    (hash, id)
}
