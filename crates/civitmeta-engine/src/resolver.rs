use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use civitmeta_contracts::cache::{normalize_hash_key, CachedHash, HashCache, NOT_FOUND_SENTINEL};
use reqwest::blocking::Client as HttpClient;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde_json::Value;
use tracing::{debug, info, warn};

/// Number of hash characters used as the remote lookup key and as the local short form.
pub const SHORT_HASH_LEN: usize = 12;
pub const UNKNOWN_HASH: &str = "unknown";

/// What one remote lookup produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupOutcome {
    Found(String),
    /// The service answered 404.
    NotFound,
    /// The service answered 2xx but carried no usable identifier.
    NoIdentifier,
    /// Timeout, transport error, unexpected status or unreadable body.
    Transient(String),
}

pub trait HashLookup {
    fn name(&self) -> &str;
    fn lookup(&self, hash_prefix: &str) -> LookupOutcome;
}

/// Client for the CivitAI `model-versions/by-hash` endpoint.
pub struct CivitaiLookup {
    api_base: String,
    http: HttpClient,
}

impl CivitaiLookup {
    pub fn new(api_base: &str, timeout: Duration) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(timeout)
            .build()
            .context("failed building lookup HTTP client")?;
        Ok(Self {
            api_base: api_base.trim().trim_end_matches('/').to_string(),
            http,
        })
    }

    fn endpoint(&self, hash_prefix: &str) -> String {
        format!("{}/model-versions/by-hash/{}", self.api_base, hash_prefix)
    }
}

impl HashLookup for CivitaiLookup {
    fn name(&self) -> &str {
        "civitai"
    }

    fn lookup(&self, hash_prefix: &str) -> LookupOutcome {
        let url = self.endpoint(hash_prefix);
        let response = match self
            .http
            .get(&url)
            .header(CONTENT_TYPE, "application/json")
            .send()
        {
            Ok(response) => response,
            Err(err) => return LookupOutcome::Transient(format!("request failed: {err}")),
        };

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return LookupOutcome::NotFound;
        }
        if !status.is_success() {
            return LookupOutcome::Transient(format!("status {status}"));
        }

        let payload: Value = match response.json() {
            Ok(payload) => payload,
            Err(err) => return LookupOutcome::Transient(format!("invalid JSON payload: {err}")),
        };
        match autov2_from_payload(&payload) {
            Some(id) => LookupOutcome::Found(id),
            None => LookupOutcome::NoIdentifier,
        }
    }
}

/// Lookup used with `--offline`: every miss degrades to the local short hash.
pub struct OfflineLookup;

impl HashLookup for OfflineLookup {
    fn name(&self) -> &str {
        "offline"
    }

    fn lookup(&self, _hash_prefix: &str) -> LookupOutcome {
        LookupOutcome::Transient("offline mode".to_string())
    }
}

fn autov2_from_payload(payload: &Value) -> Option<String> {
    payload
        .get("files")
        .and_then(Value::as_array)?
        .iter()
        .filter_map(|file| file.get("hashes")?.get("AutoV2")?.as_str())
        .map(str::trim)
        .find(|id| !id.is_empty())
        .map(str::to_ascii_uppercase)
}

/// Identifier rendered for a hash. The three cases stay distinguishable in the
/// output text: a resolved AutoV2 id, the `not_found` sentinel, or a 12-character
/// local short hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Resolved(String),
    NotFound,
    Fallback(String),
}

impl Resolution {
    pub fn is_cached_outcome(&self) -> bool {
        !matches!(self, Self::Fallback(_))
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resolved(id) | Self::Fallback(id) => f.write_str(id),
            Self::NotFound => f.write_str(NOT_FOUND_SENTINEL),
        }
    }
}

impl From<&CachedHash> for Resolution {
    fn from(value: &CachedHash) -> Self {
        match value {
            CachedHash::Resolved(id) => Self::Resolved(id.clone()),
            CachedHash::NotFound => Self::NotFound,
        }
    }
}

/// First 12 characters of the hash, skipping a `0x` prefix; `unknown` when empty.
pub fn shorten_hash(hash: &str) -> String {
    let trimmed = hash.trim();
    if trimmed.is_empty() {
        return UNKNOWN_HASH.to_string();
    }
    let body = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    body.chars().take(SHORT_HASH_LEN).collect()
}

/// Resolves content hashes through the cache first and the remote service second.
/// Only confirmed outcomes are cached; transient failures retry next time.
pub struct HashResolver {
    cache: HashCache,
    lookup: Box<dyn HashLookup>,
}

impl HashResolver {
    pub fn new(cache: HashCache, lookup: impl HashLookup + 'static) -> Self {
        Self {
            cache,
            lookup: Box::new(lookup),
        }
    }

    pub fn cache(&self) -> &HashCache {
        &self.cache
    }

    pub fn flush_cache(&mut self) -> Result<()> {
        self.cache.flush()
    }

    pub fn resolve(&mut self, hash: &str, context: &str) -> Resolution {
        let key = normalize_hash_key(hash);
        if key.is_empty() {
            warn!(context, "empty hash, nothing to resolve");
            return Resolution::Fallback(UNKNOWN_HASH.to_string());
        }

        if let Some(cached) = self.cache.get(&key) {
            debug!(context, hash = %key, value = cached.as_stored(), "hash cache hit");
            return cached.into();
        }

        let prefix: String = key.chars().take(SHORT_HASH_LEN).collect();
        info!(
            context,
            hash = %key,
            lookup = self.lookup.name(),
            "Cache miss, querying lookup service"
        );
        match self.lookup.lookup(&prefix) {
            LookupOutcome::Found(id) => {
                let id = id.to_ascii_uppercase();
                info!(context, prefix = %prefix, autov2 = %id, "lookup resolved hash");
                self.cache.insert(&key, CachedHash::Resolved(id.clone()));
                Resolution::Resolved(id)
            }
            LookupOutcome::NotFound => {
                info!(context, prefix = %prefix, "hash not found on lookup service (404)");
                self.cache.insert(&key, CachedHash::NotFound);
                Resolution::NotFound
            }
            LookupOutcome::NoIdentifier => {
                warn!(context, prefix = %prefix, "hash found but response carried no AutoV2 identifier");
                self.cache.insert(&key, CachedHash::NotFound);
                Resolution::NotFound
            }
            LookupOutcome::Transient(reason) => {
                warn!(context, prefix = %prefix, %reason, "lookup failed, using local short hash");
                Resolution::Fallback(prefix)
            }
        }
    }
}

impl fmt::Debug for HashResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashResolver")
            .field("cache", &self.cache)
            .field("lookup", &self.lookup.name())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::rc::Rc;
    use std::thread;
    use std::time::Duration;

    use civitmeta_contracts::cache::{HashCache, MemoryBackend, NOT_FOUND_SENTINEL};
    use serde_json::json;

    use super::{
        autov2_from_payload, shorten_hash, CivitaiLookup, HashLookup, HashResolver,
        LookupOutcome, OfflineLookup, Resolution,
    };

    /// Replays scripted outcomes and records every prefix it was asked for.
    #[derive(Clone, Default)]
    pub(crate) struct ScriptedLookup {
        outcomes: Rc<RefCell<VecDeque<LookupOutcome>>>,
        calls: Rc<RefCell<Vec<String>>>,
    }

    impl ScriptedLookup {
        pub(crate) fn new(outcomes: Vec<LookupOutcome>) -> Self {
            Self {
                outcomes: Rc::new(RefCell::new(outcomes.into())),
                calls: Rc::default(),
            }
        }

        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls.borrow().clone()
        }
    }

    impl HashLookup for ScriptedLookup {
        fn name(&self) -> &str {
            "scripted"
        }

        fn lookup(&self, hash_prefix: &str) -> LookupOutcome {
            self.calls.borrow_mut().push(hash_prefix.to_string());
            self.outcomes
                .borrow_mut()
                .pop_front()
                .unwrap_or_else(|| LookupOutcome::Transient("script exhausted".to_string()))
        }
    }

    fn resolver_with(lookup: ScriptedLookup) -> (HashResolver, MemoryBackend) {
        let backend = MemoryBackend::new();
        let cache = HashCache::load(backend.clone());
        (HashResolver::new(cache, lookup), backend)
    }

    const HASH: &str = "0xa4f81ec6c80bead5b00e819896c0ef9c017490e89cfdce572b893423ee40e88c";

    #[test]
    fn resolved_identifier_is_cached() -> anyhow::Result<()> {
        let lookup = ScriptedLookup::new(vec![LookupOutcome::Found("9A1B2C3D4E".to_string())]);
        let (mut resolver, backend) = resolver_with(lookup.clone());

        assert_eq!(
            resolver.resolve(HASH, "model: test"),
            Resolution::Resolved("9A1B2C3D4E".to_string())
        );
        assert_eq!(
            resolver.resolve(&HASH.to_uppercase(), "model: test"),
            Resolution::Resolved("9A1B2C3D4E".to_string())
        );
        assert_eq!(lookup.calls(), vec!["A4F81EC6C80B".to_string()]);

        resolver.flush_cache()?;
        let saved = backend.snapshot().unwrap_or_default();
        assert_eq!(
            saved.get("A4F81EC6C80BEAD5B00E819896C0EF9C017490E89CFDCE572B893423EE40E88C"),
            Some(&"9A1B2C3D4E".to_string())
        );
        Ok(())
    }

    #[test]
    fn not_found_is_cached_negative() {
        let lookup = ScriptedLookup::new(vec![LookupOutcome::NotFound]);
        let (mut resolver, _) = resolver_with(lookup.clone());

        assert_eq!(resolver.resolve(HASH, "lora"), Resolution::NotFound);
        assert_eq!(resolver.resolve(HASH, "lora"), Resolution::NotFound);
        assert_eq!(resolver.resolve(HASH, "lora").to_string(), NOT_FOUND_SENTINEL);
        assert_eq!(lookup.calls().len(), 1);
    }

    #[test]
    fn missing_identifier_is_cached_negative() {
        let lookup = ScriptedLookup::new(vec![LookupOutcome::NoIdentifier]);
        let (mut resolver, _) = resolver_with(lookup.clone());

        assert_eq!(resolver.resolve("abcdef0123456789", "model"), Resolution::NotFound);
        assert_eq!(resolver.resolve("ABCDEF0123456789", "model"), Resolution::NotFound);
        assert_eq!(lookup.calls().len(), 1);
    }

    #[test]
    fn transient_failure_falls_back_and_retries() {
        let lookup = ScriptedLookup::new(vec![
            LookupOutcome::Transient("timed out".to_string()),
            LookupOutcome::Transient("status 503".to_string()),
        ]);
        let (mut resolver, _) = resolver_with(lookup.clone());

        assert_eq!(
            resolver.resolve(HASH, "model"),
            Resolution::Fallback("A4F81EC6C80B".to_string())
        );
        assert_eq!(
            resolver.resolve(HASH, "model"),
            Resolution::Fallback("A4F81EC6C80B".to_string())
        );
        assert_eq!(lookup.calls().len(), 2);
        assert!(resolver.cache().is_empty());
    }

    #[test]
    fn offline_lookup_never_caches() {
        let mut resolver = HashResolver::new(HashCache::load(MemoryBackend::new()), OfflineLookup);
        let resolution = resolver.resolve("deadbeefcafe0011", "model");
        assert_eq!(resolution, Resolution::Fallback("DEADBEEFCAFE".to_string()));
        assert!(!resolution.is_cached_outcome());
        assert!(resolver.cache().is_empty());
    }

    #[test]
    fn three_outcomes_render_distinguishably() {
        let resolved = Resolution::Resolved("9A1B2C3D4E".to_string()).to_string();
        let absent = Resolution::NotFound.to_string();
        let fallback = Resolution::Fallback("A4F81EC6C80B".to_string()).to_string();
        assert_ne!(resolved, absent);
        assert_ne!(resolved, fallback);
        assert_ne!(absent, fallback);
        assert_eq!(resolved.len(), 10);
        assert_eq!(fallback.len(), 12);
    }

    #[test]
    fn shorten_hash_handles_prefix_and_empty() {
        assert_eq!(shorten_hash(HASH), "a4f81ec6c80b");
        assert_eq!(shorten_hash("1234567890abcdef"), "1234567890ab");
        assert_eq!(shorten_hash("abc"), "abc");
        assert_eq!(shorten_hash(""), "unknown");
    }

    #[test]
    fn autov2_is_taken_from_first_file_carrying_it() {
        let payload = json!({
            "files": [
                { "hashes": { "SHA256": "FF" } },
                { "hashes": { "AutoV2": "  " } },
                { "hashes": { "AutoV2": "abcdef1234" } }
            ]
        });
        assert_eq!(autov2_from_payload(&payload), Some("ABCDEF1234".to_string()));
        assert_eq!(autov2_from_payload(&json!({ "files": [] })), None);
        assert_eq!(autov2_from_payload(&json!({ "id": 1 })), None);
    }

    /// Serves one canned HTTP response and returns the request line it saw.
    fn serve_once(status_line: &'static str, body: &'static str) -> (String, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind test listener");
        let base = format!("http://{}", listener.local_addr().expect("local addr"));
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            let mut reader = BufReader::new(stream.try_clone().expect("clone stream"));
            let mut request_line = String::new();
            reader.read_line(&mut request_line).expect("read request line");
            loop {
                let mut header = String::new();
                if reader.read_line(&mut header).unwrap_or(0) == 0 || header == "\r\n" {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 {status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).expect("write response");
            request_line
        });
        (base, handle)
    }

    #[test]
    fn civitai_lookup_maps_success() -> anyhow::Result<()> {
        let (base, handle) = serve_once(
            "200 OK",
            r#"{"files":[{"hashes":{"AutoV2":"c1d2e3f4a5"}}]}"#,
        );
        let client = CivitaiLookup::new(&format!("{base}/api/v1/"), Duration::from_secs(5))?;
        assert_eq!(
            client.lookup("A4F81EC6C80B"),
            LookupOutcome::Found("C1D2E3F4A5".to_string())
        );
        let request_line = handle.join().expect("server thread");
        assert!(request_line.starts_with("GET /api/v1/model-versions/by-hash/A4F81EC6C80B "));
        Ok(())
    }

    #[test]
    fn civitai_lookup_maps_not_found() -> anyhow::Result<()> {
        let (base, handle) = serve_once("404 Not Found", r#"{"error":"Model not found"}"#);
        let client = CivitaiLookup::new(&base, Duration::from_secs(5))?;
        assert_eq!(client.lookup("000000000000"), LookupOutcome::NotFound);
        handle.join().expect("server thread");
        Ok(())
    }

    #[test]
    fn civitai_lookup_maps_server_error_to_transient() -> anyhow::Result<()> {
        let (base, handle) = serve_once("503 Service Unavailable", "{}");
        let client = CivitaiLookup::new(&base, Duration::from_secs(5))?;
        assert!(matches!(
            client.lookup("000000000000"),
            LookupOutcome::Transient(_)
        ));
        handle.join().expect("server thread");
        Ok(())
    }

    #[test]
    fn civitai_lookup_maps_bad_body_to_transient() -> anyhow::Result<()> {
        let (base, handle) = serve_once("200 OK", "<html>oops</html>");
        let client = CivitaiLookup::new(&base, Duration::from_secs(5))?;
        assert!(matches!(
            client.lookup("000000000000"),
            LookupOutcome::Transient(_)
        ));
        handle.join().expect("server thread");
        Ok(())
    }

    #[test]
    fn civitai_lookup_maps_timeout_to_transient() -> anyhow::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let base = format!("http://{}", listener.local_addr()?);
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().expect("accept");
            thread::sleep(Duration::from_secs(3));
            drop(stream);
        });
        let client = CivitaiLookup::new(&base, Duration::from_secs(1))?;
        let outcome = client.lookup("000000000000");
        assert!(
            matches!(outcome, LookupOutcome::Transient(_)),
            "unexpected outcome: {outcome:?}"
        );
        handle.join().expect("server thread");
        Ok(())
    }

    #[test]
    fn civitai_lookup_maps_refused_connection_to_transient() -> anyhow::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        drop(listener);
        let client = CivitaiLookup::new(&format!("http://{addr}"), Duration::from_secs(2))?;
        assert!(matches!(
            client.lookup("000000000000"),
            LookupOutcome::Transient(_)
        ));
        Ok(())
    }
}
