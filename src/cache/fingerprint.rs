//! Deterministic cache-key derivation.
//!
//! `sha2::Sha256` over a stably-serialized subset of the request. Naive
//! hashing of the raw request yields a poor hit rate from incidental
//! differences, so every step here is explicit: lowercase/trim the prompt,
//! sort file hashes instead of hashing file order, and hash only the
//! option fields that change the answer.

use sha2::{Digest, Sha256};

use crate::model::Request;

/// A 256-bit cache key, hex-encoded for use as a map key and SQLite primary key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(pub String);

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn normalize_prompt(prompt: &str) -> String {
    prompt.trim().to_lowercase()
}

/// Hash each file's content independently, then sort the hashes — so
/// attaching the same files in a different order still fingerprints the
/// same request.
fn sorted_file_hashes(request: &Request) -> Vec<String> {
    let mut hashes: Vec<String> = request
        .files
        .iter()
        .map(|f| {
            let mut hasher = Sha256::new();
            hasher.update(f.path.as_bytes());
            hasher.update(b"\0");
            hasher.update(f.content.as_bytes());
            hex::encode(hasher.finalize())
        })
        .collect();
    hashes.sort();
    hashes
}

/// Only these option fields change what a backend would return for a given
/// prompt; everything else (timeouts, RAG toggles, bypass flag) is routing
/// metadata and must not perturb the key.
fn option_subset(request: &Request) -> serde_json::Value {
    serde_json::json!({
        "backend": request.options.backend,
        "model": request.options.model,
        "max_tokens": request.options.max_tokens,
        "temperature": request.options.temperature,
    })
}

pub fn compute(request: &Request) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(normalize_prompt(&request.prompt).as_bytes());
    for hash in sorted_file_hashes(request) {
        hasher.update(hash.as_bytes());
    }
    // serde_json::Value serializes object keys in insertion order, which is
    // fixed by `option_subset` above, so this is stable across calls.
    let options = serde_json::to_vec(&option_subset(request)).expect("json serialization of option subset cannot fail");
    hasher.update(&options);
    Fingerprint(hex::encode(hasher.finalize()))
}
