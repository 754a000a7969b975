// mitm_injector::nonce
//
// Per-response CSP nonce.  128 bits from the OS CSPRNG, URL-safe base64
// without padding.

use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;

const NONCE_BYTES: usize = 16;

/// A single-use token tying one injected `<script>` to one `script-src`
/// grant.  Deliberately not `Clone`: the pipeline lends it out by reference.
#[derive(Debug, PartialEq, Eq)]
pub struct Nonce(String);

impl Nonce {
    pub fn generate() -> Self {
        let mut buf = [0u8; NONCE_BYTES];
        OsRng.fill_bytes(&mut buf);
        Nonce(URL_SAFE_NO_PAD.encode(buf))
    }

    /// Wrap a known value.  Used by callers that need deterministic output.
    pub fn from_value(value: impl Into<String>) -> Self {
        Nonce(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The CSP source expression, e.g. `'nonce-abc'`.
    pub fn source_expression(&self) -> String {
        format!("'nonce-{}'", self.0)
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
