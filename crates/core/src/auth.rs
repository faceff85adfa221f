/// Shared-secret check for the `token` query parameter.
///
/// Both sides are hashed with BLAKE3 and the digests compared; `blake3::Hash` equality is
/// constant time.
#[derive(Clone)]
pub struct AccessToken {
    digest: blake3::Hash,
}

impl AccessToken {
    pub fn new(secret: &str) -> Self {
        Self {
            digest: blake3::hash(secret.as_bytes()),
        }
    }

    pub fn verify(&self, presented: Option<&str>) -> bool {
        match presented {
            Some(token) if !token.is_empty() => blake3::hash(token.as_bytes()) == self.digest,
            _ => false,
        }
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AccessToken(<redacted>)")
    }
}
