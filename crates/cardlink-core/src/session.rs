/// Opaque key material owned by the secure-channel layer. The transport only
/// stores and forwards it; it never derives from or computes with it.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial(Vec<u8>);

impl KeyMaterial {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyMaterial({} bytes)", self.0.len())
    }
}

/// Secure-channel session handle: the key material, the challenge the card
/// issued at session open, and whether a fallback keyset is in use.
#[derive(Debug, Clone)]
pub struct SecureSession {
    keys: KeyMaterial,
    card_challenge: Vec<u8>,
    fallback_keys: bool,
}

impl SecureSession {
    pub fn new(keys: KeyMaterial, card_challenge: Vec<u8>) -> Self {
        Self {
            keys,
            card_challenge,
            fallback_keys: false,
        }
    }

    pub fn keys(&self) -> &KeyMaterial {
        &self.keys
    }

    pub fn card_challenge(&self) -> &[u8] {
        &self.card_challenge
    }

    /// Marks this session as running on a fallback keyset.
    pub fn mark_fallback_keys(&mut self) {
        self.fallback_keys = true;
    }

    pub fn uses_fallback_keys(&self) -> bool {
        self.fallback_keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output_never_leaks_key_bytes() {
        let keys = KeyMaterial::new(vec![0xaa; 32]);
        let rendered = format!("{keys:?}");
        assert_eq!(rendered, "KeyMaterial(32 bytes)");
        assert!(!rendered.contains("aa"));
    }

    #[test]
    fn session_starts_on_primary_keys() {
        let mut session = SecureSession::new(KeyMaterial::new(vec![1, 2, 3]), vec![9, 9]);
        assert!(!session.uses_fallback_keys());
        assert_eq!(session.card_challenge(), &[9, 9]);
        session.mark_fallback_keys();
        assert!(session.uses_fallback_keys());
        assert_eq!(session.keys().as_bytes(), &[1, 2, 3]);
    }
}
