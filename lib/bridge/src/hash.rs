use std::{fmt, str::FromStr};

/// The hash of a module's bytes.
///
/// Used to tell loaded modules apart in logs and from the host.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ModuleHash([u8; 32]);

impl ModuleHash {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Hash a module's bytes.
    ///
    /// # Note:
    /// This does no verification that the supplied data
    /// is, in fact, a wasm module.
    pub fn generate(wasm: &[u8]) -> Self {
        Self::new(blake3::hash(wasm).into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for ModuleHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum ParseModuleHashError {
    #[error("module hashes must be hexadecimal")]
    NotHex(#[from] hex::FromHexError),
    #[error("module hashes are 32 bytes long, found {0}")]
    WrongLength(usize),
}

impl FromStr for ModuleHash {
    type Err = ParseModuleHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        let array: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| ParseModuleHashError::WrongLength(bytes.len()))?;
        Ok(Self(array))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_parse_agree() {
        let hash = ModuleHash::generate(b"\0asm\x01\0\0\0");
        let parsed: ModuleHash = hash.to_string().parse().unwrap();

        assert_eq!(parsed, hash);
        assert_eq!(hash.to_string().len(), 64);
    }

    #[test]
    fn rejects_short_hashes() {
        assert_eq!(
            "abcd".parse::<ModuleHash>(),
            Err(ParseModuleHashError::WrongLength(2))
        );
        assert!(matches!(
            "not hex".parse::<ModuleHash>(),
            Err(ParseModuleHashError::NotHex(_))
        ));
    }
}
