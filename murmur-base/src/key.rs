//! Author keys and record signatures.
//!
//! Every key and signature travels as lowercase hex on the wire, in JSON and in config
//! files, so all of them share the same textual encoding.

use std::{
    fmt::{self, Debug, Display},
    str::FromStr,
};

use data_encoding::HEXLOWER;
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand_core::CryptoRngCore;
use snafu::{Snafu, ensure};

/// Implements serde for a type through its hex [`Display`] and [`FromStr`] forms.
macro_rules! hex_serde {
    ($ty:ty) => {
        impl serde::Serialize for $ty {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(&HexOf(self))
            }
        }

        impl<'de> serde::Deserialize<'de> for $ty {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let text = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
                text.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

/// Byte access shared by everything with a hex encoding.
trait HexBytes {
    fn hex_bytes(&self) -> Vec<u8>;
}

struct HexOf<'a, T>(&'a T);

impl<T: HexBytes> Display for HexOf<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        HEXLOWER.encode_write(&self.0.hex_bytes(), f)
    }
}

/// Identity of a record author.
///
/// Only valid curve points can be constructed, so verifying against a `PublicKey` never has
/// to deal with a malformed key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    /// Size of the encoded key in bytes.
    pub const LENGTH: usize = ed25519_dalek::PUBLIC_KEY_LENGTH;

    /// The raw key.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parses raw key bytes, rejecting anything which is not a curve point.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, KeyParsingError> {
        let verifying = VerifyingKey::from_bytes(bytes)?;
        Ok(Self(verifying.to_bytes()))
    }

    /// Checks `signature` over `message` in strict mode.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), SignatureError> {
        VerifyingKey::from_bytes(&self.0)
            .and_then(|verifying| verifying.verify_strict(message, &signature.0))
            .map_err(|_| SignatureSnafu.build())
    }

    /// The first five bytes in hex, enough to tell keys apart in logs.
    pub fn fmt_short(&self) -> impl Display + 'static {
        let mut prefix = [0u8; 5];
        prefix.copy_from_slice(&self.0[..5]);
        HEXLOWER.encode(&prefix)
    }
}

impl HexBytes for PublicKey {
    fn hex_bytes(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&HexOf(self), f)
    }
}

impl Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.fmt_short())
    }
}

impl FromStr for PublicKey {
    type Err = KeyParsingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_bytes(&decode_hex(s)?)
    }
}

hex_serde!(PublicKey);

/// Signing half of an author identity.
///
/// Never printed, the [`Debug`] output is redacted.
#[derive(Clone)]
pub struct SecretKey(SigningKey);

impl SecretKey {
    /// Creates a fresh key from `rng`.
    ///
    /// ```rust
    /// let key = murmur_base::SecretKey::generate(&mut rand::rngs::OsRng);
    /// println!("{}", key.public());
    /// ```
    pub fn generate<R: CryptoRngCore + ?Sized>(rng: &mut R) -> Self {
        Self(SigningKey::generate(rng))
    }

    /// Rebuilds a key from its 32 secret bytes.
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self(SigningKey::from_bytes(bytes))
    }

    /// The 32 secret bytes.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    /// The matching [`PublicKey`].
    pub fn public(&self) -> PublicKey {
        PublicKey(self.0.verifying_key().to_bytes())
    }

    /// Signs `message`.
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.0.sign(message))
    }
}

impl HexBytes for SecretKey {
    fn hex_bytes(&self) -> Vec<u8> {
        self.to_bytes().to_vec()
    }
}

impl Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

impl FromStr for SecretKey {
    type Err = KeyParsingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_hex(s).map(|bytes| Self::from_bytes(&bytes))
    }
}

hex_serde!(SecretKey);

/// Ed25519 signature over a record id.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature(ed25519_dalek::Signature);

impl Signature {
    /// Size of a signature in bytes.
    pub const LENGTH: usize = ed25519_dalek::Signature::BYTE_SIZE;

    /// Wraps raw signature bytes.
    pub fn from_bytes(bytes: &[u8; Self::LENGTH]) -> Self {
        Self(ed25519_dalek::Signature::from_bytes(bytes))
    }

    /// The raw signature bytes.
    pub fn to_bytes(&self) -> [u8; Self::LENGTH] {
        self.0.to_bytes()
    }
}

impl HexBytes for Signature {
    fn hex_bytes(&self) -> Vec<u8> {
        self.to_bytes().to_vec()
    }
}

impl Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&HexOf(self), f)
    }
}

impl Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.to_bytes();
        write!(f, "Signature({}..)", HEXLOWER.encode(&bytes[..8]))
    }
}

impl FromStr for Signature {
    type Err = KeyParsingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_hex(s).map(|bytes| Self::from_bytes(&bytes))
    }
}

hex_serde!(Signature);

/// A key or signature could not be parsed.
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum KeyParsingError {
    #[snafu(display("invalid hex"), context(false))]
    Decode { source: data_encoding::DecodeError },
    #[snafu(display("not a valid ed25519 key"), context(false))]
    Key { source: ed25519_dalek::SignatureError },
    #[snafu(display("expected {expected} hex characters, got {actual}"))]
    InvalidLength { expected: usize, actual: usize },
}

/// A signature did not verify.
#[derive(Debug, Snafu)]
#[snafu(display("invalid signature"))]
pub struct SignatureError {}

/// Decodes exactly `N` bytes of hex, in either case.
pub(crate) fn decode_hex<const N: usize>(s: &str) -> Result<[u8; N], KeyParsingError> {
    ensure!(
        s.len() == N * 2,
        InvalidLengthSnafu {
            expected: N * 2,
            actual: s.len(),
        }
    );
    let mut bytes = [0u8; N];
    HEXLOWER
        .decode_mut(s.to_ascii_lowercase().as_bytes(), &mut bytes)
        .map_err(|partial| partial.error)?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;

    fn key(seed: u64) -> SecretKey {
        SecretKey::generate(&mut rand_chacha::ChaCha8Rng::seed_from_u64(seed))
    }

    #[test]
    fn test_public_key_text_forms() {
        let public = key(0).public();
        let hex = public.to_string();
        assert_eq!(hex.len(), 64);
        assert!(hex.starts_with(&public.fmt_short().to_string()));
        assert_eq!(public.fmt_short().to_string().len(), 10);
        assert_eq!(hex.parse::<PublicKey>().unwrap(), public);
        assert_eq!(hex.to_ascii_uppercase().parse::<PublicKey>().unwrap(), public);
    }

    #[test]
    fn test_rejects_malformed_keys() {
        assert!(matches!(
            "abcd".parse::<PublicKey>(),
            Err(KeyParsingError::InvalidLength { expected: 64, actual: 4 })
        ));
        assert!(matches!(
            "zz".repeat(32).parse::<PublicKey>(),
            Err(KeyParsingError::Decode { .. })
        ));
    }

    #[test]
    fn test_json_uses_hex() {
        let secret = key(1);
        let json = serde_json::to_string(&secret).unwrap();
        assert_eq!(json, format!("\"{}\"", HEXLOWER.encode(&secret.to_bytes())));
        let back: SecretKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back.public(), secret.public());

        let public: PublicKey =
            serde_json::from_str(&serde_json::to_string(&secret.public()).unwrap()).unwrap();
        assert_eq!(public, secret.public());
    }

    #[test]
    fn test_sign_and_verify() {
        let secret = key(2);
        let signature = secret.sign(b"hello world");
        let parsed: Signature = signature.to_string().parse().unwrap();
        assert_eq!(parsed, signature);

        secret.public().verify(b"hello world", &parsed).unwrap();
        assert!(secret.public().verify(b"hello there", &parsed).is_err());
        assert!(key(3).public().verify(b"hello world", &parsed).is_err());
    }
}
