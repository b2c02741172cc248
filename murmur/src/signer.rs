//! The signing capability.
//!
//! The engine never holds the user's secret key itself: everything it publishes is signed
//! through a [`Signer`].  [`LocalSigner`] keeps an ed25519 key in memory, [`NoSigner`] is
//! used for read-only sessions.  Remote signers plug in behind the same trait.

use std::fmt;

use murmur_base::{Event, EventTemplate, PublicKey, SecretKey};
use murmur_relay::BoxFuture;
use snafu::Snafu;

/// Errors when signing a record.
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub))]
pub enum SignerError {
    #[snafu(display("no signer available"))]
    Unavailable {},
    #[snafu(display("signing was rejected: {reason}"))]
    Rejected { reason: String },
    #[snafu(display("signing failed"))]
    Failed {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
}

/// Signs records on behalf of the local identity.
pub trait Signer: fmt::Debug + Send + Sync + 'static {
    /// Whether [`Signer::sign_as_user`] can succeed at all.
    fn can_sign(&self) -> bool;

    /// The local identity, if known.
    fn public_key(&self) -> Option<PublicKey>;

    /// Signs a template as the local identity.
    ///
    /// Fills in the author and, if unset, the creation time.
    fn sign_as_user(&self, template: EventTemplate) -> BoxFuture<Result<Event, SignerError>>;

    /// Signs a template with an explicit key, e.g. an ephemeral one.
    fn sign_with_key(&self, template: EventTemplate, key: &SecretKey) -> Event {
        template.into_unsigned(key.public()).sign(key)
    }
}

impl<T: Signer + ?Sized> Signer for std::sync::Arc<T> {
    fn can_sign(&self) -> bool {
        self.as_ref().can_sign()
    }

    fn public_key(&self) -> Option<PublicKey> {
        self.as_ref().public_key()
    }

    fn sign_as_user(&self, template: EventTemplate) -> BoxFuture<Result<Event, SignerError>> {
        self.as_ref().sign_as_user(template)
    }
}

/// Signs with an in-memory secret key.
#[derive(Clone)]
pub struct LocalSigner(SecretKey);

impl fmt::Debug for LocalSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LocalSigner({})", self.0.public().fmt_short())
    }
}

impl LocalSigner {
    /// Creates a signer for the given key.
    pub fn new(key: SecretKey) -> Self {
        Self(key)
    }

    /// Creates a signer with a freshly generated key.
    pub fn generate() -> Self {
        Self(SecretKey::generate(&mut rand::rngs::OsRng))
    }

    /// The secret key.
    pub fn secret_key(&self) -> &SecretKey {
        &self.0
    }
}

impl Signer for LocalSigner {
    fn can_sign(&self) -> bool {
        true
    }

    fn public_key(&self) -> Option<PublicKey> {
        Some(self.0.public())
    }

    fn sign_as_user(&self, template: EventTemplate) -> BoxFuture<Result<Event, SignerError>> {
        let event = self.sign_with_key(template, &self.0);
        Box::pin(async move { Ok(event) })
    }
}

/// A signer for read-only sessions, it never signs.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSigner;

impl Signer for NoSigner {
    fn can_sign(&self) -> bool {
        false
    }

    fn public_key(&self) -> Option<PublicKey> {
        None
    }

    fn sign_as_user(&self, _template: EventTemplate) -> BoxFuture<Result<Event, SignerError>> {
        Box::pin(async { Err(UnavailableSnafu.build()) })
    }
}

#[cfg(test)]
mod tests {
    use murmur_base::{Kind, Timestamp};

    use super::*;

    #[tokio::test]
    async fn test_local_signer() {
        let key = SecretKey::from_bytes(&[7u8; 32]);
        let signer = LocalSigner::new(key.clone());
        assert!(signer.can_sign());
        assert_eq!(signer.public_key(), Some(key.public()));

        let template =
            EventTemplate::new(Kind::TEXT_NOTE, "hello").created_at(Timestamp::from_secs(5));
        let event = signer.sign_as_user(template).await.unwrap();
        assert_eq!(event.pubkey, key.public());
        assert_eq!(event.created_at, Timestamp::from_secs(5));
        event.verify().unwrap();
    }

    #[tokio::test]
    async fn test_no_signer() {
        let signer = NoSigner;
        assert!(!signer.can_sign());
        let res = signer
            .sign_as_user(EventTemplate::new(Kind::TEXT_NOTE, ""))
            .await;
        assert!(matches!(res, Err(SignerError::Unavailable { .. })));

        // Explicit keys work without a user identity.
        let key = SecretKey::from_bytes(&[1u8; 32]);
        let event = signer.sign_with_key(EventTemplate::new(Kind::AUTH, ""), &key);
        assert_eq!(event.pubkey, key.public());
    }
}
