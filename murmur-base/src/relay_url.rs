use std::{fmt, ops::Deref, str::FromStr, sync::Arc};

use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use url::Url;

/// Address of a relay, cheap to clone.
///
/// Relay urls are normalised when parsed: only the `ws` and `wss` schemes are accepted,
/// the host is lowercased and a bare root path is rendered without the trailing slash, so
/// `wss://Relay.Example.com/` and `wss://relay.example.com` are the same relay.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RelayUrl(Arc<Url>);

/// Can occur when parsing a string into a [`RelayUrl`].
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum RelayUrlParseError {
    #[snafu(display("failed to parse relay url"))]
    Parse { source: url::ParseError },
    #[snafu(display("unsupported relay url scheme: {scheme}"))]
    UnsupportedScheme { scheme: String },
    #[snafu(display("relay url has no host"))]
    MissingHost {},
}

impl TryFrom<Url> for RelayUrl {
    type Error = RelayUrlParseError;

    fn try_from(mut url: Url) -> Result<Self, Self::Error> {
        ensure!(
            matches!(url.scheme(), "ws" | "wss"),
            UnsupportedSchemeSnafu {
                scheme: url.scheme()
            }
        );
        url.host_str().context(MissingHostSnafu)?;
        url.set_fragment(None);
        Ok(Self(Arc::new(url)))
    }
}

impl FromStr for RelayUrl {
    type Err = RelayUrlParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let inner = Url::from_str(s.trim()).context(ParseSnafu)?;
        RelayUrl::try_from(inner)
    }
}

/// Read access to the normalised [`Url`].
impl Deref for RelayUrl {
    type Target = Url;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl RelayUrl {
    /// Whether the connection to this relay is encrypted.
    pub fn is_secure(&self) -> bool {
        self.0.scheme() == "wss"
    }
}

impl fmt::Display for RelayUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.0.as_str();
        if self.0.path() == "/" && self.0.query().is_none() {
            f.write_str(s.trim_end_matches('/'))
        } else {
            f.write_str(s)
        }
    }
}

impl fmt::Debug for RelayUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RelayUrl({:?})", self.to_string())
    }
}

impl Serialize for RelayUrl {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RelayUrl {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}
