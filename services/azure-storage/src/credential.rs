use pipesign_core::time::{now, DateTime};
use std::fmt::{Debug, Formatter};

/// Credential used to authenticate outbound operations.
///
/// Immutable; clone freely across concurrent callers.
#[derive(Clone)]
pub enum Credential {
    /// Account name plus base64-encoded account key.
    SharedKey {
        /// Storage account name.
        account_name: String,
        /// Storage account key, base64 encoded.
        account_key: String,
    },
    /// A pre-built SAS token query string.
    SasToken {
        /// The token, without a leading `?`.
        token: String,
    },
    /// OAuth bearer token.
    BearerToken {
        /// The token itself.
        token: String,
        /// Expiration time, if known.
        expires_in: Option<DateTime>,
    },
}

/// Debug view of a secret. Secrets shorter than 16 characters render only
/// their length; longer ones keep the last four characters so two
/// credentials can still be told apart in logs.
struct Masked<'a>(&'a str);

impl Debug for Masked<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            return f.write_str("unset");
        }
        let chars: Vec<char> = self.0.chars().collect();
        if chars.len() < 16 {
            return write!(f, "[{} chars]", chars.len());
        }
        let tail: String = chars[chars.len() - 4..].iter().collect();
        write!(f, "[{} chars, ..{}]", chars.len(), tail)
    }
}

impl Debug for Credential {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::SharedKey {
                account_name,
                account_key,
            } => f
                .debug_struct("SharedKey")
                .field("account_name", account_name)
                .field("account_key", &Masked(account_key))
                .finish(),
            Credential::SasToken { token } => f
                .debug_struct("SasToken")
                .field("token", &Masked(token))
                .finish(),
            Credential::BearerToken { token, expires_in } => f
                .debug_struct("BearerToken")
                .field("token", &Masked(token))
                .field("expires_in", expires_in)
                .finish(),
        }
    }
}

impl Credential {
    /// Create a shared key credential.
    pub fn with_shared_key(
        account_name: impl Into<String>,
        account_key: impl Into<String>,
    ) -> Self {
        Self::SharedKey {
            account_name: account_name.into(),
            account_key: account_key.into(),
        }
    }

    /// Create a SAS token credential.
    pub fn with_sas_token(token: impl Into<String>) -> Self {
        Self::SasToken {
            token: token.into(),
        }
    }

    /// Create a bearer token credential.
    pub fn with_bearer_token(token: impl Into<String>, expires_in: Option<DateTime>) -> Self {
        Self::BearerToken {
            token: token.into(),
            expires_in,
        }
    }

    /// Check whether this credential can still sign requests.
    pub fn is_valid(&self) -> bool {
        match self {
            Credential::SharedKey {
                account_name,
                account_key,
            } => !account_name.is_empty() && !account_key.is_empty(),
            Credential::SasToken { token } => !token.is_empty(),
            Credential::BearerToken { token, expires_in } => {
                if token.is_empty() {
                    return false;
                }
                // 20s buffer to avoid signing with a token that expires mid-flight.
                match expires_in {
                    Some(v) => *v > now() + chrono::TimeDelta::try_seconds(20).expect("in bounds"),
                    None => true,
                }
            }
        }
    }
}
