//! Token issuance and verification for the front door.
//!
//! Tokens are self-contained: a base64url JSON claims segment plus an
//! HMAC-SHA256 signature over it, signed with the configured secret. No
//! token state is kept server side; revocation happens by rotating the
//! secret.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use openssl::hash::MessageDigest;
use openssl::memcmp;
use openssl::pkey::{PKey, Private};
use openssl::sign::Signer;
use serde::{Deserialize, Serialize};

use crate::api::subject::{Subject, Timestamp};
use crate::commons::{Error, WardResult};
use crate::constants::ADMIN_IDENTITY;

//------------ Token ---------------------------------------------------------

/// An opaque bearer token as handed to clients.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Token(String);

impl Token {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Token {
    fn from(s: String) -> Self {
        Token(s)
    }
}

//------------ Identity ------------------------------------------------------

/// An authenticated caller.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Identity {
    name: String,
    admin: bool,
}

impl Identity {
    pub fn admin() -> Self {
        Identity {
            name: ADMIN_IDENTITY.to_string(),
            admin: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_admin(&self) -> bool {
        self.admin
    }

    /// Whether this caller may see a subject: admins always, other
    /// callers only when they are one of its deployment targets.
    pub fn may_access(&self, subject: &Subject) -> bool {
        self.admin || subject.targets.iter().any(|t| t == &self.name)
    }
}

//------------ Claims --------------------------------------------------------

#[derive(Debug, Deserialize, Serialize)]
struct Claims {
    sub: String,
    exp: i64,
    adm: bool,
}

//------------ TokenService --------------------------------------------------

pub struct TokenService {
    key: PKey<Private>,
    validity_secs: i64,
}

impl TokenService {
    pub fn new(secret: &[u8], validity_secs: i64) -> WardResult<Self> {
        Ok(TokenService {
            key: PKey::hmac(secret)?,
            validity_secs,
        })
    }

    pub fn issue(&self, name: &str, admin: bool) -> WardResult<Token> {
        let claims = Claims {
            sub: name.to_string(),
            exp: Timestamp::now_plus_seconds(self.validity_secs).timestamp(),
            adm: admin,
        };
        let payload =
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?);
        let signature = URL_SAFE_NO_PAD.encode(self.sign(payload.as_bytes())?);
        Ok(Token(format!("{payload}.{signature}")))
    }

    /// Verifies a presented token and returns the identity it names.
    ///
    /// All failure modes collapse into [`Error::Unauthorized`]; a caller
    /// learns nothing about why a token was refused.
    pub fn verify(&self, token: &str) -> WardResult<Identity> {
        let (payload, signature) =
            token.split_once('.').ok_or(Error::Unauthorized)?;

        let presented = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| Error::Unauthorized)?;
        let expected = self.sign(payload.as_bytes())?;
        if presented.len() != expected.len()
            || !memcmp::eq(&presented, &expected)
        {
            return Err(Error::Unauthorized);
        }

        let claims = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| Error::Unauthorized)?;
        let claims: Claims =
            serde_json::from_slice(&claims).map_err(|_| Error::Unauthorized)?;

        if Timestamp::new(claims.exp) < Timestamp::now() {
            return Err(Error::Unauthorized);
        }

        Ok(Identity {
            name: claims.sub,
            admin: claims.adm,
        })
    }

    fn sign(&self, data: &[u8]) -> WardResult<Vec<u8>> {
        let mut signer = Signer::new(MessageDigest::sha256(), &self.key)?;
        Ok(signer.sign_oneshot_to_vec(data)?)
    }
}

//============ Tests =========================================================
