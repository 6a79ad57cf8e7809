use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

/// Identity claims issued by the auth provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email_verified: bool,
    pub exp: usize,
    pub iat: usize,
}

#[derive(Clone)]
pub struct JWTKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl JWTKeys {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
        }
    }

    pub fn verify(&self, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
        decode::<Claims>(token, &self.decoding, &Validation::default()).map(|data| data.claims)
    }

    /// Signs a token valid for one week.
    pub fn sign(
        &self,
        user_id: &str,
        email: &str,
        name: Option<&str>,
        email_verified: bool,
    ) -> Result<String, jsonwebtoken::errors::Error> {
        let now = Utc::now().timestamp() as usize;
        let claims = Claims {
            sub: user_id.to_string(),
            email: email.to_string(),
            name: name.map(str::to_string),
            email_verified,
            exp: now + 3600 * 24 * 7,
            iat: now,
        };
        encode(&Header::default(), &claims, &self.encoding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_token_verifies_with_same_secret() {
        let keys = JWTKeys::new(b"secret");
        let token = keys.sign("user_1", "a@b.co", Some("Ann"), true).unwrap();
        let claims = keys.verify(&token).unwrap();
        assert_eq!(claims.sub, "user_1");
        assert!(claims.email_verified);

        let other = JWTKeys::new(b"other");
        assert!(other.verify(&token).is_err());
    }
}
