use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Credential payload submitted to a tenant's token endpoint.
///
/// Cached verbatim after a successful login so the token can be renewed later
/// without asking for the password again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthPayload {
    pub user: String,
    pub password_hash: String,
    pub hospital_code: String,
}

impl AuthPayload {
    pub fn create(
        username: &str,
        password: &str,
        secret: &str,
        hospital_code: &str,
    ) -> Result<Self, hmac::digest::InvalidLength> {
        Ok(Self {
            user: username.to_string(),
            password_hash: hash_password(password, secret)?,
            hospital_code: hospital_code.to_string(),
        })
    }
}

/// HMAC-SHA256 of the password keyed with the tenant secret, hex encoded.
pub fn hash_password(password: &str, secret: &str) -> Result<String, hmac::digest::InvalidLength> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())?;
    mac.update(password.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}
