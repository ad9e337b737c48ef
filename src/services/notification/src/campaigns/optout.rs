//! Signed opt-out links
//!
//! The signature is HMAC-SHA256 over `optout:<account id>`, URL-safe base64
//! without padding. The web tier verifies it before recording the opt-out.

use crate::error::{NotificationError, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use telehealth_shared::AccountId;
use url::Url;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct OptOutSigner {
    key: Vec<u8>,
}

impl OptOutSigner {
    pub fn new(key: impl AsRef<[u8]>) -> Self {
        Self {
            key: key.as_ref().to_vec(),
        }
    }

    fn mac(&self, account: AccountId) -> Result<HmacSha256> {
        if self.key.is_empty() {
            return Err(NotificationError::signing("opt-out signing key is not configured"));
        }
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| NotificationError::signing(e.to_string()))?;
        mac.update(format!("optout:{}", account).as_bytes());
        Ok(mac)
    }

    pub fn sign(&self, account: AccountId) -> Result<String> {
        Ok(URL_SAFE_NO_PAD.encode(self.mac(account)?.finalize().into_bytes()))
    }

    /// Constant-time check of a signature produced by [`sign`](Self::sign).
    pub fn verify(&self, account: AccountId, signature: &str) -> bool {
        let Ok(raw) = URL_SAFE_NO_PAD.decode(signature) else {
            return false;
        };
        match self.mac(account) {
            Ok(mac) => mac.verify_slice(&raw).is_ok(),
            Err(_) => false,
        }
    }

    /// `https://<web_domain>/e/optout?type=..&id=..&sig=..`
    pub fn opt_out_url(&self, web_domain: &str, email_type: &str, account: AccountId) -> Result<String> {
        let signature = self.sign(account)?;
        let url = Url::parse_with_params(
            &format!("https://{}/e/optout", web_domain),
            &[
                ("type", email_type),
                ("id", &account.to_string()),
                ("sig", &signature),
            ],
        )?;
        Ok(url.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_verifies_only_for_its_account() {
        let signer = OptOutSigner::new("secret");
        let sig = signer.sign(AccountId(42)).unwrap();

        assert!(signer.verify(AccountId(42), &sig));
        assert!(!signer.verify(AccountId(43), &sig));
        assert!(!OptOutSigner::new("other").verify(AccountId(42), &sig));
        assert!(!signer.verify(AccountId(42), "not base64 !"));
    }

    #[test]
    fn test_signature_is_url_safe() {
        let sig = OptOutSigner::new("secret").sign(AccountId(7)).unwrap();
        assert!(!sig.contains('='));
        assert!(!sig.contains('+'));
        assert!(!sig.contains('/'));
        assert_eq!(sig.len(), 43);
    }

    #[test]
    fn test_opt_out_url() {
        let signer = OptOutSigner::new("secret");
        let link = signer
            .opt_out_url("www.telehealth.dev", "abandoned-visit", AccountId(6))
            .unwrap();

        let parsed = Url::parse(&link).unwrap();
        assert_eq!(parsed.host_str(), Some("www.telehealth.dev"));
        assert_eq!(parsed.path(), "/e/optout");
        let pairs: Vec<(String, String)> = parsed.query_pairs().into_owned().collect();
        assert_eq!(pairs[0], ("type".to_string(), "abandoned-visit".to_string()));
        assert_eq!(pairs[1], ("id".to_string(), "6".to_string()));
        assert!(signer.verify(AccountId(6), &pairs[2].1));
    }

    #[test]
    fn test_missing_key_is_signing_error() {
        let err = OptOutSigner::new("").sign(AccountId(1)).unwrap_err();
        assert_eq!(err.error_code(), "SIGNING_ERROR");
    }
}
