//! Certificate manager — encrypted-at-rest key storage, renewal
//! scheduling, and HTTP-01 challenge plumbing.

mod crypto;
mod manager;

pub use crypto::{key_metadata, CryptoError, KeyCipher, KeyMetadata};
pub use manager::{CertManager, CertbotIssuer, IssuedCert, Issuer};
