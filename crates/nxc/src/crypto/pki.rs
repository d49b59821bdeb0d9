use rsa::signature::Verifier;
use rsa::{pss, BigUint, RsaPublicKey};
use sha2::Sha256;

/// Outcome of a signature check. `Unchecked` means the public modulus needed
/// for it was not supplied, so nothing can be said either way.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SignatureStatus {
    Ok,
    Invalid,
    Unchecked,
}

impl SignatureStatus {
    pub fn is_ok(self) -> bool {
        self == SignatureStatus::Ok
    }
}

/// A raw RSA-2048 public modulus with the fixed exponent 0x10001.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RsaModulus(pub [u8; 0x100]);

impl RsaModulus {
    /// RSA-2048-PSS verification with SHA-256 and a 32-byte salt, the scheme
    /// used for all header signatures in these containers.
    pub fn verify_pss(&self, message: &[u8], signature: &[u8; 0x100]) -> SignatureStatus {
        let key = match RsaPublicKey::new(
            BigUint::from_bytes_be(&self.0),
            BigUint::from(0x10001u32),
        ) {
            Ok(key) => key,
            Err(_) => return SignatureStatus::Invalid,
        };

        let verifying_key = pss::VerifyingKey::<Sha256>::new_with_salt_len(key, 0x20);
        let signature = match pss::Signature::try_from(&signature[..]) {
            Ok(sig) => sig,
            Err(_) => return SignatureStatus::Invalid,
        };

        match verifying_key.verify(message, &signature) {
            Ok(()) => SignatureStatus::Ok,
            Err(_) => SignatureStatus::Invalid,
        }
    }
}

/// Public moduli anchoring the signature chains.
///
/// Kept apart from [`KeySet`](super::keyset::KeySet): the keyset is secret
/// material, these are trust anchors. Either retail or dev moduli may be
/// loaded; a missing modulus degrades the affected checks to
/// [`SignatureStatus::Unchecked`].
#[derive(Debug, Default, Clone)]
pub struct TrustAnchors {
    pub nca_header: Option<RsaModulus>,
    pub package2: Option<RsaModulus>,
}

impl TrustAnchors {
    pub fn verify_nca_header(
        &self,
        signed_area: &[u8],
        signature: &[u8; 0x100],
    ) -> SignatureStatus {
        match &self.nca_header {
            Some(modulus) => modulus.verify_pss(signed_area, signature),
            None => SignatureStatus::Unchecked,
        }
    }

    pub fn verify_package2(&self, signed_area: &[u8], signature: &[u8; 0x100]) -> SignatureStatus {
        match &self.package2 {
            Some(modulus) => modulus.verify_pss(signed_area, signature),
            None => SignatureStatus::Unchecked,
        }
    }
}
