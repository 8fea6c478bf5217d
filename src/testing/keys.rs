//! Random key generation for tests.

use bitcoin::secp256k1::PublicKey;
use bitcoin::secp256k1::SecretKey;
use bitcoin::secp256k1::SECP256K1;
use bitcoin::XOnlyPublicKey;

/// A random compressed public key.
pub fn random_public_key<R: rand::Rng + ?Sized>(rng: &mut R) -> PublicKey {
    let secret_key = SecretKey::new(rng);
    PublicKey::from_secret_key(SECP256K1, &secret_key)
}

/// A random x-only public key.
pub fn random_x_only_key<R: rand::Rng + ?Sized>(rng: &mut R) -> XOnlyPublicKey {
    random_public_key(rng).x_only_public_key().0
}
