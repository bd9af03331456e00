// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Here we select the cryptographic types that are used by default in the code base.
//! The whole code base should only:
//! - refer to those aliases and not use the individual scheme implementations
//! - not use the schemes in a way that break genericity (e.g. using their Struct impl functions)
//! - swap one of those aliases to point to another type if necessary

use std::fmt;
use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use fastcrypto::{
    ed25519,
    error::FastCryptoError,
    hash::{Blake2b256, HashFunction},
    traits::{KeyPair as _, Signer as _, ToFromBytes as _, VerifyingKey as _},
};
use serde::{Deserialize, Serialize};

/// Length in bytes of an ed25519 public key, and therefore of a node address.
pub const ADDRESS_LENGTH: usize = 32;

/// Identity of a node on the network, derived from its signing key.
///
/// The address is the raw ed25519 public key of the node, so holding an
/// address is enough to verify signatures produced by its owner. Addresses
/// are rendered in base64 on the wire and in logs.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeAddress([u8; ADDRESS_LENGTH]);

impl NodeAddress {
    pub fn new(bytes: [u8; ADDRESS_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn to_bytes(&self) -> [u8; ADDRESS_LENGTH] {
        self.0
    }

    /// Reconstructs the verifying key this address was derived from.
    pub fn verifying_key(&self) -> Result<OraclePublicKey, FastCryptoError> {
        Ok(OraclePublicKey(ed25519::Ed25519PublicKey::from_bytes(
            &self.0,
        )?))
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "{}", STANDARD.encode(self.0))
    }
}

impl fmt::Debug for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "{}", STANDARD.encode(self.0))
    }
}

impl FromStr for NodeAddress {
    type Err = FastCryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = STANDARD
            .decode(s)
            .map_err(|_| FastCryptoError::InvalidInput)?;
        let bytes: [u8; ADDRESS_LENGTH] =
            bytes.try_into().map_err(|_| FastCryptoError::InvalidInput)?;
        Ok(Self(bytes))
    }
}

/// Oracle key is used for signing protocol messages, median entries and
/// epoch agreements, and for verifying all of the above.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OraclePublicKey(ed25519::Ed25519PublicKey);
pub struct OracleKeyPair(ed25519::Ed25519KeyPair);
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OracleSignature(ed25519::Ed25519Signature);

impl OraclePublicKey {
    pub fn new(key: ed25519::Ed25519PublicKey) -> Self {
        Self(key)
    }

    pub fn verify(
        &self,
        message: &[u8],
        signature: &OracleSignature,
    ) -> Result<(), FastCryptoError> {
        self.0.verify(message, &signature.0)
    }

    pub fn to_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl OracleKeyPair {
    pub fn new(keypair: ed25519::Ed25519KeyPair) -> Self {
        Self(keypair)
    }

    pub fn generate<R: rand::Rng + fastcrypto::traits::AllowedRng>(rng: &mut R) -> Self {
        Self(ed25519::Ed25519KeyPair::generate(rng))
    }

    pub fn public(&self) -> OraclePublicKey {
        OraclePublicKey(self.0.public().clone())
    }

    /// The network identity of the owner of this keypair.
    pub fn address(&self) -> NodeAddress {
        let bytes: [u8; ADDRESS_LENGTH] = self
            .0
            .public()
            .as_bytes()
            .try_into()
            .expect("ed25519 public key is 32 bytes");
        NodeAddress(bytes)
    }

    pub fn sign(&self, message: &[u8]) -> OracleSignature {
        OracleSignature(self.0.sign(message))
    }
}

impl Clone for OracleKeyPair {
    fn clone(&self) -> Self {
        Self(self.0.copy())
    }
}

impl OracleSignature {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FastCryptoError> {
        Ok(Self(ed25519::Ed25519Signature::from_bytes(bytes)?))
    }

    pub fn to_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

/// Defines algorithm and format of content and agreement digests.
pub type DefaultHashFunction = Blake2b256;
pub const DIGEST_LENGTH: usize = DefaultHashFunction::OUTPUT_SIZE;

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn address_round_trips_through_display() {
        let mut rng = StdRng::from_seed([7; 32]);
        let keypair = OracleKeyPair::generate(&mut rng);
        let address = keypair.address();

        let rendered = address.to_string();
        let parsed: NodeAddress = rendered.parse().unwrap();
        assert_eq!(address, parsed);
    }

    #[test]
    fn address_verifies_owner_signatures() {
        let mut rng = StdRng::from_seed([8; 32]);
        let keypair = OracleKeyPair::generate(&mut rng);
        let other = OracleKeyPair::generate(&mut rng);

        let message = b"availability";
        let signature = keypair.sign(message);

        let key = keypair.address().verifying_key().unwrap();
        assert!(key.verify(message, &signature).is_ok());

        let wrong_key = other.address().verifying_key().unwrap();
        assert!(wrong_key.verify(message, &signature).is_err());
    }

    #[test]
    fn address_is_stable_under_serde() {
        let mut rng = StdRng::from_seed([9; 32]);
        let keypair = OracleKeyPair::generate(&mut rng);
        let address = keypair.address();

        let bytes = bcs::to_bytes(&address).unwrap();
        let decoded: NodeAddress = bcs::from_bytes(&bytes).unwrap();
        assert_eq!(address, decoded);
    }
}
