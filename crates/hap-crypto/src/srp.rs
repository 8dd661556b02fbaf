//! SRP-6a for HomeKit pair-setup, accessory (server) and controller (client) sides.
//!
//! Uses 3072-bit prime (RFC 5054), generator g=5, SHA-512.

use hap_core::error::CryptoError;
use num_bigint::{BigUint, RandBigInt};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha512};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// N size in bytes (3072 bits = 384 bytes).
const N_BYTES: usize = 384;

/// RFC 5054 3072-bit prime N, big-endian.
const RFC5054_N_3072: [u8; N_BYTES] = [
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xC9, 0x0F, 0xDA, 0xA2,
    0x21, 0x68, 0xC2, 0x34, 0xC4, 0xC6, 0x62, 0x8B, 0x80, 0xDC, 0x1C, 0xD1,
    0x29, 0x02, 0x4E, 0x08, 0x8A, 0x67, 0xCC, 0x74, 0x02, 0x0B, 0xBE, 0xA6,
    0x3B, 0x13, 0x9B, 0x22, 0x51, 0x4A, 0x08, 0x79, 0x8E, 0x34, 0x04, 0xDD,
    0xEF, 0x95, 0x19, 0xB3, 0xCD, 0x3A, 0x43, 0x1B, 0x30, 0x2B, 0x0A, 0x6D,
    0xF2, 0x5F, 0x14, 0x37, 0x4F, 0xE1, 0x35, 0x6D, 0x6D, 0x51, 0xC2, 0x45,
    0xE4, 0x85, 0xB5, 0x76, 0x62, 0x5E, 0x7E, 0xC6, 0xF4, 0x4C, 0x42, 0xE9,
    0xA6, 0x37, 0xED, 0x6B, 0x0B, 0xFF, 0x5C, 0xB6, 0xF4, 0x06, 0xB7, 0xED,
    0xEE, 0x38, 0x6B, 0xFB, 0x5A, 0x89, 0x9F, 0xA5, 0xAE, 0x9F, 0x24, 0x11,
    0x7C, 0x4B, 0x1F, 0xE6, 0x49, 0x28, 0x66, 0x51, 0xEC, 0xE4, 0x5B, 0x3D,
    0xC2, 0x00, 0x7C, 0xB8, 0xA1, 0x63, 0xBF, 0x05, 0x98, 0xDA, 0x48, 0x36,
    0x1C, 0x55, 0xD3, 0x9A, 0x69, 0x16, 0x3F, 0xA8, 0xFD, 0x24, 0xCF, 0x5F,
    0x83, 0x65, 0x5D, 0x23, 0xDC, 0xA3, 0xAD, 0x96, 0x1C, 0x62, 0xF3, 0x56,
    0x20, 0x85, 0x52, 0xBB, 0x9E, 0xD5, 0x29, 0x07, 0x70, 0x96, 0x96, 0x6D,
    0x67, 0x0C, 0x35, 0x4E, 0x4A, 0xBC, 0x98, 0x04, 0xF1, 0x74, 0x6C, 0x08,
    0xCA, 0x18, 0x21, 0x7C, 0x32, 0x90, 0x5E, 0x46, 0x2E, 0x36, 0xCE, 0x3B,
    0xE3, 0x9E, 0x77, 0x2C, 0x18, 0x0E, 0x86, 0x03, 0x9B, 0x27, 0x83, 0xA2,
    0xEC, 0x07, 0xA2, 0x8F, 0xB5, 0xC5, 0x5D, 0xF0, 0x6F, 0x4C, 0x52, 0xC9,
    0xDE, 0x2B, 0xCB, 0xF6, 0x95, 0x58, 0x17, 0x18, 0x39, 0x95, 0x49, 0x7C,
    0xEA, 0x95, 0x6A, 0xE5, 0x15, 0xD2, 0x26, 0x18, 0x98, 0xFA, 0x05, 0x10,
    0x15, 0x72, 0x8E, 0x5A, 0x8A, 0xAA, 0xC4, 0x2D, 0xAD, 0x33, 0x17, 0x0D,
    0x04, 0x50, 0x7A, 0x33, 0xA8, 0x55, 0x21, 0xAB, 0xDF, 0x1C, 0xBA, 0x64,
    0xEC, 0xFB, 0x85, 0x04, 0x58, 0xDB, 0xEF, 0x0A, 0x8A, 0xEA, 0x71, 0x57,
    0x5D, 0x06, 0x0C, 0x7D, 0xB3, 0x97, 0x0F, 0x85, 0xA6, 0xE1, 0xE4, 0xC7,
    0xAB, 0xF5, 0xAE, 0x8C, 0xDB, 0x09, 0x33, 0xD7, 0x1E, 0x8C, 0x94, 0xE0,
    0x4A, 0x25, 0x61, 0x9D, 0xCE, 0xE3, 0xD2, 0x26, 0x1A, 0xD2, 0xEE, 0x6B,
    0xF1, 0x2F, 0xFA, 0x06, 0xD9, 0x8A, 0x08, 0x64, 0xD8, 0x76, 0x02, 0x73,
    0x3E, 0xC8, 0x6A, 0x64, 0x52, 0x1F, 0x2B, 0x18, 0x17, 0x7B, 0x20, 0x0C,
    0xBB, 0xE1, 0x17, 0x57, 0x7A, 0x61, 0x5D, 0x6C, 0x77, 0x09, 0x88, 0xC0,
    0xBA, 0xD9, 0x46, 0xE2, 0x08, 0xE2, 0x4F, 0xA0, 0x74, 0xE5, 0xAB, 0x31,
    0x43, 0xDB, 0x5B, 0xFC, 0xE0, 0xFD, 0x10, 0x8E, 0x4B, 0x82, 0xD1, 0x20,
    0xA9, 0x3A, 0xD2, 0xCA, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
];

/// SRP-6a parameters (3072-bit, RFC 5054).
pub struct SrpParams {
    /// Prime modulus N.
    pub n: BigUint,
    /// Generator g (always 5).
    pub g: BigUint,
}

impl Default for SrpParams {
    fn default() -> Self {
        let n = BigUint::from_bytes_be(&RFC5054_N_3072);
        let g = BigUint::from(5u32);
        Self { n, g }
    }
}

/// Client-side SRP state machine.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SrpClient {
    #[zeroize(skip)]
    params: SrpParams,
    identity: Vec<u8>,
    password: Vec<u8>,
    private_key: Vec<u8>,
    #[zeroize(skip)]
    public_key: BigUint,
}

/// Server challenge containing salt and public key.
pub struct SrpChallenge {
    pub salt: [u8; 16],
    pub server_public_key: Vec<u8>,
}

/// Result of processing a challenge.
pub struct SrpProof {
    pub client_proof: Vec<u8>,
    pub shared_secret: Vec<u8>,
    pub expected_server_proof: Vec<u8>,
}

impl SrpClient {
    /// Create new SRP client with identity and password.
    ///
    /// For HAP, identity is "Pair-Setup" and password is the setup code.
    pub fn new(identity: &[u8], password: &[u8]) -> Self {
        let params = SrpParams::default();

        // Generate random private key a (256 bits)
        let a = OsRng.gen_biguint(256);
        let private_key = a.to_bytes_be();

        // Compute public key A = g^a mod N
        let public_key = params.g.modpow(&a, &params.n);

        Self {
            params,
            identity: identity.to_vec(),
            password: password.to_vec(),
            private_key,
            public_key,
        }
    }

    /// Client public key A, padded to 384 bytes.
    pub fn public_key(&self) -> Vec<u8> {
        pad_to_n(&self.public_key)
    }

    /// Process the accessory's salt and B and produce M1.
    pub fn process_challenge(&self, challenge: &SrpChallenge) -> Result<SrpProof, CryptoError> {
        let b = BigUint::from_bytes_be(&challenge.server_public_key);

        if &b % &self.params.n == BigUint::ZERO {
            return Err(CryptoError::InvalidPublicKey(
                "server public key B mod N = 0".to_string(),
            ));
        }

        let a = BigUint::from_bytes_be(&self.private_key);

        // u = H(PAD(A) || PAD(B))
        let u = compute_u(&self.public_key, &b);
        if u == BigUint::ZERO {
            return Err(CryptoError::KeyDerivation("u = 0".to_string()));
        }

        let x = compute_x(&challenge.salt, &self.identity, &self.password);
        let k = compute_k(&self.params);

        // S = (B - k * g^x)^(a + u*x) mod N
        let g_x = self.params.g.modpow(&x, &self.params.n);
        let k_gx = (&k * &g_x) % &self.params.n;
        let base = if b >= k_gx {
            (&b - &k_gx) % &self.params.n
        } else {
            (&b + &self.params.n - &k_gx) % &self.params.n
        };
        let exponent = &a + &u * &x;
        let s = base.modpow(&exponent, &self.params.n);

        let shared_secret = hash_padded(&s);

        let client_proof = compute_m1(
            &self.params,
            &self.identity,
            &challenge.salt,
            &self.public_key,
            &b,
            &shared_secret,
        );
        let expected_server_proof = compute_m2(&self.public_key, &client_proof, &shared_secret);

        Ok(SrpProof {
            client_proof,
            shared_secret,
            expected_server_proof,
        })
    }

    /// Verify the accessory's proof M2.
    pub fn verify_server_proof(&self, proof: &[u8], expected: &[u8]) -> bool {
        proof.ct_eq(expected).into()
    }
}

/// Accessory-side SRP state for one pair-setup attempt.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SrpServer {
    #[zeroize(skip)]
    params: SrpParams,
    identity: Vec<u8>,
    salt: [u8; 16],
    #[zeroize(skip)]
    verifier: BigUint,
    private_key: Vec<u8>,
    #[zeroize(skip)]
    public_key: BigUint,
}

/// Outcome of a successful M3 verification.
pub struct SrpSession {
    /// Session key K = H(PAD(S)), 64 bytes.
    pub shared_secret: Vec<u8>,
    /// Accessory proof M2 to send back in M4.
    pub server_proof: Vec<u8>,
}

impl SrpServer {
    /// Fresh salt and ephemeral b for the given setup code.
    pub fn new(identity: &[u8], password: &[u8]) -> Self {
        let mut salt = [0u8; 16];
        OsRng.fill_bytes(&mut salt);
        let b = OsRng.gen_biguint(256);
        Self::with_salt_and_key(identity, password, salt, &b.to_bytes_be())
    }

    /// Deterministic construction from a known salt and private key.
    pub fn with_salt_and_key(
        identity: &[u8],
        password: &[u8],
        salt: [u8; 16],
        private_key: &[u8],
    ) -> Self {
        let params = SrpParams::default();
        let x = compute_x(&salt, identity, password);
        let verifier = params.g.modpow(&x, &params.n);

        // B = k*v + g^b mod N
        let b = BigUint::from_bytes_be(private_key);
        let k = compute_k(&params);
        let public_key = (&k * &verifier + params.g.modpow(&b, &params.n)) % &params.n;

        Self {
            params,
            identity: identity.to_vec(),
            salt,
            verifier,
            private_key: private_key.to_vec(),
            public_key,
        }
    }

    /// Salt sent in M2.
    pub fn salt(&self) -> [u8; 16] {
        self.salt
    }

    /// Accessory public key B, padded to 384 bytes.
    pub fn public_key(&self) -> Vec<u8> {
        pad_to_n(&self.public_key)
    }

    /// Check the controller's A and M1 and compute K and M2.
    pub fn verify_client(
        &self,
        client_public: &[u8],
        client_proof: &[u8],
    ) -> Result<SrpSession, CryptoError> {
        let a = BigUint::from_bytes_be(client_public);
        if &a % &self.params.n == BigUint::ZERO {
            return Err(CryptoError::InvalidPublicKey(
                "client public key A mod N = 0".to_string(),
            ));
        }

        let u = compute_u(&a, &self.public_key);
        if u == BigUint::ZERO {
            return Err(CryptoError::KeyDerivation("u = 0".to_string()));
        }

        // S = (A * v^u)^b mod N
        let b = BigUint::from_bytes_be(&self.private_key);
        let base = (&a * self.verifier.modpow(&u, &self.params.n)) % &self.params.n;
        let s = base.modpow(&b, &self.params.n);
        let shared_secret = hash_padded(&s);

        let expected = compute_m1(
            &self.params,
            &self.identity,
            &self.salt,
            &a,
            &self.public_key,
            &shared_secret,
        );
        if !bool::from(expected.ct_eq(client_proof)) {
            return Err(CryptoError::ProofMismatch);
        }

        let server_proof = compute_m2(&a, &expected, &shared_secret);
        Ok(SrpSession {
            shared_secret,
            server_proof,
        })
    }
}

/// Compute M1 = H(H(N) XOR H(g) || H(I) || salt || PAD(A) || PAD(B) || K)
fn compute_m1(
    params: &SrpParams,
    identity: &[u8],
    salt: &[u8],
    a: &BigUint,
    b: &BigUint,
    k: &[u8],
) -> Vec<u8> {
    let h_n = Sha512::digest(pad_to_n(&params.n));

    // H(g) hashes the unpadded generator byte; only k pads g.
    let h_g = Sha512::digest(params.g.to_bytes_be());

    let mut xor_result = [0u8; 64];
    for (out, (n, g)) in xor_result.iter_mut().zip(h_n.iter().zip(h_g.iter())) {
        *out = n ^ g;
    }

    let h_i = Sha512::digest(identity);

    let mut hasher = Sha512::new();
    hasher.update(xor_result);
    hasher.update(h_i);
    hasher.update(salt);
    hasher.update(pad_to_n(a));
    hasher.update(pad_to_n(b));
    hasher.update(k);
    hasher.finalize().to_vec()
}

/// Compute M2 = H(PAD(A) || M1 || K)
fn compute_m2(a: &BigUint, m1: &[u8], k: &[u8]) -> Vec<u8> {
    let mut hasher = Sha512::new();
    hasher.update(pad_to_n(a));
    hasher.update(m1);
    hasher.update(k);
    hasher.finalize().to_vec()
}

/// K = H(PAD(S))
fn hash_padded(s: &BigUint) -> Vec<u8> {
    Sha512::digest(pad_to_n(s)).to_vec()
}

/// Pad BigUint to N_BYTES with leading zeros.
fn pad_to_n(value: &BigUint) -> Vec<u8> {
    let bytes = value.to_bytes_be();
    if bytes.len() >= N_BYTES {
        bytes[bytes.len() - N_BYTES..].to_vec()
    } else {
        let mut padded = vec![0u8; N_BYTES - bytes.len()];
        padded.extend_from_slice(&bytes);
        padded
    }
}

/// Compute k = SHA512(N || PAD(g)).
fn compute_k(params: &SrpParams) -> BigUint {
    let mut hasher = Sha512::new();
    hasher.update(pad_to_n(&params.n));
    hasher.update(pad_to_n(&params.g));
    BigUint::from_bytes_be(&hasher.finalize())
}

/// Compute u = SHA512(PAD(A) || PAD(B)).
fn compute_u(a: &BigUint, b: &BigUint) -> BigUint {
    let mut hasher = Sha512::new();
    hasher.update(pad_to_n(a));
    hasher.update(pad_to_n(b));
    BigUint::from_bytes_be(&hasher.finalize())
}

/// Compute x = SHA512(salt || SHA512(identity || ":" || password)).
fn compute_x(salt: &[u8], identity: &[u8], password: &[u8]) -> BigUint {
    let mut inner = Sha512::new();
    inner.update(identity);
    inner.update(b":");
    inner.update(password);
    let inner_hash = inner.finalize();

    let mut outer = Sha512::new();
    outer.update(salt);
    outer.update(inner_hash);
    BigUint::from_bytes_be(&outer.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    mod srp_params {
        use super::*;

        #[test]
        fn default_uses_3072_bit_prime() {
            let params = SrpParams::default();
            assert_eq!(params.n.to_bytes_be().len(), 384);
        }

        #[test]
        fn generator_is_5() {
            let params = SrpParams::default();
            assert_eq!(params.g, BigUint::from(5u32));
        }

        #[test]
        fn prime_matches_rfc5054() {
            let params = SrpParams::default();
            let n_hex = hex::encode_upper(params.n.to_bytes_be());
            assert!(n_hex.starts_with("FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1"));
            assert!(n_hex.ends_with("A93AD2CAFFFFFFFFFFFFFFFF"));
        }

        #[test]
        fn prime_is_odd_and_g_has_high_order() {
            let params = SrpParams::default();
            assert!(&params.n % BigUint::from(2u32) != BigUint::ZERO);
            let g_squared = params.g.modpow(&BigUint::from(2u32), &params.n);
            assert_ne!(g_squared, BigUint::from(1u32));
        }
    }

    mod srp_client {
        use super::*;

        #[test]
        fn new_generates_random_private_key() {
            let client1 = SrpClient::new(b"Pair-Setup", b"031-45-154");
            let client2 = SrpClient::new(b"Pair-Setup", b"031-45-154");
            assert_ne!(client1.private_key, client2.private_key);
        }

        #[test]
        fn public_key_is_384_bytes() {
            let client = SrpClient::new(b"Pair-Setup", b"031-45-154");
            assert_eq!(client.public_key().len(), 384);
        }

        #[test]
        fn rejects_zero_server_public_key() {
            let client = SrpClient::new(b"Pair-Setup", b"031-45-154");
            let challenge = SrpChallenge {
                salt: [0u8; 16],
                server_public_key: vec![0u8; 384],
            };
            assert!(client.process_challenge(&challenge).is_err());
        }

        #[test]
        fn rejects_server_key_multiple_of_n() {
            let client = SrpClient::new(b"Pair-Setup", b"031-45-154");
            let challenge = SrpChallenge {
                salt: [0u8; 16],
                server_public_key: pad_to_n(&client.params.n),
            };
            assert!(client.process_challenge(&challenge).is_err());
        }
    }

    mod srp_server {
        use super::*;

        #[test]
        fn public_key_is_384_bytes_and_salt_is_random() {
            let server1 = SrpServer::new(b"Pair-Setup", b"031-45-154");
            let server2 = SrpServer::new(b"Pair-Setup", b"031-45-154");
            assert_eq!(server1.public_key().len(), 384);
            assert_ne!(server1.salt(), server2.salt());
        }

        #[test]
        fn fixed_inputs_are_deterministic() {
            let key = [0x42u8; 32];
            let a = SrpServer::with_salt_and_key(b"Pair-Setup", b"031-45-154", [7u8; 16], &key);
            let b = SrpServer::with_salt_and_key(b"Pair-Setup", b"031-45-154", [7u8; 16], &key);
            assert_eq!(a.public_key(), b.public_key());
        }

        #[test]
        fn rejects_zero_client_public_key() {
            let server = SrpServer::new(b"Pair-Setup", b"031-45-154");
            let result = server.verify_client(&[0u8; 384], &[0u8; 64]);
            assert!(matches!(result, Err(CryptoError::InvalidPublicKey(_))));
        }
    }

    mod handshake {
        use super::*;

        fn run(client_password: &[u8], server_password: &[u8]) -> Result<(SrpProof, SrpSession), CryptoError> {
            let server = SrpServer::new(b"Pair-Setup", server_password);
            let client = SrpClient::new(b"Pair-Setup", client_password);
            let challenge = SrpChallenge {
                salt: server.salt(),
                server_public_key: server.public_key(),
            };
            let proof = client.process_challenge(&challenge)?;
            let session = server.verify_client(&client.public_key(), &proof.client_proof)?;
            Ok((proof, session))
        }

        #[test]
        fn client_server_agree_on_secret_and_proofs() {
            let (proof, session) = run(b"031-45-154", b"031-45-154").unwrap();
            assert_eq!(proof.shared_secret, session.shared_secret);
            assert_eq!(proof.shared_secret.len(), 64);
            assert_eq!(proof.expected_server_proof, session.server_proof);
        }

        #[test]
        fn wrong_password_fails_server_verification() {
            let result = run(b"999-99-998", b"031-45-154");
            assert!(matches!(result, Err(CryptoError::ProofMismatch)));
        }

        #[test]
        fn client_verifies_server_proof_in_constant_time() {
            let (proof, session) = run(b"031-45-154", b"031-45-154").unwrap();
            let client = SrpClient::new(b"Pair-Setup", b"031-45-154");
            assert!(client.verify_server_proof(&session.server_proof, &proof.expected_server_proof));

            let mut wrong = session.server_proof.clone();
            wrong[63] ^= 0x01;
            assert!(!client.verify_server_proof(&wrong, &proof.expected_server_proof));
        }
    }

    mod internal_functions {
        use super::*;

        #[test]
        fn compute_k_is_deterministic() {
            let params = SrpParams::default();
            assert_eq!(compute_k(&params), compute_k(&params));
        }

        #[test]
        fn compute_u_changes_with_public_keys() {
            let b = BigUint::from(67890u32);
            let u1 = compute_u(&BigUint::from(12345u32), &b);
            let u2 = compute_u(&BigUint::from(12346u32), &b);
            assert_ne!(u1, u2);
        }

        #[test]
        fn compute_x_matches_definition() {
            // x = H(salt || H(I || ":" || P))
            let salt = [0x01u8; 16];
            let mut inner = Sha512::new();
            inner.update(b"Pair-Setup");
            inner.update(b":");
            inner.update(b"031-45-154");
            let inner_hash = inner.finalize();

            let mut outer = Sha512::new();
            outer.update(salt);
            outer.update(inner_hash);
            let expected = BigUint::from_bytes_be(&outer.finalize());

            assert_eq!(compute_x(&salt, b"Pair-Setup", b"031-45-154"), expected);
        }

        #[test]
        fn pad_to_n_pads_correctly() {
            let padded = pad_to_n(&BigUint::from(255u32));
            assert_eq!(padded.len(), N_BYTES);
            assert!(padded[..N_BYTES - 1].iter().all(|&b| b == 0));
            assert_eq!(padded[N_BYTES - 1], 255);
        }
    }
}
