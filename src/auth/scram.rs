//! Server-side SCRAM-SHA-256 exchange (RFC 5802).
//!
//! The server keeps only a derived [`ScramVerifier`] per role; the raw
//! password never reaches this code. The exchange is two messages each
//! way: client-first / server-first, client-final / server-final.
use base64::prelude::{BASE64_STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::{
    error::{Error, Result},
    tenant::ScramVerifier,
};

pub const MECHANISM: &str = "SCRAM-SHA-256";

const NONCE_RAW_LEN: usize = 18;

/// One in-flight server-side exchange.
#[derive(Debug)]
pub struct ServerExchange {
    verifier: ScramVerifier,
    client_first_bare: String,
    server_first: String,
    combined_nonce: String,
}

impl ServerExchange {
    /// Consume the client-first message and produce the server-first
    /// challenge.
    pub fn start(verifier: ScramVerifier, client_first: &[u8]) -> Result<(Self, String)> {
        let client_first = std::str::from_utf8(client_first)
            .map_err(|_| Error::binary_protocol("invalid SASL payload encoding"))?;

        // gs2 header: we support no channel binding.
        let (gs2, client_first_bare) = client_first
            .split_once(",,")
            .ok_or_else(|| Error::binary_protocol("malformed SCRAM client-first message"))?;
        if gs2.starts_with("p=") {
            return Err(Error::auth("channel binding is not supported"));
        }

        let client_nonce = attribute(client_first_bare, 'r')
            .ok_or_else(|| Error::binary_protocol("SCRAM client-first message is missing nonce"))?;
        if client_nonce.is_empty() {
            return Err(Error::binary_protocol("SCRAM client nonce cannot be empty"));
        }

        let mut raw = [0u8; NONCE_RAW_LEN];
        rand::rngs::OsRng.fill_bytes(&mut raw);
        let combined_nonce = format!("{client_nonce}{}", BASE64_STANDARD.encode(raw));

        let server_first = format!(
            "r={combined_nonce},s={},i={}",
            BASE64_STANDARD.encode(&verifier.salt),
            verifier.iterations,
        );

        let me = Self {
            verifier,
            client_first_bare: client_first_bare.to_owned(),
            server_first: server_first.clone(),
            combined_nonce,
        };
        Ok((me, server_first))
    }

    /// Verify the client-final proof and produce the server-final
    /// verifier.
    pub fn finish(self, client_final: &[u8]) -> Result<String> {
        let client_final = std::str::from_utf8(client_final)
            .map_err(|_| Error::binary_protocol("invalid SASL payload encoding"))?;

        let final_nonce = attribute(client_final, 'r')
            .ok_or_else(|| Error::binary_protocol("SCRAM client-final message is missing nonce"))?;
        if final_nonce != self.combined_nonce {
            return Err(Error::auth("SCRAM nonce mismatch"));
        }

        let without_proof = client_final
            .rsplit_once(",p=")
            .map(|(head, _)| head)
            .ok_or_else(|| Error::binary_protocol("SCRAM client-final message is missing proof"))?;
        let proof_b64 = attribute(client_final, 'p')
            .ok_or_else(|| Error::binary_protocol("SCRAM client-final message is missing proof"))?;
        let proof = BASE64_STANDARD
            .decode(proof_b64)
            .map_err(|_| Error::binary_protocol("SCRAM proof is not valid base64"))?;
        if proof.len() != 32 {
            return Err(Error::binary_protocol("SCRAM proof has invalid length"));
        }

        let auth_message =
            format!("{},{},{}", self.client_first_bare, self.server_first, without_proof);

        let client_signature = hmac(&self.verifier.stored_key, auth_message.as_bytes());
        let client_key: Vec<u8> = proof
            .iter()
            .zip(client_signature.iter())
            .map(|(lhs, rhs)| lhs ^ rhs)
            .collect();

        if Sha256::digest(&client_key).as_slice() != self.verifier.stored_key {
            return Err(Error::auth("authentication failed"));
        }

        let server_signature = hmac(&self.verifier.server_key, auth_message.as_bytes());
        Ok(format!("v={}", BASE64_STANDARD.encode(server_signature)))
    }
}

/// Derive a stored verifier from a password; used by role management and
/// test fixtures, never during the exchange itself.
pub fn build_verifier(password: &str, salt: &[u8], iterations: u32) -> ScramVerifier {
    let salted =
        pbkdf2::pbkdf2_hmac_array::<Sha256, 32>(password.as_bytes(), salt, iterations);
    let client_key = hmac(&salted, b"Client Key");
    let stored_key: [u8; 32] = Sha256::digest(client_key).into();
    let server_key = hmac(&salted, b"Server Key");
    ScramVerifier { salt: salt.to_vec(), iterations, stored_key, server_key }
}

fn hmac(key: &[u8], message: &[u8]) -> [u8; 32] {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(message);
    mac.finalize().into_bytes().into()
}

fn attribute<'a>(message: &'a str, name: char) -> Option<&'a str> {
    message.split(',').find_map(|part| {
        let (key, value) = part.split_once('=')?;
        (key.len() == 1 && key.starts_with(name)).then_some(value)
    })
}
