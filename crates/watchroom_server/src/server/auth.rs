#![forbid(unsafe_code)]

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, anyhow};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::util::secret::SecretString;

/// Application close code: no token in the upgrade request query.
pub const CLOSE_AUTH_REQUIRED: u16 = 4001;
/// Application close code: token present but invalid or expired.
pub const CLOSE_AUTH_INVALID: u16 = 4002;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthClaims {
	/// User id the token was issued to.
	pub sub: String,
	pub username: String,
	#[serde(default)]
	pub is_admin: bool,
	pub exp: u64,
}

/// Seam for token validation so the connection path can be tested without
/// real credentials.
pub trait TokenVerifier: Send + Sync {
	fn verify(&self, token: &str) -> anyhow::Result<AuthClaims>;
}

/// Production verifier: stateless `v1.<payload>.<sig>` HMAC tokens.
pub struct HmacTokenVerifier {
	secret: SecretString,
}

impl HmacTokenVerifier {
	pub fn new(secret: SecretString) -> Self {
		Self { secret }
	}
}

impl TokenVerifier for HmacTokenVerifier {
	fn verify(&self, token: &str) -> anyhow::Result<AuthClaims> {
		verify_hmac_token(token, self.secret.expose())
	}
}

pub fn verify_hmac_token(token: &str, secret: &str) -> anyhow::Result<AuthClaims> {
	let parts = token.split('.').collect::<Vec<_>>();
	if parts.len() != 3 || parts[0] != "v1" {
		return Err(anyhow!("invalid token format"));
	}

	let payload_b64 = parts[1];
	let sig_b64 = parts[2];

	let payload = URL_SAFE_NO_PAD.decode(payload_b64).context("decode token payload")?;
	let expected_sig = sign(payload_b64.as_bytes(), secret.as_bytes());
	let provided_sig = URL_SAFE_NO_PAD.decode(sig_b64).context("decode token signature")?;

	if !constant_time_eq(&expected_sig, &provided_sig) {
		return Err(anyhow!("invalid token signature"));
	}

	let claims: AuthClaims = serde_json::from_slice(&payload).context("parse token claims")?;
	let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
	if claims.exp <= now {
		return Err(anyhow!("token expired"));
	}

	Ok(claims)
}

/// Mint a token the verifier accepts. Used by tests and issuing tools.
pub fn mint_hmac_token(claims: &AuthClaims, secret: &str) -> anyhow::Result<String> {
	let payload = serde_json::to_vec(claims).context("serialize token claims")?;
	let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
	let sig = sign(payload_b64.as_bytes(), secret.as_bytes());
	let sig_b64 = URL_SAFE_NO_PAD.encode(sig);
	Ok(format!("v1.{payload_b64}.{sig_b64}"))
}

fn sign(payload_b64: &[u8], secret: &[u8]) -> Vec<u8> {
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("hmac key");
	mac.update(payload_b64);
	mac.finalize().into_bytes().to_vec()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}
