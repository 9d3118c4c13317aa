//! Local auth: argon2id password verification, signed session cookies, and
//! a bounded/TTL-swept per-source-IP login rate limiter.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, TokenData, Validation};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

const COOKIE_EXPIRY_SECS: u64 = 24 * 60 * 60;

/// Claims carried by the signed local-auth session cookie.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: u64,
    pub iat: u64,
}

/// Hash a plaintext password with argon2id, producing a PHC string suitable
/// for `AuthConfig::password_hash`.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("argon2 hash failed: {e}"))?;
    Ok(hash.to_string())
}

/// Verify a plaintext password against a stored argon2id PHC string.
pub fn verify_password(password: &str, phc: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(phc) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

/// Sign a session cookie value for `subject` ("local" — there is only one
/// local account). Encodes `Claims` as an HS256 JWT.
pub fn sign_cookie(subject: &str, secret: &str) -> Result<String> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock error")?
        .as_secs();
    let claims = Claims {
        sub: subject.to_string(),
        iat: now,
        exp: now + COOKIE_EXPIRY_SECS,
    };
    jsonwebtoken::encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .context("failed to sign cookie")
}

/// Validate a session cookie value, returning its claims if valid and
/// unexpired.
pub fn validate_cookie(token: &str, secret: &str) -> Result<Claims> {
    let validation = Validation::new(Algorithm::HS256);
    let data: TokenData<Claims> = jsonwebtoken::decode(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .context("invalid or expired session cookie")?;
    Ok(data.claims)
}

/// Generate a cryptographically secure random secret, CSPRNG-sourced from
/// `/dev/urandom`, for cookie signing.
pub fn generate_secret() -> String {
    use std::fmt::Write;
    use std::io::Read;
    let mut bytes = [0u8; 32];
    let f = std::fs::File::open("/dev/urandom").expect("failed to open /dev/urandom");
    (&f).read_exact(&mut bytes).expect("failed to read random bytes");
    let mut hex = String::with_capacity(64);
    for b in &bytes {
        write!(hex, "{b:02x}").unwrap();
    }
    hex
}

/// Bounded, TTL-swept login attempt limiter keyed by source IP.
/// Sweeps stale keys every `cleanup_interval` calls to `check`, and hard-caps
/// total tracked keys so an attacker can't grow the map unboundedly.
pub struct LoginRateLimiter {
    attempts: Mutex<HashMap<String, Vec<Instant>>>,
    max_attempts: usize,
    window: Duration,
    max_keys: usize,
    cleanup_interval: u64,
    calls_since_cleanup: Mutex<u64>,
}

impl LoginRateLimiter {
    pub fn new(max_attempts: usize, window_secs: u64) -> Self {
        Self::with_cleanup_interval(max_attempts, window_secs, 100)
    }

    pub fn with_cleanup_interval(max_attempts: usize, window_secs: u64, cleanup_interval: u64) -> Self {
        Self {
            attempts: Mutex::new(HashMap::new()),
            max_attempts,
            window: Duration::from_secs(window_secs),
            max_keys: 10_000,
            cleanup_interval,
            calls_since_cleanup: Mutex::new(0),
        }
    }

    /// Record an attempt for `key` and return true if it should be allowed.
    pub fn check(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());

        {
            let mut calls = self.calls_since_cleanup.lock().unwrap_or_else(|e| e.into_inner());
            *calls += 1;
            if *calls >= self.cleanup_interval {
                *calls = 0;
                let window = self.window;
                attempts.retain(|_, v| {
                    v.retain(|&t| now.duration_since(t) < window);
                    !v.is_empty()
                });
            }
        }

        if attempts.len() >= self.max_keys && !attempts.contains_key(key) {
            // Defensive cap against unbounded growth from enumeration/DoS.
            return false;
        }

        let entry = attempts.entry(key.to_string()).or_default();
        entry.retain(|&t| now.duration_since(t) < self.window);
        if entry.len() >= self.max_attempts {
            return false;
        }
        entry.push(now);
        true
    }

    /// Clear attempt history for `key`, called after a successful login.
    pub fn clear(&self, key: &str) {
        self.attempts.lock().unwrap_or_else(|e| e.into_inner()).remove(key);
    }

    #[cfg(test)]
    pub fn key_count(&self) -> usize {
        self.attempts.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_roundtrip() {
        let hash = hash_password("hunter2").unwrap();
        assert!(verify_password("hunter2", &hash));
        assert!(!verify_password("wrong", &hash));
    }

    #[test]
    fn password_hash_is_argon2id() {
        let hash = hash_password("x").unwrap();
        assert!(hash.starts_with("$argon2id$"));
    }

    #[test]
    fn cookie_roundtrip() {
        let token = sign_cookie("local", "secret").unwrap();
        let claims = validate_cookie(&token, "secret").unwrap();
        assert_eq!(claims.sub, "local");
        assert_eq!(claims.exp - claims.iat, COOKIE_EXPIRY_SECS);
    }

    #[test]
    fn cookie_rejects_wrong_secret() {
        let token = sign_cookie("local", "right").unwrap();
        assert!(validate_cookie(&token, "wrong").is_err());
    }

    #[test]
    fn secret_is_64_hex_chars_and_unique() {
        let a = generate_secret();
        let b = generate_secret();
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn rate_limiter_blocks_after_max_attempts() {
        let limiter = LoginRateLimiter::new(3, 60);
        assert!(limiter.check("1.2.3.4"));
        assert!(limiter.check("1.2.3.4"));
        assert!(limiter.check("1.2.3.4"));
        assert!(!limiter.check("1.2.3.4"));
    }

    #[test]
    fn rate_limiter_keys_are_independent() {
        let limiter = LoginRateLimiter::new(1, 60);
        assert!(limiter.check("a"));
        assert!(limiter.check("b"));
        assert!(!limiter.check("a"));
    }

    #[test]
    fn rate_limiter_clear_resets_key() {
        let limiter = LoginRateLimiter::new(1, 60);
        assert!(limiter.check("a"));
        assert!(!limiter.check("a"));
        limiter.clear("a");
        assert!(limiter.check("a"));
    }

    #[test]
    fn rate_limiter_sweeps_stale_keys() {
        let limiter = LoginRateLimiter::with_cleanup_interval(1, 0, 2);
        // window_secs = 0 means every prior attempt is immediately stale.
        limiter.check("a");
        limiter.check("b");
        assert!(limiter.key_count() <= 2);
    }
}
