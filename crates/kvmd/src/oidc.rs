//! OIDC verification (§4.8): validates Google-issued ID tokens presented by
//! the cloud relay path. Discovery document and JWKS are fetched once and
//! cached for the lifetime indicated by the response's `Cache-Control`
//! max-age, refetched after that.

use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tokio::sync::Mutex;

const GOOGLE_DISCOVERY_URL: &str = "https://accounts.google.com/.well-known/openid-configuration";
const FETCH_TIMEOUT: Duration = Duration::from_secs(5);
const FALLBACK_CACHE_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Deserialize)]
struct DiscoveryDocument {
    jwks_uri: String,
}

#[derive(Debug, Deserialize, Clone)]
struct GoogleJwk {
    kid: String,
    n: String,
    e: String,
}

#[derive(Debug, Deserialize)]
struct JwksDocument {
    keys: Vec<GoogleJwk>,
}

#[derive(Debug, Deserialize)]
struct GoogleClaims {
    aud: String,
    sub: String,
}

struct Cached<T> {
    value: T,
    expires_at: Instant,
}

pub struct OidcVerifier {
    client: reqwest::Client,
    discovery_url: String,
    discovery: Mutex<Option<Cached<DiscoveryDocument>>>,
    jwks: Mutex<Option<Cached<JwksDocument>>>,
}

impl OidcVerifier {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            discovery_url: GOOGLE_DISCOVERY_URL.to_string(),
            discovery: Mutex::new(None),
            jwks: Mutex::new(None),
        }
    }

    /// Verifies `id_token`'s RS256 signature and standard time claims, then
    /// checks `aud:sub` against `expected_identity` (`config.google_identity`).
    pub async fn verify(&self, id_token: &str, expected_identity: &str) -> Result<()> {
        let claims = self.decode_claims(id_token).await?;
        let actual_identity = format!("{}:{}", claims.aud, claims.sub);
        if actual_identity != expected_identity {
            bail!("ID token identity {actual_identity} does not match bound identity");
        }
        Ok(())
    }

    /// Used by `/cloud/register`: verifies `id_token` was issued for
    /// `expected_client_id` (rather than against an already-bound identity,
    /// which doesn't exist yet at registration time) and returns the
    /// `aud:sub` pair to persist as `config.cloud.google_identity`.
    pub async fn verify_for_registration(&self, id_token: &str, expected_client_id: &str) -> Result<String> {
        let claims = self.decode_claims(id_token).await?;
        if claims.aud != expected_client_id {
            bail!("ID token aud {} does not match registration client id", claims.aud);
        }
        Ok(format!("{}:{}", claims.aud, claims.sub))
    }

    async fn decode_claims(&self, id_token: &str) -> Result<GoogleClaims> {
        let header = decode_header(id_token).context("failed to parse ID token header")?;
        let kid = header.kid.ok_or_else(|| anyhow::anyhow!("ID token header missing kid"))?;

        let jwks = self.jwks_document().await?;
        let jwk = jwks.keys.iter().find(|k| k.kid == kid).ok_or_else(|| anyhow::anyhow!("no JWKS key matching kid {kid}"))?;

        let key = DecodingKey::from_rsa_components(&jwk.n, &jwk.e).context("failed to build RSA decoding key from JWKS")?;

        // No `aud` is configured on the validator: the caller compares the
        // token's own aud/sub pair against whatever identity it expects,
        // rather than a fixed client-id allowlist enforced here.
        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_exp = true;

        let token = decode::<GoogleClaims>(id_token, &key, &validation).context("ID token signature/claims verification failed")?;
        Ok(token.claims)
    }

    async fn jwks_document(&self) -> Result<JwksDocument> {
        {
            let guard = self.jwks.lock().await;
            if let Some(cached) = guard.as_ref() {
                if cached.expires_at > Instant::now() {
                    return Ok(JwksDocument { keys: cached.value.keys.clone() });
                }
            }
        }

        let discovery_jwks_uri = self.discovery_document().await?.jwks_uri;
        let (doc, ttl) = self.fetch_with_cache_ttl::<JwksDocument>(&discovery_jwks_uri).await?;

        let keys_clone = doc.keys.clone();
        *self.jwks.lock().await = Some(Cached { value: doc, expires_at: Instant::now() + ttl });
        Ok(JwksDocument { keys: keys_clone })
    }

    async fn discovery_document(&self) -> Result<DiscoveryDocument> {
        {
            let guard = self.discovery.lock().await;
            if let Some(cached) = guard.as_ref() {
                if cached.expires_at > Instant::now() {
                    return Ok(DiscoveryDocument { jwks_uri: cached.value.jwks_uri.clone() });
                }
            }
        }

        let (doc, ttl) = self.fetch_with_cache_ttl::<DiscoveryDocument>(&self.discovery_url).await?;
        let jwks_uri = doc.jwks_uri.clone();
        *self.discovery.lock().await = Some(Cached { value: doc, expires_at: Instant::now() + ttl });
        Ok(DiscoveryDocument { jwks_uri })
    }

    async fn fetch_with_cache_ttl<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<(T, Duration)> {
        let resp = self
            .client
            .get(url)
            .timeout(FETCH_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?;

        let ttl = resp
            .headers()
            .get(reqwest::header::CACHE_CONTROL)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_max_age)
            .unwrap_or(FALLBACK_CACHE_TTL);

        let doc = resp.json::<T>().await.with_context(|| format!("invalid JSON response from {url}"))?;
        Ok((doc, ttl))
    }
}

fn parse_max_age(cache_control: &str) -> Option<Duration> {
    cache_control.split(',').map(str::trim).find_map(|directive| {
        directive.strip_prefix("max-age=").and_then(|v| v.parse::<u64>().ok()).map(Duration::from_secs)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_max_age_extracts_seconds() {
        assert_eq!(parse_max_age("public, max-age=3600"), Some(Duration::from_secs(3600)));
    }

    #[test]
    fn parse_max_age_missing_directive_is_none() {
        assert_eq!(parse_max_age("no-cache"), None);
    }

    #[test]
    fn parse_max_age_ignores_garbage_value() {
        assert_eq!(parse_max_age("max-age=notanumber"), None);
    }
}
