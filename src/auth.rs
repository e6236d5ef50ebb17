//! Composes bearer/token/password checks, the rate limiter, the TLS-mesh
//! override, and the machine-scoped local/sibling-IP fallback.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::http::HeaderMap;
use ipnet::IpNet;

use crate::crypto::constant_time_eq;
use crate::net::{is_private_or_loopback, resolve_client_ip};
use crate::ratelimit::{AuthRateLimiter, RateLimitOutcome};
use crate::registry::ClientRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthResult {
    Ok,
    Unauthorized,
    RateLimited { retry_after_ms: u64 },
}

/// Credential presented on the request, if any. Either field may be set
/// independently (bearer token vs. basic-auth-style password field).
#[derive(Debug, Default, Clone)]
pub struct Credential {
    pub token: Option<String>,
    pub password: Option<String>,
}

pub struct Authorizer {
    secret: Option<String>,
    tls_mesh_permissive: bool,
    trusted_proxies: Vec<IpNet>,
    disable_sibling_fallback: bool,
    rate_limiter: Arc<AuthRateLimiter>,
    registry: Arc<ClientRegistry>,
}

impl Authorizer {
    pub fn new(
        secret: Option<String>,
        tls_mesh_permissive: bool,
        trusted_proxies: Vec<IpNet>,
        disable_sibling_fallback: bool,
        rate_limiter: Arc<AuthRateLimiter>,
        registry: Arc<ClientRegistry>,
    ) -> Self {
        Self {
            secret,
            tls_mesh_permissive,
            trusted_proxies,
            disable_sibling_fallback,
            rate_limiter,
            registry,
        }
    }

    /// General-purpose policy: TLS-mesh override, then credential check,
    /// then rate limiting.
    pub async fn authorize(
        &self,
        headers: &HeaderMap,
        socket_ip: IpAddr,
        credential: &Credential,
    ) -> AuthResult {
        if self.tls_mesh_permissive && self.is_mesh_trusted(socket_ip) {
            return AuthResult::Ok;
        }
        self.authorize_credential_then_rate_limit(headers, socket_ip, credential)
            .await
    }

    /// Shared tail of the policy: credential check, then rate limiter.
    /// Used both by `authorize` and by the machine-scoped variant's step 2
    /// ("attempt bearer-token authorization as above, with TLS-mesh
    /// permissive suppressed").
    async fn authorize_credential_then_rate_limit(
        &self,
        headers: &HeaderMap,
        socket_ip: IpAddr,
        credential: &Credential,
    ) -> AuthResult {
        if let Some(secret) = &self.secret {
            let token_matches = credential
                .token
                .as_ref()
                .is_some_and(|t| constant_time_eq(t.as_bytes(), secret.as_bytes()));
            let password_matches = credential
                .password
                .as_ref()
                .is_some_and(|p| constant_time_eq(p.as_bytes(), secret.as_bytes()));
            if token_matches || password_matches {
                let key = self.client_key(headers, socket_ip);
                self.rate_limiter.clear(&key).await;
                return AuthResult::Ok;
            }
        }

        let key = self.client_key(headers, socket_ip);
        match self.rate_limiter.record_failure(&key, Instant::now()).await {
            RateLimitOutcome::Throttled { retry_after_ms } => {
                AuthResult::RateLimited { retry_after_ms }
            }
            RateLimitOutcome::Ok => AuthResult::Unauthorized,
        }
    }

    /// Machine-scoped policy used for framebuffer and canvas endpoints:
    /// loopback short-circuit, then the general policy, then the
    /// sibling-IP fallback.
    pub async fn authorize_machine_scoped(
        &self,
        headers: &HeaderMap,
        socket_ip: IpAddr,
        credential: &Credential,
    ) -> AuthResult {
        if self.is_direct_local(socket_ip, headers) {
            return AuthResult::Ok;
        }

        match self
            .authorize_credential_then_rate_limit(headers, socket_ip, credential)
            .await
        {
            AuthResult::Ok => return AuthResult::Ok,
            AuthResult::RateLimited { retry_after_ms } => {
                // Already locked out by the rate limiter; the sibling
                // fallback must not be usable to route around that.
                return AuthResult::RateLimited { retry_after_ms };
            }
            AuthResult::Unauthorized => {}
        }

        if self.disable_sibling_fallback {
            return AuthResult::Unauthorized;
        }

        let effective_ip = resolve_client_ip(socket_ip, headers, &self.trusted_proxies);
        if !is_private_or_loopback(&effective_ip) {
            return AuthResult::Unauthorized;
        }

        if self.registry.has_live_connection(&effective_ip) {
            AuthResult::Ok
        } else {
            AuthResult::Unauthorized
        }
    }

    fn is_mesh_trusted(&self, socket_ip: IpAddr) -> bool {
        is_private_or_loopback(&socket_ip)
    }

    /// True when the TCP peer itself is loopback and isn't a trusted proxy
    /// relaying on behalf of someone else.
    fn is_direct_local(&self, socket_ip: IpAddr, headers: &HeaderMap) -> bool {
        if !socket_ip.is_loopback() {
            return false;
        }
        let relaying = self
            .trusted_proxies
            .iter()
            .any(|net| net.contains(&socket_ip))
            && (headers.contains_key("x-forwarded-for") || headers.contains_key("x-real-ip"));
        !relaying
    }

    fn client_key(&self, headers: &HeaderMap, socket_ip: IpAddr) -> String {
        resolve_client_ip(socket_ip, headers, &self.trusted_proxies).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn authorizer(secret: Option<&str>) -> Authorizer {
        Authorizer::new(
            secret.map(String::from),
            false,
            vec![],
            false,
            Arc::new(AuthRateLimiter::new(Duration::from_secs(60), 20, 4096)),
            ClientRegistry::new(),
        )
    }

    #[tokio::test]
    async fn correct_token_authorizes() {
        let a = authorizer(Some("s3cret"));
        let cred = Credential {
            token: Some("s3cret".into()),
            password: None,
        };
        let result = a
            .authorize(&HeaderMap::new(), "203.0.113.1".parse().unwrap(), &cred)
            .await;
        assert_eq!(result, AuthResult::Ok);
    }

    #[tokio::test]
    async fn wrong_token_is_unauthorized_then_rate_limited() {
        let a = authorizer(Some("s3cret"));
        let cred = Credential {
            token: Some("wrong".into()),
            password: None,
        };
        let ip = "203.0.113.2".parse().unwrap();
        for _ in 0..20 {
            assert_eq!(
                a.authorize(&HeaderMap::new(), ip, &cred).await,
                AuthResult::Unauthorized
            );
        }
        assert!(matches!(
            a.authorize(&HeaderMap::new(), ip, &cred).await,
            AuthResult::RateLimited { .. }
        ));
    }

    #[tokio::test]
    async fn tls_mesh_permissive_bypasses_credential_check() {
        let mut a = authorizer(Some("s3cret"));
        a.tls_mesh_permissive = true;
        let cred = Credential::default();
        let result = a
            .authorize(&HeaderMap::new(), "10.1.2.3".parse().unwrap(), &cred)
            .await;
        assert_eq!(result, AuthResult::Ok);
    }

    #[tokio::test]
    async fn machine_scoped_loopback_direct_connection_is_ok() {
        let a = authorizer(Some("s3cret"));
        let cred = Credential::default();
        let result = a
            .authorize_machine_scoped(&HeaderMap::new(), "127.0.0.1".parse().unwrap(), &cred)
            .await;
        assert_eq!(result, AuthResult::Ok);
    }

    #[tokio::test]
    async fn machine_scoped_sibling_fallback_requires_live_registry_entry() {
        let registry = ClientRegistry::new();
        let a = Authorizer::new(
            Some("s3cret".into()),
            false,
            vec![],
            false,
            Arc::new(AuthRateLimiter::new(Duration::from_secs(60), 20, 4096)),
            registry.clone(),
        );
        let cred = Credential::default();
        let ip: IpAddr = "192.168.1.50".parse().unwrap();

        // No sibling yet: unauthorized.
        assert_eq!(
            a.authorize_machine_scoped(&HeaderMap::new(), ip, &cred).await,
            AuthResult::Unauthorized
        );

        let _entry = registry.register(ip);
        assert_eq!(
            a.authorize_machine_scoped(&HeaderMap::new(), ip, &cred).await,
            AuthResult::Ok
        );
    }

    #[tokio::test]
    async fn machine_scoped_sibling_fallback_rejects_public_ip() {
        let registry = ClientRegistry::new();
        let ip: IpAddr = "203.0.113.9".parse().unwrap();
        let _entry = registry.register(ip);
        let a = Authorizer::new(
            Some("s3cret".into()),
            false,
            vec![],
            false,
            Arc::new(AuthRateLimiter::new(Duration::from_secs(60), 20, 4096)),
            registry,
        );
        let cred = Credential::default();
        assert_eq!(
            a.authorize_machine_scoped(&HeaderMap::new(), ip, &cred).await,
            AuthResult::Unauthorized
        );
    }

    #[tokio::test]
    async fn disable_sibling_fallback_config_flag_is_honored() {
        let registry = ClientRegistry::new();
        let ip: IpAddr = "192.168.1.51".parse().unwrap();
        let _entry = registry.register(ip);
        let a = Authorizer::new(
            Some("s3cret".into()),
            false,
            vec![],
            true,
            Arc::new(AuthRateLimiter::new(Duration::from_secs(60), 20, 4096)),
            registry,
        );
        let cred = Credential::default();
        assert_eq!(
            a.authorize_machine_scoped(&HeaderMap::new(), ip, &cred).await,
            AuthResult::Unauthorized
        );
    }
}
