//! Token lifecycle: reuse or rotate, and when to refresh
//!
//! A token is replaced once less than a fifth of its lifetime remains. The
//! refresh instant is derived from the platform-reported expiry and the
//! issuance instant, both truncated to whole seconds, and is stored in status
//! so later passes compare against the stored value instead of re-deriving it.

use async_trait::async_trait;
use chrono::{DateTime, Duration, DurationRound, Utc};
use k8s_openapi::api::authentication::v1::{TokenRequest, TokenRequestSpec};
use k8s_openapi::api::core::v1::ServiceAccount;
use kube::api::{Api, PostParams};
use kube::Client;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use kubeconfig_common::crd::{KubeconfigStatus, TypedObjectRef};
use kubeconfig_common::Error;

/// Denominator of the remaining-lifetime fraction that triggers rotation
pub const REFRESH_REMAINING_DIVISOR: i64 = 5;

/// A freshly issued token
#[derive(Clone, PartialEq, Eq)]
pub struct TokenInfo {
    /// Bearer token
    pub token: String,
    /// Issuance instant
    pub issued_at: DateTime<Utc>,
    /// Expiry reported by the issuer
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for TokenInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenInfo")
            .field("token", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl TokenInfo {
    /// Instant at which this token should be replaced
    pub fn refreshes_at(&self) -> DateTime<Utc> {
        refresh_instant(self.issued_at, self.expires_at)
    }
}

/// Truncate to whole seconds
pub fn whole_seconds(t: DateTime<Utc>) -> DateTime<Utc> {
    t.duration_trunc(Duration::seconds(1)).unwrap_or(t)
}

/// Refresh instant for a token valid from `issued_at` to `expires_at`
///
/// The token is replaced when a fifth of its lifetime remains, computed in
/// whole seconds.
pub fn refresh_instant(issued_at: DateTime<Utc>, expires_at: DateTime<Utc>) -> DateTime<Utc> {
    let issued_at = whole_seconds(issued_at);
    let expires_at = whole_seconds(expires_at);
    let lifetime = (expires_at - issued_at).num_seconds().max(0);
    expires_at - Duration::seconds(lifetime / REFRESH_REMAINING_DIVISOR)
}

/// Why a new token is requested
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RotationReason {
    /// No token has been issued yet
    NeverIssued,
    /// The refresh instant has passed
    RefreshDue,
    /// The kubeconfig Secret is gone
    CredentialMissing,
}

impl std::fmt::Display for RotationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NeverIssued => write!(f, "no token issued yet"),
            Self::RefreshDue => write!(f, "refresh time reached"),
            Self::CredentialMissing => write!(f, "kubeconfig secret missing"),
        }
    }
}

/// Outcome of the reuse-or-rotate decision
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenDecision {
    /// Keep the current token until `refreshes_at`
    Reuse {
        /// Stored refresh instant
        refreshes_at: DateTime<Utc>,
    },
    /// Request a new token
    Rotate(RotationReason),
}

/// Decide whether the current token can be kept
///
/// `credential_present` reports whether the kubeconfig Secret still exists.
pub fn decide(
    status: &KubeconfigStatus,
    now: DateTime<Utc>,
    credential_present: bool,
) -> TokenDecision {
    let refreshes_at = match (
        &status.kubeconfig_secret_ref,
        status.service_account_token_refreshes_at,
    ) {
        (Some(_), Some(at)) => at,
        _ => return TokenDecision::Rotate(RotationReason::NeverIssued),
    };
    if !credential_present {
        return TokenDecision::Rotate(RotationReason::CredentialMissing);
    }
    if now >= refreshes_at {
        return TokenDecision::Rotate(RotationReason::RefreshDue);
    }
    TokenDecision::Reuse { refreshes_at }
}

/// Issues tokens for a principal
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    /// Request a token for `principal` valid for `lifetime_secs`
    async fn request_token(
        &self,
        principal: &TypedObjectRef,
        lifetime_secs: i64,
    ) -> Result<TokenInfo, Error>;
}

/// Issues tokens through the ServiceAccount `token` sub-resource
pub struct ServiceAccountTokenIssuer {
    client: Client,
}

impl ServiceAccountTokenIssuer {
    /// Create an issuer using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TokenIssuer for ServiceAccountTokenIssuer {
    async fn request_token(
        &self,
        principal: &TypedObjectRef,
        lifetime_secs: i64,
    ) -> Result<TokenInfo, Error> {
        let namespace = principal.namespace.as_deref().ok_or_else(|| {
            Error::token("", &principal.name, "ServiceAccount reference has no namespace")
        })?;
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);

        let request = TokenRequest {
            spec: TokenRequestSpec {
                audiences: Vec::new(),
                expiration_seconds: Some(lifetime_secs),
                bound_object_ref: None,
            },
            ..Default::default()
        };

        let issued_at = whole_seconds(Utc::now());
        let response = api
            .create_token_request(&principal.name, &PostParams::default(), &request)
            .await
            .map_err(|e| Error::token(namespace, &principal.name, e.to_string()))?;

        let status = response.status.ok_or_else(|| {
            Error::token(namespace, &principal.name, "token request returned no status")
        })?;
        if status.token.is_empty() {
            return Err(Error::token(
                namespace,
                &principal.name,
                "token request returned an empty token",
            ));
        }

        let expires_at = whole_seconds(status.expiration_timestamp.0);
        debug!(
            service_account = %principal.name,
            namespace,
            %expires_at,
            "Issued service account token"
        );

        Ok(TokenInfo {
            token: status.token,
            issued_at,
            expires_at,
        })
    }
}
