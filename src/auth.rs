/// Authentication extractors
use crate::{
    account::AccountSnapshot, api::middleware::extract_bearer_token, context::AppContext,
    error::ServiceError,
};
use axum::{async_trait, extract::FromRequestParts, http::request::Parts};

/// Raw bearer token from the Authorization header, not validated
#[derive(Debug, Clone)]
pub struct BearerToken(pub String);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for BearerToken {
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        extract_bearer_token(&parts.headers)
            .map(BearerToken)
            .ok_or_else(|| ServiceError::InvalidToken("Missing authorization header".to_string()))
    }
}

/// Authenticated context - resolves the bearer token to an active account
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub account: AccountSnapshot,
}

#[async_trait]
impl FromRequestParts<AppContext> for AuthContext {
    type Rejection = ServiceError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppContext,
    ) -> Result<Self, Self::Rejection> {
        let BearerToken(token) = BearerToken::from_request_parts(parts, state).await?;

        let account = state.account_manager.authenticate(&token).await?;

        Ok(AuthContext { account })
    }
}
