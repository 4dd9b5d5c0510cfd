/// Request extractors that validate their payload.
///
/// Every rejection, whether malformed syntax or a failed `validator` rule,
/// becomes `ServiceError::Validation` (422).
use crate::error::ServiceError;
use axum::{
    async_trait,
    extract::{FromRequest, FromRequestParts, Path, Query, Request},
    http::request::Parts,
    Form, Json,
};
use serde::de::DeserializeOwned;
use validator::{Validate, ValidationErrors};

fn invalid(errors: ValidationErrors) -> ServiceError {
    ServiceError::Validation(errors.to_string())
}

/// JSON body checked with `Validate`
#[derive(Debug, Clone)]
pub struct ValidatedJson<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for ValidatedJson<T>
where
    T: DeserializeOwned + Validate,
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|rejection| ServiceError::Validation(rejection.body_text()))?;
        value.validate().map_err(invalid)?;
        Ok(Self(value))
    }
}

/// URL-encoded form body checked with `Validate`
#[derive(Debug, Clone)]
pub struct ValidatedForm<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for ValidatedForm<T>
where
    T: DeserializeOwned + Validate,
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Form(value) = Form::<T>::from_request(req, state)
            .await
            .map_err(|rejection| ServiceError::Validation(rejection.body_text()))?;
        value.validate().map_err(invalid)?;
        Ok(Self(value))
    }
}

/// Query string checked with `Validate`
#[derive(Debug, Clone)]
pub struct ValidatedQuery<T>(pub T);

#[async_trait]
impl<T, S> FromRequestParts<S> for ValidatedQuery<T>
where
    T: DeserializeOwned + Validate,
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(value) = Query::<T>::from_request_parts(parts, state)
            .await
            .map_err(|rejection| ServiceError::Validation(rejection.body_text()))?;
        value.validate().map_err(invalid)?;
        Ok(Self(value))
    }
}

/// Query string without extra validation rules
#[derive(Debug, Clone)]
pub struct PlainQuery<T>(pub T);

#[async_trait]
impl<T, S> FromRequestParts<S> for PlainQuery<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        Query::<T>::from_request_parts(parts, state)
            .await
            .map(|Query(value)| Self(value))
            .map_err(|rejection| ServiceError::Validation(rejection.body_text()))
    }
}

/// Positive account id from the `{id}` path segment
#[derive(Debug, Clone, Copy)]
pub struct AccountId(pub i64);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for AccountId {
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path(id) = Path::<i64>::from_request_parts(parts, state)
            .await
            .map_err(|rejection| ServiceError::Validation(rejection.body_text()))?;

        if id < 1 {
            return Err(ServiceError::Validation(
                "id must be greater than or equal to 1".to_string(),
            ));
        }

        Ok(Self(id))
    }
}
