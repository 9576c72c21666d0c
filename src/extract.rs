//! Request extractors whose rejections come back as `InvalidPayload` in the usual error
//! envelope instead of axum's plain-text bodies.

use async_trait::async_trait;
use axum::body::HttpBody;
use axum::extract::{FromRequest, RequestParts};
use axum::BoxError;
use serde::de::DeserializeOwned;

use crate::err::Error;

fn rejected<R: std::fmt::Display>(what: &str, rejection: R) -> Error {
    log::debug!("Rejected request {}: {}", what, rejection);
    Error::invalid(rejection.to_string())
}

/// JSON request body.
#[derive(Debug, Clone, Copy, Default)]
pub struct Json<T>(pub T);

#[async_trait]
impl<T, B> FromRequest<B> for Json<T>
where
    T: DeserializeOwned,
    B: HttpBody + Send,
    B::Data: Send,
    B::Error: Into<BoxError>,
{
    type Rejection = Error;

    async fn from_request(req: &mut RequestParts<B>) -> Result<Self, Self::Rejection> {
        match axum::Json::<T>::from_request(req).await {
            Ok(axum::Json(value)) => Ok(Json(value)),
            Err(rejection) => Err(rejected("body", rejection)),
        }
    }
}

/// URL path parameters, such as record ids.
#[derive(Debug, Clone, Copy, Default)]
pub struct Path<T>(pub T);

#[async_trait]
impl<T, B> FromRequest<B> for Path<T>
where
    T: DeserializeOwned + Send,
    B: Send,
{
    type Rejection = Error;

    async fn from_request(req: &mut RequestParts<B>) -> Result<Self, Self::Rejection> {
        match axum::extract::Path::<T>::from_request(req).await {
            Ok(axum::extract::Path(value)) => Ok(Path(value)),
            Err(rejection) => Err(rejected("path", rejection)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Query<T>(pub T);

#[async_trait]
impl<T, B> FromRequest<B> for Query<T>
where
    T: DeserializeOwned,
    B: Send,
{
    type Rejection = Error;

    async fn from_request(req: &mut RequestParts<B>) -> Result<Self, Self::Rejection> {
        match axum::extract::Query::<T>::from_request(req).await {
            Ok(axum::extract::Query(value)) => Ok(Query(value)),
            Err(rejection) => Err(rejected("query", rejection)),
        }
    }
}
