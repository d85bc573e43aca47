//! Request authentication filter.
//!
//! Every request passes through [`authenticate`] exactly once:
//!
//! - no token: the request continues anonymously
//! - valid token: a [`CurrentUser`] is attached to the request extensions
//! - invalid token: the request continues anonymously
//!
//! The filter never rejects on its own. Handlers that need an identity take
//! [`CurrentUser`] as an extractor, which answers 401 when it is missing.
//! The identity lives in the request's extensions and is dropped with it.
//!
//! Tokens come from `Authorization: Bearer <token>`. WebSocket upgrade
//! requests may carry the token in a `token` query parameter instead, since
//! browsers cannot set headers on the upgrade.

use axum::extract::{FromRequestParts, OptionalFromRequestParts, Request, State};
use axum::http::header::{AUTHORIZATION, UPGRADE};
use axum::http::request::Parts;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use tracing::{debug, trace};

use crate::error::ServerError;
use crate::token::TokenService;

/// The authenticated caller, identified by the token subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentUser {
    pub username: String,
}

/// Validates the caller's token and records the identity if it is valid.
pub async fn authenticate(State(tokens): State<TokenService>, mut request: Request, next: Next) -> Response {
    let token = bearer_token(request.headers())
        .or_else(|| upgrade_query_token(&request))
        .map(str::to_owned);

    match token {
        None => trace!("Anonymous request"),
        Some(token) => match tokens.subject_of(&token) {
            Ok(username) => {
                trace!("Request authenticated");
                request.extensions_mut().insert(CurrentUser { username });
            }
            Err(e) => debug!(error = %e, "Ignoring invalid session token"),
        },
    }

    next.run(request).await
}

/// Extracts the token from an `Authorization: Bearer` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

fn upgrade_query_token(request: &Request) -> Option<&str> {
    let is_websocket = request
        .headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    if !is_websocket {
        return None;
    }

    request
        .uri()
        .query()?
        .split('&')
        .find_map(|pair| pair.strip_prefix("token="))
        .filter(|token| !token.is_empty())
}

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<CurrentUser>()
            .cloned()
            .ok_or_else(|| ServerError::authentication("authentication required"))
    }
}

impl<S> OptionalFromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Option<Self>, Self::Rejection> {
        Ok(parts.extensions.get::<CurrentUser>().cloned())
    }
}
