//! Caller identity extracted from request headers.

use std::convert::Infallible;

use axum::{extract::FromRequestParts, http::request::Parts};

/// Header carrying the opaque actor id recorded in audit entries
pub const ACTOR_HEADER: &str = "X-Actor-Id";

/// Actor used when the header is absent or blank
pub const ANONYMOUS_ACTOR: &str = "anonymous";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor(pub String);

impl Actor {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let actor = parts
            .headers
            .get(ACTOR_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or(ANONYMOUS_ACTOR);

        Ok(Actor(actor.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(request: Request<()>) -> Actor {
        let (mut parts, _) = request.into_parts();
        Actor::from_request_parts(&mut parts, &()).await.unwrap()
    }

    #[tokio::test]
    async fn test_header_is_used() {
        let request = Request::builder()
            .header(ACTOR_HEADER, " ops-team ")
            .body(())
            .unwrap();
        assert_eq!(extract(request).await.as_str(), "ops-team");
    }

    #[tokio::test]
    async fn test_missing_or_blank_header_is_anonymous() {
        let request = Request::builder().body(()).unwrap();
        assert_eq!(extract(request).await.as_str(), ANONYMOUS_ACTOR);

        let request = Request::builder().header(ACTOR_HEADER, "  ").body(()).unwrap();
        assert_eq!(extract(request).await.as_str(), ANONYMOUS_ACTOR);
    }
}
