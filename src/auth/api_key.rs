use axum::{async_trait, extract::FromRequestParts, http::request::Parts, RequestPartsExt};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use uuid::Uuid;

use crate::{error::ApiError, models::Tier, AppState};

/// Verified caller identity, resolved from a bearer API key.
#[derive(Debug, Clone)]
pub struct Caller {
    pub account_id: Uuid,
    pub tier: Tier,
    pub is_admin: bool,
}

#[async_trait]
impl FromRequestParts<std::sync::Arc<AppState>> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &std::sync::Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) = parts
            .extract::<TypedHeader<Authorization<Bearer>>>()
            .await
            .map_err(|_| ApiError::InvalidApiKey)?;

        let row: Option<(Uuid, String, bool)> = sqlx::query_as(
            r#"
            SELECT a.id, a.tier, a.is_admin
            FROM api_keys k
            JOIN accounts a ON a.id = k.account_id
            WHERE k.key = $1 AND NOT k.revoked
            "#,
        )
        .bind(bearer.token())
        .fetch_optional(&state.db)
        .await
        .map_err(|_| ApiError::InternalError)?;

        let Some((account_id, tier, is_admin)) = row else {
            return Err(ApiError::InvalidApiKey);
        };

        Ok(Caller {
            account_id,
            tier: Tier::parse(&tier),
            is_admin,
        })
    }
}
