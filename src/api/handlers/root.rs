use axum::{http::StatusCode, response::IntoResponse};

use crate::APP_USER_AGENT;

// Undocumented banner route; useful for eyeballing what is deployed.
pub async fn root() -> impl IntoResponse {
    (StatusCode::OK, APP_USER_AGENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::IntoResponse;

    #[tokio::test]
    async fn root_returns_the_user_agent_banner() {
        let response = root().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
