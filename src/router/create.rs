use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::{Json, http::StatusCode};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::account::PublicAccount;
use crate::error::Result;
use crate::provision::Registration;

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub account: PublicAccount,
}

/// Handler to register an account.
pub async fn handler(
    State(state): State<AppState>,
    body: std::result::Result<Json<Registration>, JsonRejection>,
) -> Result<(StatusCode, Json<Response>)> {
    let Json(body) = body?;
    let account = state.provisioner.register(body).await?;

    Ok((StatusCode::CREATED, Json(Response { account })))
}
