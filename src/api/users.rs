/// User account endpoints under `/api/users`
use crate::{
    account::{
        AccountSnapshot, ListQuery, LoginForm, RegisterRequest, TokenResponse,
        UpdateAccountRequest, VisibilityQuery,
    },
    api::extract::{AccountId, PlainQuery, ValidatedForm, ValidatedJson, ValidatedQuery},
    auth::{AuthContext, BearerToken},
    context::AppContext,
    db::account::{Page, Visibility},
    error::ServiceResult,
    rate_limit::{limit_login, limit_me},
};
use axum::{
    extract::State,
    http::StatusCode,
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;

/// Build user routes. Login and `/me` carry their own rate limits.
pub fn routes(ctx: AppContext) -> Router<AppContext> {
    Router::new()
        .route("/api/users", get(list_accounts).post(register))
        .route(
            "/api/users/login",
            post(login).route_layer(middleware::from_fn_with_state(ctx.clone(), limit_login)),
        )
        .route("/api/users/logout", post(logout))
        .route(
            "/api/users/me",
            get(me).route_layer(middleware::from_fn_with_state(ctx, limit_me)),
        )
        .route(
            "/api/users/:id",
            get(get_account).patch(update_account).delete(delete_account),
        )
}

async fn register(
    State(ctx): State<AppContext>,
    ValidatedJson(req): ValidatedJson<RegisterRequest>,
) -> ServiceResult<(StatusCode, Json<AccountSnapshot>)> {
    let account = ctx.account_manager.register(req).await?;
    Ok((StatusCode::CREATED, Json(account)))
}

async fn list_accounts(
    State(ctx): State<AppContext>,
    ValidatedQuery(query): ValidatedQuery<ListQuery>,
) -> ServiceResult<Json<Vec<AccountSnapshot>>> {
    let accounts = ctx
        .account_manager
        .list(
            Page {
                skip: query.skip,
                limit: query.limit,
            },
            Visibility::new(query.show_deleted, query.show_active),
        )
        .await?;
    Ok(Json(accounts))
}

async fn get_account(
    State(ctx): State<AppContext>,
    AccountId(id): AccountId,
    PlainQuery(query): PlainQuery<VisibilityQuery>,
) -> ServiceResult<Json<AccountSnapshot>> {
    let account = ctx
        .account_manager
        .get(id, Visibility::new(query.show_deleted, query.show_active))
        .await?;
    Ok(Json(account))
}

async fn update_account(
    State(ctx): State<AppContext>,
    AccountId(id): AccountId,
    ValidatedJson(req): ValidatedJson<UpdateAccountRequest>,
) -> ServiceResult<Json<AccountSnapshot>> {
    let account = ctx.account_manager.update(id, req.into()).await?;
    Ok(Json(account))
}

async fn delete_account(
    State(ctx): State<AppContext>,
    AccountId(id): AccountId,
) -> ServiceResult<StatusCode> {
    ctx.account_manager.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn login(
    State(ctx): State<AppContext>,
    ValidatedForm(form): ValidatedForm<LoginForm>,
) -> ServiceResult<(StatusCode, Json<TokenResponse>)> {
    let token = ctx
        .account_manager
        .login(&form.username, &form.password)
        .await?;
    Ok((StatusCode::CREATED, Json(token)))
}

async fn logout(
    State(ctx): State<AppContext>,
    BearerToken(token): BearerToken,
) -> ServiceResult<Json<serde_json::Value>> {
    ctx.account_manager.logout(&token).await?;
    Ok(Json(json!({ "message": "Successfully logged out" })))
}

async fn me(auth: AuthContext) -> Json<AccountSnapshot> {
    Json(auth.account)
}
