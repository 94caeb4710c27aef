use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::error;

/// 请求处理中的基础设施错误
///
/// 业务层面的 4xx/5xx（404、401、502 等）都由各处理器就地构造响应并记录日志，
/// 这里只兜底无法继续处理的情况，保证连接上总有一条完整的状态行。
#[derive(thiserror::Error, Debug)]
pub enum RouteError {
    #[error("bad request")]
    BadRequest(),
    #[error("internal error")]
    InternalError(),
    #[error("{0}")]
    Any(#[from] anyhow::Error),
}

// Tell axum how to convert `RouteError` into a response.
impl IntoResponse for RouteError {
    fn into_response(self) -> Response {
        use RouteError::*;

        let status = match &self {
            BadRequest() => StatusCode::BAD_REQUEST,
            InternalError() => StatusCode::INTERNAL_SERVER_ERROR,
            Any(err) => {
                error!("{err}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = status
            .canonical_reason()
            .unwrap_or("internal server error");
        (status, body.to_string()).into_response()
    }
}

pub type RouteResult<T, E = RouteError> = Result<T, E>;
