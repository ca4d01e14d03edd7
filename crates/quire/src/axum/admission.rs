use async_trait::async_trait;
use axum::http::HeaderMap;

use crate::{QuireError, QuireResult};

/// Header carrying the authenticated user id
pub const USER_ID_HEADER: &str = "x-user-id";
/// Header carrying `true`/`false` write access to the requested document
pub const EDITABLE_HEADER: &str = "x-editable";

/// Identity and access level of an incoming connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub user_id: String,
    pub editable: bool,
}

/// Decides who may open a document connection, before any session is involved
#[async_trait]
pub trait ConnectionAdmission: Send + Sync + 'static {
    async fn admit(&self, doc_id: &str, headers: &HeaderMap) -> QuireResult<Admission>;
}

/// Trusts identity headers set by an authenticating reverse proxy.
///
/// Only suitable when the server is not reachable except through that proxy.
/// A missing `x-editable` header means read-only.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrustedHeaderAdmission;

#[async_trait]
impl ConnectionAdmission for TrustedHeaderAdmission {
    async fn admit(&self, doc_id: &str, headers: &HeaderMap) -> QuireResult<Admission> {
        let user_id = headers
            .get(USER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                QuireError::Admission(format!("missing {} for document {}", USER_ID_HEADER, doc_id))
            })?;

        let editable = match headers.get(EDITABLE_HEADER).map(|value| value.to_str()) {
            None => false,
            Some(Ok(value)) if value.eq_ignore_ascii_case("true") || value == "1" => true,
            Some(Ok(value)) if value.eq_ignore_ascii_case("false") || value == "0" => false,
            Some(_) => {
                return Err(QuireError::Admission(format!(
                    "invalid {} header",
                    EDITABLE_HEADER
                )))
            }
        };

        Ok(Admission {
            user_id: user_id.to_string(),
            editable,
        })
    }
}
