//! Sign-in through the hosted identity provider and the login sessions issued afterwards.

use async_trait::async_trait;
use axum::extract::{FromRequest, RequestParts};
use axum::headers::Cookie;
use axum::http::header::SET_COOKIE;
use axum::response::{IntoResponse, Redirect, Response};
use axum::{Extension, TypedHeader};
use chrono::{DateTime, Duration, Utc};
use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize, Serializer};
use sha2::{Digest, Sha256};
use url::Url;
use uuid::Uuid;

use crate::config::IdentityConfig;
use crate::extract::{Json, Query};
use crate::models::{Faculty, LoginSession};
use crate::store::Transaction;
use crate::{proceeds, AppState, Error, Payload};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScreenHint {
    SignIn,
    SignUp,
}

impl ScreenHint {
    fn as_str(&self) -> &'static str {
        match self {
            ScreenHint::SignIn => "sign-in",
            ScreenHint::SignUp => "sign-up",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationOptions {
    pub return_pathname: Option<String>,
    pub screen_hint: Option<ScreenHint>,
    pub redirect_uri: Option<String>,
}

/// A user as reported by the identity provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalUser {
    pub id: String,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

impl ExternalUser {
    pub fn display_name(&self) -> String {
        let parts: Vec<&str> = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .filter(|part| !part.is_empty())
            .collect();
        if parts.is_empty() {
            self.email.clone()
        } else {
            parts.join(" ")
        }
    }
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    fn authorization_url(&self, options: &AuthorizationOptions) -> Result<Url, Error>;

    /// Exchanges an authorization code from the sign-in redirect for the user.
    async fn authenticate(&self, code: &str) -> Result<ExternalUser, Error>;
}

/// WorkOS AuthKit user management API.
pub struct WorkOs {
    http: reqwest::Client,
    client_id: String,
    api_key: String,
    redirect_uri: String,
    api_base: String,
}

impl WorkOs {
    pub fn new(config: &IdentityConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            client_id: config.client_id.clone(),
            api_key: config.api_key.clone(),
            redirect_uri: config.redirect_uri.clone(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignInState {
    return_pathname: String,
}

fn encode_state(return_pathname: &str) -> Result<String, Error> {
    let json = serde_json::to_vec(&SignInState {
        return_pathname: return_pathname.to_string(),
    })?;
    Ok(hex::encode(json))
}

/// Where to send the browser after the callback. Only local paths are honoured.
fn decode_state(state: Option<&str>) -> String {
    state
        .and_then(|state| hex::decode(state).ok())
        .and_then(|bytes| serde_json::from_slice::<SignInState>(&bytes).ok())
        .map(|state| state.return_pathname)
        .filter(|path| is_local_path(path))
        .unwrap_or_else(|| "/".to_string())
}

fn is_local_path(path: &str) -> bool {
    path.starts_with('/') && !path.starts_with("//")
}

#[async_trait]
impl IdentityProvider for WorkOs {
    fn authorization_url(&self, options: &AuthorizationOptions) -> Result<Url, Error> {
        let redirect_uri = options
            .redirect_uri
            .as_deref()
            .unwrap_or(&self.redirect_uri);
        let mut url = Url::parse_with_params(
            &format!("{}/user_management/authorize", self.api_base),
            &[
                ("client_id", self.client_id.as_str()),
                ("redirect_uri", redirect_uri),
                ("response_type", "code"),
                ("provider", "authkit"),
            ],
        )?;
        if let Some(path) = &options.return_pathname {
            let state = encode_state(path)?;
            url.query_pairs_mut().append_pair("state", &state);
        }
        if let Some(hint) = options.screen_hint {
            url.query_pairs_mut().append_pair("screen_hint", hint.as_str());
        }
        Ok(url)
    }

    async fn authenticate(&self, code: &str) -> Result<ExternalUser, Error> {
        #[derive(Serialize)]
        struct AuthenticateRequest<'a> {
            client_id: &'a str,
            client_secret: &'a str,
            grant_type: &'static str,
            code: &'a str,
        }

        #[derive(Deserialize)]
        struct AuthenticateResponse {
            user: ExternalUser,
        }

        let response = self
            .http
            .post(format!("{}/user_management/authenticate", self.api_base))
            .json(&AuthenticateRequest {
                client_id: &self.client_id,
                client_secret: &self.api_key,
                grant_type: "authorization_code",
                code,
            })
            .send()
            .await?;

        if response.status().is_client_error() {
            log::warn!("Identity provider rejected the authorization code");
            return Err(Error::unauthorized("Authorization code was rejected"));
        }
        let body: AuthenticateResponse = response.error_for_status()?.json().await?;
        Ok(body.user)
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum AuthResult {
    Success(LoginSession),
    SessionExpired,
    InvalidSession,
}

impl Serialize for AuthResult {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(match self {
            AuthResult::Success(_) => "Success",
            AuthResult::SessionExpired => "SessionExpired",
            AuthResult::InvalidSession => "InvalidSession",
        })
    }
}

/// Resolves a session id from the cookie. Expired sessions are deleted on sight.
pub async fn ensure_authenticated(
    tx: &mut dyn Transaction,
    session_id: Option<&str>,
    now: DateTime<Utc>,
) -> Result<AuthResult, Error> {
    let ssid = match session_id {
        Some(ssid) if !ssid.is_empty() => ssid,
        _ => return Ok(AuthResult::InvalidSession),
    };

    match tx.find_login_session(ssid).await? {
        Some(session) if now > session.expires_at => {
            tx.delete_login_session(ssid).await?;
            Ok(AuthResult::SessionExpired)
        }
        Some(session) => Ok(AuthResult::Success(session)),
        None => Ok(AuthResult::InvalidSession),
    }
}

fn new_ssid() -> String {
    let ssid_bytes: [u8; 32] = thread_rng().gen();

    let mut hasher: Sha256 = Digest::new();
    hasher.update(&ssid_bytes);
    let result = hasher.finalize();
    hex::encode(result)
}

pub async fn create_login_session(
    tx: &mut dyn Transaction,
    user: &ExternalUser,
    ttl: Duration,
    now: DateTime<Utc>,
) -> Result<LoginSession, Error> {
    let session = LoginSession {
        ssid: new_ssid(),
        user_id: user.id.clone(),
        email: user.email.clone(),
        name: user.display_name(),
        expires_at: now + ttl,
    };
    tx.insert_login_session(&session).await?;
    Ok(session)
}

/// First sign-in creates the faculty profile; later sign-ins find it by provider user id.
pub async fn reconcile_faculty(
    tx: &mut dyn Transaction,
    user: &ExternalUser,
    now: DateTime<Utc>,
) -> Result<Faculty, Error> {
    if let Some(faculty) = tx.find_faculty_by_external_id(&user.id).await? {
        return Ok(faculty);
    }
    let faculty = Faculty {
        id: Uuid::new_v4(),
        external_user_id: user.id.clone(),
        email: user.email.clone(),
        name: user.display_name(),
        department: None,
        is_active: true,
        created_at: now,
        updated_at: now,
    };
    tx.insert_faculty(&faculty).await?;
    log::info!("Created faculty profile {} for {}", faculty.id, faculty.email);
    Ok(faculty)
}

fn session_cookie(config: &IdentityConfig, value: &str, max_age_secs: i64) -> String {
    let mut cookie = format!(
        "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
        config.cookie_name, value, max_age_secs
    );
    if config.secure_cookies {
        cookie.push_str("; Secure");
    }
    cookie
}

fn session_id_from(config: &IdentityConfig, cookie: &Option<TypedHeader<Cookie>>) -> Option<String> {
    cookie
        .as_ref()
        .and_then(|TypedHeader(cookie)| cookie.get(&config.cookie_name))
        .map(str::to_string)
}

/// The faculty member behind the request's login session.
#[derive(Debug, Clone)]
pub struct CurrentFaculty(pub Faculty);

#[async_trait]
impl<B> FromRequest<B> for CurrentFaculty
where
    B: Send,
{
    type Rejection = Error;

    async fn from_request(req: &mut RequestParts<B>) -> Result<Self, Self::Rejection> {
        let Extension(state) = Extension::<AppState>::from_request(req)
            .await
            .map_err(|err| Error::internal("MissingState", err.to_string()))?;
        let cookie = Option::<TypedHeader<Cookie>>::from_request(req)
            .await
            .unwrap_or(None);
        let ssid = session_id_from(&state.identity, &cookie);

        let mut tx = state.store.begin().await?;
        let session = match ensure_authenticated(&mut *tx, ssid.as_deref(), Utc::now()).await? {
            AuthResult::Success(session) => session,
            AuthResult::SessionExpired => {
                tx.commit().await?;
                return Err(Error::unauthorized("Session expired, sign in again"));
            }
            AuthResult::InvalidSession => {
                return Err(Error::unauthorized("Sign in to continue"));
            }
        };
        let faculty = tx
            .find_faculty_by_external_id(&session.user_id)
            .await?
            .filter(|faculty| faculty.is_active)
            .ok_or_else(|| Error::unauthorized("Signed-in user has no faculty profile"))?;
        Ok(CurrentFaculty(faculty))
    }
}

pub async fn authorize(
    Query(options): Query<AuthorizationOptions>,
    Extension(state): Extension<AppState>,
) -> Payload<AuthorizationUrl> {
    let url = state.provider.authorization_url(&options)?;
    proceeds(AuthorizationUrl {
        url: url.to_string(),
    })
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReturnTo {
    pub return_pathname: Option<String>,
}

fn redirect_to_provider(
    state: &AppState,
    return_pathname: Option<String>,
    hint: ScreenHint,
) -> Result<Redirect, Error> {
    let url = state.provider.authorization_url(&AuthorizationOptions {
        return_pathname,
        screen_hint: Some(hint),
        redirect_uri: None,
    })?;
    Ok(Redirect::to(url.as_str()))
}

pub async fn sign_in(
    Query(ReturnTo { return_pathname }): Query<ReturnTo>,
    Extension(state): Extension<AppState>,
) -> Result<Redirect, Error> {
    redirect_to_provider(&state, return_pathname, ScreenHint::SignIn)
}

pub async fn sign_up(
    Query(ReturnTo { return_pathname }): Query<ReturnTo>,
    Extension(state): Extension<AppState>,
) -> Result<Redirect, Error> {
    redirect_to_provider(&state, return_pathname, ScreenHint::SignUp)
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackParams {
    pub code: String,
    pub state: Option<String>,
}

pub async fn callback(
    Query(params): Query<CallbackParams>,
    Extension(state): Extension<AppState>,
) -> Result<Response, Error> {
    if params.code.is_empty() {
        return Err(Error::invalid("`code` parameter was empty"));
    }
    let user = state.provider.authenticate(&params.code).await?;

    let now = Utc::now();
    let ttl = Duration::hours(state.identity.session_ttl_hours);
    let mut tx = state.store.begin().await?;
    reconcile_faculty(&mut *tx, &user, now).await?;
    let session = create_login_session(&mut *tx, &user, ttl, now).await?;
    tx.commit().await?;
    log::info!("User {} signed in", user.email);

    let cookie = session_cookie(&state.identity, &session.ssid, ttl.num_seconds());
    let target = decode_state(params.state.as_deref());
    Ok(([(SET_COOKIE, cookie)], Redirect::to(&target)).into_response())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationUrl {
    pub url: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUser {
    pub id: String,
    pub email: String,
    pub name: String,
    pub faculty_id: Option<Uuid>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthInfo {
    pub auth_result: AuthResult,
    pub user: Option<SessionUser>,
}

pub async fn me(
    cookie: Option<TypedHeader<Cookie>>,
    Extension(state): Extension<AppState>,
) -> Payload<AuthInfo> {
    let ssid = session_id_from(&state.identity, &cookie);
    let mut tx = state.store.begin().await?;
    let auth_result = ensure_authenticated(&mut *tx, ssid.as_deref(), Utc::now()).await?;
    let user = match &auth_result {
        AuthResult::Success(session) => {
            let faculty = tx.find_faculty_by_external_id(&session.user_id).await?;
            Some(SessionUser {
                id: session.user_id.clone(),
                email: session.email.clone(),
                name: session.name.clone(),
                faculty_id: faculty.map(|f| f.id),
                expires_at: session.expires_at,
            })
        }
        _ => None,
    };
    tx.commit().await?;
    proceeds(AuthInfo { auth_result, user })
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignOut {
    pub return_to: Option<String>,
}

pub async fn sign_out(
    cookie: Option<TypedHeader<Cookie>>,
    Extension(state): Extension<AppState>,
    body: Option<Json<SignOut>>,
) -> Result<Response, Error> {
    if let Some(ssid) = session_id_from(&state.identity, &cookie) {
        let mut tx = state.store.begin().await?;
        let dropped = tx.delete_login_session(&ssid).await?;
        tx.commit().await?;
        log::debug!("Sign-out dropped session: {}", dropped);
    }

    let target = body
        .and_then(|Json(body)| body.return_to)
        .filter(|path| is_local_path(path))
        .unwrap_or_else(|| "/".to_string());
    let cleared = session_cookie(&state.identity, "", 0);
    Ok(([(SET_COOKIE, cleared)], Redirect::to(&target)).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, RecordStore};

    fn workos() -> WorkOs {
        WorkOs::new(&IdentityConfig {
            client_id: "client_123".to_string(),
            redirect_uri: "http://localhost:3000/auth/callback".to_string(),
            ..IdentityConfig::default()
        })
    }

    fn user() -> ExternalUser {
        ExternalUser {
            id: "user_01".to_string(),
            email: "grace@uni.edu".to_string(),
            first_name: Some("Grace".to_string()),
            last_name: Some("Hopper".to_string()),
        }
    }

    #[test]
    fn authorization_url_carries_state_and_hint() {
        let url = workos()
            .authorization_url(&AuthorizationOptions {
                return_pathname: Some("/faculty".to_string()),
                screen_hint: Some(ScreenHint::SignUp),
                redirect_uri: None,
            })
            .unwrap();
        assert_eq!(url.path(), "/user_management/authorize");

        let pairs: std::collections::HashMap<String, String> =
            url.query_pairs().into_owned().collect();
        assert_eq!(pairs["client_id"], "client_123");
        assert_eq!(pairs["redirect_uri"], "http://localhost:3000/auth/callback");
        assert_eq!(pairs["provider"], "authkit");
        assert_eq!(pairs["screen_hint"], "sign-up");
        assert_eq!(decode_state(Some(&pairs["state"])), "/faculty");
    }

    #[test]
    fn authorization_url_honours_redirect_override() {
        let url = workos()
            .authorization_url(&AuthorizationOptions {
                redirect_uri: Some("https://attendance.uni.edu/cb".to_string()),
                ..AuthorizationOptions::default()
            })
            .unwrap();
        let pairs: std::collections::HashMap<String, String> =
            url.query_pairs().into_owned().collect();
        assert_eq!(pairs["redirect_uri"], "https://attendance.uni.edu/cb");
        assert!(!pairs.contains_key("state"));
        assert!(!pairs.contains_key("screen_hint"));
    }

    #[test]
    fn foreign_return_paths_fall_back_to_root() {
        let evil = encode_state("//evil.example").unwrap();
        assert_eq!(decode_state(Some(&evil)), "/");
        assert_eq!(decode_state(Some("zz")), "/");
        assert_eq!(decode_state(None), "/");
    }

    #[test]
    fn display_name_falls_back_to_email() {
        assert_eq!(user().display_name(), "Grace Hopper");
        let anonymous = ExternalUser {
            first_name: None,
            last_name: None,
            ..user()
        };
        assert_eq!(anonymous.display_name(), "grace@uni.edu");
    }

    #[tokio::test]
    async fn sessions_expire_and_are_removed() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let now = Utc::now();
        let session = create_login_session(&mut *tx, &user(), Duration::hours(1), now)
            .await
            .unwrap();
        assert_eq!(session.ssid.len(), 64);

        let result = ensure_authenticated(&mut *tx, Some(&session.ssid), now)
            .await
            .unwrap();
        assert_eq!(result, AuthResult::Success(session.clone()));

        let later = now + Duration::hours(2);
        let result = ensure_authenticated(&mut *tx, Some(&session.ssid), later)
            .await
            .unwrap();
        assert_eq!(result, AuthResult::SessionExpired);
        assert!(tx.find_login_session(&session.ssid).await.unwrap().is_none());

        let result = ensure_authenticated(&mut *tx, Some(""), now).await.unwrap();
        assert_eq!(result, AuthResult::InvalidSession);
    }

    #[tokio::test]
    async fn faculty_is_created_once() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let now = Utc::now();
        let first = reconcile_faculty(&mut *tx, &user(), now).await.unwrap();
        let second = reconcile_faculty(&mut *tx, &user(), now).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.name, "Grace Hopper");
        assert_eq!(first.external_user_id, "user_01");
    }
}
