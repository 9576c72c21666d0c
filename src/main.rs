pub mod api;
pub mod auth;
pub mod config;
pub mod err;
pub mod extract;
pub mod models;
pub mod rules;
pub mod store;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::handler::Handler;
use axum::routing::{delete, get, patch, post};
use axum::{Extension, Router};
use chrono::FixedOffset;
use serde::Serialize;

use crate::auth::{IdentityProvider, WorkOs};
use crate::config::{Config, IdentityConfig, StoreKind};
use crate::err::{Error, Fine, Maybe};
use crate::store::{MemoryStore, PgStore, RecordStore};

pub type Payload<T> = Result<Maybe<T>, Error>;

pub fn proceeds<V>(value: V) -> Payload<V>
where
    V: Serialize,
{
    Ok(Fine(value))
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RecordStore>,
    pub provider: Arc<dyn IdentityProvider>,
    pub identity: IdentityConfig,
    pub campus_offset: FixedOffset,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/auth/authorize", get(auth::authorize))
        .route("/auth/sign-in", get(auth::sign_in))
        .route("/auth/sign-up", get(auth::sign_up))
        .route("/auth/callback", get(auth::callback))
        .route("/auth/me", get(auth::me))
        .route("/auth/sign-out", post(auth::sign_out))
        .route("/classes", post(api::create_class))
        .route("/classes/register", post(api::register_for_class))
        .route("/classes/code/:code", get(api::class_by_code))
        .route("/classes/:id", get(api::class_details))
        .route(
            "/classes/:id/timetable",
            get(api::class_timetable).put(api::replace_timetable),
        )
        .route("/timetable/:id", delete(api::delete_timetable_entry))
        .route("/faculty/:id/classes", get(api::faculty_classes))
        .route("/faculty/:id/timetable", get(api::faculty_timetable))
        .route("/enrollments", post(api::enroll))
        .route("/enrollments/check", get(api::check_enrollment))
        .route("/students", post(api::create_or_find_student))
        .route("/students/lookup", post(api::find_student))
        .route("/students/:id/classes", get(api::student_classes))
        .route("/students/:id/attendance", get(api::student_attendance))
        .route("/attendance/sessions", post(api::start_session))
        .route("/attendance/sessions/:id/close", post(api::close_session))
        .route("/attendance/sessions/:id/records", get(api::session_records))
        .route("/attendance/mark", post(api::mark_attendance))
        .route("/attendance/records/:id", patch(api::edit_record))
        .layer(Extension(state))
        .fallback(err::handler404.into_service())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let config = Config::load()?;

    let store: Arc<dyn RecordStore> = match config.store {
        StoreKind::Memory => {
            log::warn!("Using the in-memory store; records are lost on shutdown");
            Arc::new(MemoryStore::new())
        }
        StoreKind::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is not set"))?;
            Arc::new(PgStore::connect(url, config.max_connections).await?)
        }
    };
    let state = AppState {
        store,
        provider: Arc::new(WorkOs::new(&config.identity)),
        identity: config.identity.clone(),
        campus_offset: config.campus_offset()?,
    };

    log::info!("Starting attendance server on http://{}", config.bind_addr);
    axum::Server::bind(&config.bind_addr)
        .serve(app(state).into_make_service_with_connect_info::<SocketAddr>())
        .await?;
    Ok(())
}
