//! HTTP surface for the Drover manager.
//!
//! One axum listener carries two things: the HTTP message transport
//! (`POST /message`, speaking the same envelope as the WebSocket
//! transport) and, when enabled, the read-mostly admin surface. Admin
//! handlers forward onto core operations and never hold core state of
//! their own.

pub mod handlers;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

pub use handlers::ApiState;

/// Build the router. `with_admin` controls whether the admin routes are
/// mounted next to the transport endpoint.
pub fn router(state: ApiState, with_admin: bool) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let mut app = Router::new().route("/message", post(handlers::handle_message));

    if with_admin {
        app = app
            .route("/", get(handlers::handle_status))
            .route("/task", post(handlers::handle_post_task))
            .route("/template/register", post(handlers::handle_register_template))
            .route("/tasks/{template_id}", get(handlers::handle_tasks_for_template));
    }

    app.with_state(state).layer(cors)
}

pub async fn serve(state: ApiState, addr: &str, port: u16, with_admin: bool) -> anyhow::Result<()> {
    let app = router(state, with_admin);
    let listener = tokio::net::TcpListener::bind(format!("{addr}:{port}")).await?;
    tracing::info!(addr, port, with_admin, "HTTP surface listening");
    axum::serve(listener, app).await?;
    Ok(())
}
