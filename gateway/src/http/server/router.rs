use core::{net::SocketAddr, time::Duration};

use axum::{
    Router,
    extract::connect_info::IntoMakeServiceWithConnectInfo,
    http::{
        StatusCode,
        header::{AUTHORIZATION, COOKIE},
    },
    middleware::{self as ax_middleware},
    routing::get,
};
use tower::ServiceBuilder;
use tower_http::{
    ServiceBuilderExt as _, request_id::MakeRequestUuid, timeout::TimeoutLayer, trace::TraceLayer,
};

use crate::{
    app::AppState,
    http::{
        api,
        server::middleware::{LevelAdjustingOnFailure, require_admin, secure_headers_middleware},
    },
};

/// Creates the router: caller routes, admin routes behind the admin allow-list, and the entry point.
///
/// `/{domain}` is matched last; every `/api/...` route takes precedence.
pub(crate) fn create_app_router(app_state: &AppState) -> Router<AppState> {
    let admin = api::admin_routes().route_layer(ax_middleware::from_fn_with_state(
        app_state.clone(),
        require_admin,
    ));

    Router::new()
        .nest("/api", api::routes().merge(admin))
        .route("/{domain}", get(api::entry))
}

pub(crate) fn create_app(app_state: AppState) -> IntoMakeServiceWithConnectInfo<Router<()>, SocketAddr> {
    let middleware_stack = ServiceBuilder::new()
        .sensitive_headers([AUTHORIZATION, COOKIE])
        .set_x_request_id(MakeRequestUuid)
        .propagate_x_request_id()
        .layer(TraceLayer::new_for_http().on_failure(LevelAdjustingOnFailure))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(30),
        ))
        .layer(ax_middleware::from_fn(secure_headers_middleware));

    let app = create_app_router(&app_state)
        .with_state(app_state)
        .fallback(|| async { (StatusCode::NOT_FOUND, "not found") })
        .layer(middleware_stack);

    app.into_make_service_with_connect_info::<SocketAddr>()
}
