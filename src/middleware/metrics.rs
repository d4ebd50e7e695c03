//! Per-endpoint request metrics, plus a warning for requests that cross the
//! latency threshold.
//!
//! Requests are keyed by route pattern; everything that hits the default service
//! shares one `<unmatched>` entry.
//!
//! A WebSocket upgrade is measured up to the point the `101 Switching Protocols`
//! response is produced, so a slow entry for `GET /ws` means admission itself
//! was slow, not that the session was long.

use crate::state::AppState;
use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    web, Error,
};
use futures_util::future::LocalBoxFuture;
use std::{
    future::{ready, Ready},
    time::Instant,
};
use tracing::warn;

pub struct MetricsMiddleware;

impl<S, B> Transform<S, ServiceRequest> for MetricsMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = MetricsMiddlewareService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(MetricsMiddlewareService { service }))
    }
}

pub struct MetricsMiddlewareService<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for MetricsMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let start_time = Instant::now();
        let endpoint = endpoint_key(&req);

        let app_state = req.app_data::<web::Data<AppState>>().cloned();
        if let Some(state) = &app_state {
            state.increment_request_count();
        }

        let fut = self.service.call(req);

        Box::pin(async move {
            let result = fut.await;
            let duration = start_time.elapsed();

            let Some(state) = app_state else {
                return result;
            };

            let is_error = match &result {
                Ok(response) => response.status().is_client_error() || response.status().is_server_error(),
                Err(_) => true,
            };
            let is_slow = duration > state.config.websocket.slow_cycle_threshold();

            if is_slow {
                warn!(
                    endpoint = %endpoint,
                    duration_ms = duration.as_millis() as u64,
                    "Request exceeded latency threshold"
                );
            }

            state.record_endpoint_request(&endpoint, duration.as_millis() as u64, is_error, is_slow);
            if is_error {
                state.increment_error_count();
            }

            result
        })
    }
}

/// Metrics key for a request: the matched route pattern, never the raw path, so
/// the number of keys is bounded by the routes the app defines.
fn endpoint_key(req: &ServiceRequest) -> String {
    let pattern = req.request().match_pattern();
    format!("{} {}", req.method(), pattern.as_deref().unwrap_or(UNMATCHED_ROUTE))
}

const UNMATCHED_ROUTE: &str = "<unmatched>";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::state::test_state;
    use actix_web::{test, App, HttpResponse};

    #[actix_web::test]
    async fn test_records_requests_and_errors() {
        let state = test_state(AppConfig::default());
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .wrap(MetricsMiddleware)
                .route("/ok", web::get().to(|| async { HttpResponse::Ok().finish() }))
                .route("/fail", web::get().to(|| async { HttpResponse::ServiceUnavailable().finish() })),
        )
        .await;

        test::call_service(&app, test::TestRequest::get().uri("/ok").to_request()).await;
        test::call_service(&app, test::TestRequest::get().uri("/fail").to_request()).await;

        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.request_count, 2);
        assert_eq!(metrics.error_count, 1);
        assert_eq!(metrics.endpoint_metrics["GET /ok"].request_count, 1);
        assert_eq!(metrics.endpoint_metrics["GET /fail"].error_count, 1);
    }

    #[actix_web::test]
    async fn test_unmatched_paths_share_one_entry() {
        let state = test_state(AppConfig::default());
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .wrap(MetricsMiddleware)
                .route("/items/{id}", web::get().to(|| async { HttpResponse::Ok().finish() }))
                .default_service(web::to(crate::handlers::not_found)),
        )
        .await;

        for i in 0..200 {
            let req = test::TestRequest::get().uri(&format!("/scan-{i}")).to_request();
            test::call_service(&app, req).await;
        }
        for i in 0..3 {
            let req = test::TestRequest::get().uri(&format!("/items/{i}")).to_request();
            test::call_service(&app, req).await;
        }

        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.endpoint_metrics.len(), 2);
        assert_eq!(metrics.endpoint_metrics["GET <unmatched>"].request_count, 200);
        assert_eq!(metrics.endpoint_metrics["GET <unmatched>"].error_count, 200);
        assert_eq!(metrics.endpoint_metrics["GET /items/{id}"].request_count, 3);
    }
}
