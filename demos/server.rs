use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::Router;
use cloud_request_log::init::init_local_logging;
use cloud_request_log::{Logger, Payload, RequestLog, RequestLogLayer};
use serde::Serialize;

#[derive(Serialize)]
struct Message {
    places: Vec<&'static str>,
}

/// Uses the logger the layer put on the request.
async fn wrapped(log: RequestLog) -> &'static str {
    log.debugf(format_args!("Debug"));
    log.infof(format_args!("Info"));
    log.noticef(format_args!("Notice"));
    log.warningf(format_args!("Warning"));
    log.errorf(format_args!("Error"));
    log.criticalf(format_args!("Critical"));
    log.alertf(format_args!("Alert"));
    log.emergencyf(format_args!("Emergency"));

    let message = Message {
        places: vec!["Kings Canyon", "Sequoia", "Yosemite", "Death Valley"],
    };
    match Payload::json(&message) {
        Ok(payload) => log.info(payload),
        Err(err) => log.errorf(format_args!("unloggable payload: {}", err)),
    }

    "Hello!"
}

/// Creates and closes a logger by hand; needs no layer.
async fn manual(headers: HeaderMap) -> Result<&'static str, StatusCode> {
    let (lg, err) = Logger::new(&headers).await;
    if let Some(err) = err {
        // The returned logger is valid despite the error; it logs locally.
        lg.errorf(format_args!("Failed to make logger: {}", err));
    }

    lg.warningf(format_args!("Some important info right here, that's for sure"));

    lg.close().await.map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok("Hello!")
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_local_logging()?;

    let app = Router::new()
        .route("/", get(wrapped).layer(RequestLogLayer::new()))
        .route("/manual", get(manual));

    let port = std::env::var("PORT").unwrap_or_else(|_| "8080".to_string());
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    tracing::info!(%port, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}
