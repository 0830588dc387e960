use rocket::fairing::{Fairing, Info, Kind};
use rocket::{Data, Request, Response};
use std::time::Instant;

/// When the request reached the server.
struct RequestStart(Instant);

/// Fairing to log one line per HTTP request with timing.
///
/// Server errors log at `warn`, documentation assets at `debug`.
pub struct RequestLogger;

#[rocket::async_trait]
impl Fairing for RequestLogger {
    fn info(&self) -> Info {
        Info {
            name: "Request Logger",
            kind: Kind::Request | Kind::Response,
        }
    }

    async fn on_request(&self, request: &mut Request<'_>, _: &mut Data<'_>) {
        request.local_cache(|| RequestStart(Instant::now()));
    }

    async fn on_response<'r>(&self, request: &'r Request<'_>, response: &mut Response<'r>) {
        let RequestStart(started) = request.local_cache(|| RequestStart(Instant::now()));
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let status = response.status();

        let level = if status.code >= 500 {
            log::Level::Warn
        } else if request.uri().path().starts_with("/api/docs") {
            log::Level::Debug
        } else {
            log::Level::Info
        };

        log::log!(
            level,
            "{} {} -> {} ({:.2}ms)",
            request.method(),
            request.uri(),
            status.code,
            elapsed_ms
        );
    }
}
