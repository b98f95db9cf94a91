//! Request logging through the app's slog logger
use std::time::Instant;

use crate::LOG;

/// Logs every request, and turns handler errors into a json body
/// so clients always get `{"error": ..}` back
#[derive(Debug, Default, Clone)]
pub struct LogMiddleware {
    _priv: (),
}

impl LogMiddleware {
    pub fn new() -> Self {
        Self { _priv: () }
    }

    async fn log<'a, State: Clone + Send + Sync + 'static>(
        &'a self,
        req: tide::Request<State>,
        next: tide::Next<'a, State>,
    ) -> tide::Result {
        let path = req.url().path().to_string();
        let method = req.method().to_string();
        let start = Instant::now();
        let mut resp = next.run(req).await;
        let status = resp.status();
        let elapsed_ms = start.elapsed().as_millis() as u64;

        if let Some(err) = resp.error() {
            let details = err.to_string();
            slog::error!(
                LOG, "internal error";
                "method" => &method,
                "path" => &path,
                "status" => u16::from(status),
                "duration_ms" => elapsed_ms,
                "error" => &details,
            );
            if status.is_server_error() {
                resp.set_body(serde_json::json!({
                    "error": "Internal server error",
                    "details": details,
                }));
            } else {
                resp.set_body(serde_json::json!({ "error": details }));
            }
        } else if status.is_client_error() {
            slog::warn!(
                LOG, "client error";
                "method" => &method,
                "path" => &path,
                "status" => u16::from(status),
                "duration_ms" => elapsed_ms,
            );
        } else {
            slog::info!(
                LOG, "request";
                "method" => &method,
                "path" => &path,
                "status" => u16::from(status),
                "duration_ms" => elapsed_ms,
            );
        }
        Ok(resp)
    }
}

#[async_trait::async_trait]
impl<State: Clone + Send + Sync + 'static> tide::Middleware<State> for LogMiddleware {
    async fn handle(&self, req: tide::Request<State>, next: tide::Next<'_, State>) -> tide::Result {
        self.log(req, next).await
    }
}
