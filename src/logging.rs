use crate::LOG;

/// Log all requests and responses through the root slog logger.
#[derive(Debug, Default, Clone)]
pub struct LogMiddleware;

impl LogMiddleware {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl<State: Clone + Send + Sync + 'static> tide::Middleware<State> for LogMiddleware {
    async fn handle(&self, req: tide::Request<State>, next: tide::Next<'_, State>) -> tide::Result {
        let path = req.url().path().to_string();
        let method = req.method();
        let start = std::time::Instant::now();
        let response = next.run(req).await;
        let status = response.status();
        let elapsed_ms = start.elapsed().as_millis() as u64;
        if status.is_server_error() {
            slog::error!(
                LOG, "request error";
                "method" => %method,
                "path" => &path,
                "status" => u16::from(status),
                "elapsed_ms" => elapsed_ms,
                "error" => response.error().map(|e| e.to_string()),
            );
        } else {
            slog::info!(
                LOG, "request";
                "method" => %method,
                "path" => &path,
                "status" => u16::from(status),
                "elapsed_ms" => elapsed_ms,
            );
        }
        Ok(response)
    }
}
