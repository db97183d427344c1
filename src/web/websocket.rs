use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::connect_info::ConnectInfo;
use axum::extract::{State, WebSocketUpgrade};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;

use super::server::WebState;

pub fn ws_routes() -> Router<Arc<WebState>> {
    Router::new().route("/ws/terminal", get(ws_handler))
}

async fn ws_handler(
    State(state): State<Arc<WebState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let (client_ip, user_agent) = match screen_connection(&state, &headers, addr).await {
        Ok(meta) => meta,
        Err(status) => return status.into_response(),
    };

    let bridge = state.bridge.clone();
    ws.on_upgrade(move |socket| async move {
        bridge.handle_socket(socket, client_ip, user_agent).await;
    })
    .into_response()
}

/// Run the connection rate check before the WebSocket handshake. An
/// over-limit IP gets 429 and the upgrade is never performed.
async fn screen_connection(
    state: &WebState,
    headers: &HeaderMap,
    addr: SocketAddr,
) -> Result<(String, String), StatusCode> {
    let client_ip = client_ip(headers, addr);

    if let Err(e) = state.bridge.limiter().check_connection(&client_ip).await {
        tracing::warn!(ip = %client_ip, error = %e, "Rejecting connection before handshake");
        return Err(StatusCode::TOO_MANY_REQUESTS);
    }

    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();

    Ok((client_ip, user_agent))
}

/// First hop of the forwarded-for header, falling back to the transport
/// peer address.
fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| peer.ip().to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use async_trait::async_trait;

    use crate::bridge::Bridge;
    use crate::config::Settings;
    use crate::container::{
        ContainerExec, ContainerHandle, ContainerStatus, ExecError, ExecHandle,
    };
    use crate::limits::{LimitError, RateLimiter};

    use super::*;

    struct NullRuntime;

    #[async_trait]
    impl ContainerExec for NullRuntime {
        async fn ensure_running(&self) -> Result<ContainerHandle, ExecError> {
            Err(ExecError::NotReady("no container in tests".to_string()))
        }

        async fn create_exec(
            &self,
            _container: &ContainerHandle,
            _argv: &[String],
            _user: &str,
            _env: &[(String, String)],
        ) -> Result<ExecHandle, ExecError> {
            Err(ExecError::Exec("no container in tests".to_string()))
        }

        async fn resize_exec(&self, _exec_id: &str, _cols: u16, _rows: u16) -> Result<(), ExecError> {
            Ok(())
        }

        async fn status(&self) -> ContainerStatus {
            ContainerStatus {
                status: "not_found".to_string(),
                running: false,
                container_id: None,
            }
        }
    }

    struct CountingLimiter {
        allow: bool,
        checks: AtomicU64,
    }

    #[async_trait]
    impl RateLimiter for CountingLimiter {
        async fn check_connection(&self, _ip: &str) -> Result<(), LimitError> {
            self.checks.fetch_add(1, Ordering::SeqCst);
            if self.allow {
                Ok(())
            } else {
                Err(LimitError::LimitExceeded)
            }
        }

        async fn check_command(&self, _key: &str) -> bool {
            true
        }

        async fn track(&self, _connection_id: &str, _ip: &str, _user_agent: &str) {}

        async fn untrack(&self, _connection_id: &str) {}

        async fn active_count(&self) -> u64 {
            0
        }

        fn degraded_count(&self) -> u64 {
            0
        }
    }

    fn state(allow: bool) -> Arc<WebState> {
        let bridge = Bridge::new(
            Arc::new(NullRuntime),
            Arc::new(CountingLimiter {
                allow,
                checks: AtomicU64::new(0),
            }),
            Arc::new(Settings::default()),
        );
        Arc::new(WebState {
            bridge: Arc::new(bridge),
        })
    }

    fn peer() -> SocketAddr {
        "192.0.2.7:50000".parse().unwrap()
    }

    #[test]
    fn test_client_ip_prefers_first_forwarded_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.9, 10.0.0.1".parse().unwrap());
        assert_eq!(client_ip(&headers, peer()), "203.0.113.9");
    }

    #[test]
    fn test_client_ip_falls_back_to_peer() {
        assert_eq!(client_ip(&HeaderMap::new(), peer()), "192.0.2.7");
    }

    #[test]
    fn test_client_ip_ignores_empty_forwarded_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "".parse().unwrap());
        assert_eq!(client_ip(&HeaderMap::new(), peer()), "192.0.2.7");
        assert_eq!(client_ip(&headers, peer()), "192.0.2.7");
    }

    #[tokio::test]
    async fn test_over_limit_connection_rejected_before_upgrade() {
        let state = state(false);
        let res = screen_connection(&state, &HeaderMap::new(), peer()).await;
        assert_eq!(res.unwrap_err(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_allowed_connection_passes_metadata() {
        let state = state(true);
        let mut headers = HeaderMap::new();
        headers.insert(header::USER_AGENT, "test-agent".parse().unwrap());
        let (ip, agent) = screen_connection(&state, &headers, peer()).await.unwrap();
        assert_eq!(ip, "192.0.2.7");
        assert_eq!(agent, "test-agent");
    }
}
