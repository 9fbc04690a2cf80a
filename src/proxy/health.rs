use std::time::Duration;

use crate::constants::{HEALTH_BODY, HEALTH_PROBE_TIMEOUT_MS};

/// `GET /health`
pub(crate) async fn health_handler() -> &'static str {
    HEALTH_BODY
}

/// Check if a gateway answers on `base_url` (e.g. `http://127.0.0.1:8765`)
pub async fn is_gateway_running(base_url: &str) -> bool {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(HEALTH_PROBE_TIMEOUT_MS))
        .build();

    if let Ok(client) = client {
        let url = format!("{}/health", base_url.trim_end_matches('/'));
        if let Ok(resp) = client.get(&url).send().await {
            if !resp.status().is_success() {
                return false;
            }
            return matches!(resp.text().await, Ok(body) if body == HEALTH_BODY);
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_nothing_listening() {
        // Bind then drop to get a port that is very likely closed
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        assert!(!is_gateway_running(&format!("http://{}", addr)).await);
    }
}
