use async_trait::async_trait;
use log::debug;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::models::{
    AlertQuery, AlertResponse, AlertStatusResponse, AlertsListResponse, ApiErrorBody,
    EmergencyAlertRequest, HealthResponse, SensorEventRequest, SensorEventResponse,
    UpdateAlertStatusRequest,
};
use crate::config::ApiConfig;
use crate::error::{EngineError, EngineResult};

/// Remote alert backend.
#[async_trait]
pub trait AlertApi: Send + Sync {
    async fn send_emergency_alert(&self, request: &EmergencyAlertRequest)
        -> EngineResult<AlertResponse>;

    async fn get_alert(&self, alert_id: &str) -> EngineResult<AlertStatusResponse>;

    async fn list_alerts(&self, query: &AlertQuery) -> EngineResult<AlertsListResponse>;

    async fn update_alert_status(&self, alert_id: &str, status: &str) -> EngineResult<()>;

    async fn send_sensor_event(&self, request: &SensorEventRequest)
        -> EngineResult<SensorEventResponse>;

    async fn health(&self) -> EngineResult<HealthResponse>;
}

/// reqwest-backed client authenticating with `Authorization: Bearer <api_key>`.
pub struct ApiClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl ApiClient {
    pub fn new(config: &ApiConfig) -> Self {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .user_agent(concat!("crash_alert_rs/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| Client::new());

        let mut base_url = config.base_url.trim().to_string();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }

        ApiClient {
            client,
            base_url,
            api_key: config.api_key.clone(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path.trim_start_matches('/'))
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.api_key)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> EngineResult<T> {
        debug!("[api] GET {}", path);
        let response = self
            .client
            .get(self.url(path))
            .header(reqwest::header::AUTHORIZATION, self.bearer())
            .query(query)
            .send()
            .await?;
        let (status, text) = read_success(response).await?;
        decode_body(status, &text)
    }

    async fn send_json<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: &B,
    ) -> EngineResult<T> {
        let (status, text) = self.send(method, path, body).await?;
        decode_body(status, &text)
    }

    /// Send `body` and return the status and raw text of a 2xx answer.
    async fn send<B: Serialize + Sync>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: &B,
    ) -> EngineResult<(u16, String)> {
        debug!("[api] {} {}", method, path);
        let response = self
            .client
            .request(method, self.url(path))
            .header(reqwest::header::AUTHORIZATION, self.bearer())
            .json(body)
            .send()
            .await?;
        read_success(response).await
    }
}

/// Map a non-2xx response to `EngineError::Api`, otherwise return the body text.
async fn read_success(response: Response) -> EngineResult<(u16, String)> {
    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ApiErrorBody>(&text)
            .map(|body| body.message())
            .unwrap_or_else(|_| {
                if text.is_empty() {
                    status.to_string()
                } else {
                    text
                }
            });
        return Err(EngineError::Api {
            status: status.as_u16(),
            message,
        });
    }

    let text = response.text().await?;
    Ok((status.as_u16(), text))
}

/// Parse a 2xx body. Failure here is final: the request already went through.
fn decode_body<T: DeserializeOwned>(status: u16, text: &str) -> EngineResult<T> {
    serde_json::from_str(text).map_err(|e| EngineError::InvalidResponse {
        status,
        message: e.to_string(),
    })
}

#[async_trait]
impl AlertApi for ApiClient {
    async fn send_emergency_alert(
        &self,
        request: &EmergencyAlertRequest,
    ) -> EngineResult<AlertResponse> {
        self.send_json(reqwest::Method::POST, "api/v1/emergency-alert", request)
            .await
    }

    async fn get_alert(&self, alert_id: &str) -> EngineResult<AlertStatusResponse> {
        self.get_json(&format!("api/v1/alerts/{}", alert_id), &[])
            .await
    }

    async fn list_alerts(&self, query: &AlertQuery) -> EngineResult<AlertsListResponse> {
        self.get_json("api/v1/alerts", &query.to_pairs()).await
    }

    async fn update_alert_status(&self, alert_id: &str, status: &str) -> EngineResult<()> {
        let body = UpdateAlertStatusRequest {
            status: status.to_string(),
        };
        // any 2xx is an acknowledgement, including 204 with no body
        self.send(
            reqwest::Method::PUT,
            &format!("api/alerts/{}/status", alert_id),
            &body,
        )
        .await?;
        Ok(())
    }

    async fn send_sensor_event(
        &self,
        request: &SensorEventRequest,
    ) -> EngineResult<SensorEventResponse> {
        self.send_json(reqwest::Method::POST, "api/v1/sensor-events", request)
            .await
    }

    async fn health(&self) -> EngineResult<HealthResponse> {
        self.get_json("health", &[]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response and hand back the raw request text.
    async fn serve_once(
        status_line: &'static str,
        body: &'static str,
    ) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request).to_string();
                if let Some(header_end) = text.find("\r\n\r\n") {
                    let content_length = text[..header_end]
                        .lines()
                        .find_map(|l| {
                            let lower = l.to_ascii_lowercase();
                            lower
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                        })
                        .unwrap_or(0);
                    if request.len() >= header_end + 4 + content_length {
                        break;
                    }
                }
            }
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status_line,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&request).to_string()
        });
        (format!("http://{}", addr), handle)
    }

    fn client(base_url: String) -> ApiClient {
        ApiClient::new(&ApiConfig {
            base_url,
            api_key: "secret".to_string(),
            ..Default::default()
        })
    }

    #[test]
    fn test_url_joining() {
        let c = client("http://example.com/backend".to_string());
        assert_eq!(c.base_url(), "http://example.com/backend/");
        assert_eq!(
            c.url("/api/v1/alerts/a1"),
            "http://example.com/backend/api/v1/alerts/a1"
        );
    }

    #[tokio::test]
    async fn test_health_sends_bearer_token() {
        let (base, server) = serve_once(
            "200 OK",
            r#"{"status":"healthy","database":"connected","timestamp":"t","websocket_connections":0,"services":{}}"#,
        )
        .await;
        let health = client(base).health().await.unwrap();
        assert!(health.is_healthy());

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /health"));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer secret"));
    }

    #[tokio::test]
    async fn test_client_error_maps_to_api_error() {
        let (base, server) = serve_once("401 Unauthorized", r#"{"detail":"Invalid API key"}"#).await;
        let err = client(base).get_alert("a1").await.unwrap_err();
        assert_eq!(
            err,
            EngineError::Api {
                status: 401,
                message: "Invalid API key".to_string()
            }
        );
        assert!(!err.is_retryable());

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /api/v1/alerts/a1"));
    }

    #[tokio::test]
    async fn test_status_update_uses_put() {
        let (base, server) = serve_once("200 OK", r#"{"message":"ok"}"#).await;
        client(base)
            .update_alert_status("a9", "COMPLETED")
            .await
            .unwrap();
        let request = server.await.unwrap();
        assert!(request.starts_with("PUT /api/alerts/a9/status"));
        assert!(request.contains(r#"{"status":"COMPLETED"}"#));
    }

    #[tokio::test]
    async fn test_status_update_accepts_empty_no_content() {
        let (base, server) = serve_once("204 No Content", "").await;
        client(base)
            .update_alert_status("a9", "FAILED")
            .await
            .unwrap();
        assert!(server.await.unwrap().starts_with("PUT /api/alerts/a9/status"));
    }

    #[tokio::test]
    async fn test_unreadable_success_body_is_final() {
        let (base, server) = serve_once("200 OK", "<html>accepted</html>").await;
        let request = SensorEventRequest {
            device_id: "dev".to_string(),
            label: None,
            predicted_label: None,
            prediction_confidence: None,
            acceleration_magnitude: 1.0,
            gyroscope_magnitude: 0.1,
            accel_variance: None,
            gyro_variance: None,
            accel_jerk: None,
            timestamp: "2024-01-01T00:00:00.000Z".to_string(),
            raw_data: None,
        };
        let err = client(base).send_sensor_event(&request).await.unwrap_err();
        assert!(
            matches!(err, EngineError::InvalidResponse { status: 200, .. }),
            "{:?}",
            err
        );
        assert!(!err.is_retryable());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_host_is_retryable() {
        // bind then drop to get a port nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = client(format!("http://{}", addr)).health().await.unwrap_err();
        assert!(err.is_retryable(), "{:?}", err);
    }
}
