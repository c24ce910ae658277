use log::{error, info};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

use crate::provisioning::ProvisioningError;

const PROVISION_PATH: &str = "/devices/provision";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionRequest {
    pub serial_number: String,
    pub csr: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IssuedCertificates {
    pub certificate: String,
    pub ca_certificate: String,
}

/// Service that turns a signing request into a device certificate
pub trait CertificateIssuer: Send + Sync {
    fn submit(&self, issuer_url: &str, request: &ProvisionRequest)
        -> impl Future<Output = Result<IssuedCertificates, ProvisioningError>> + Send;
}

pub struct HttpIssuer {
    client: reqwest::Client,
}

impl HttpIssuer {
    pub fn new() -> Result<Self, ProvisioningError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        return Ok(HttpIssuer { client });
    }
}

impl CertificateIssuer for HttpIssuer {
    async fn submit(&self, issuer_url: &str, request: &ProvisionRequest) -> Result<IssuedCertificates, ProvisioningError> {
        let url = format!("{}{}", issuer_url.trim_end_matches('/'), PROVISION_PATH);
        info!("Connecting to {url}");

        let response = self.client.post(&url).json(request).send().await?;
        let status = response.status();

        if status != StatusCode::OK && status != StatusCode::CREATED {
            let body = response.text().await.unwrap_or_default();
            error!("Issuer answered {status}: {body}");
            return Err(ProvisioningError::IssuerStatus(status.as_u16(), body));
        }

        let body = response.text().await?;
        let issued: IssuedCertificates = serde_json::from_str(&body)
            .map_err(|e| ProvisioningError::InvalidResponse(e.to_string()))?;
        if issued.certificate.trim().is_empty() || issued.ca_certificate.trim().is_empty() {
            return Err(ProvisioningError::InvalidResponse("empty certificate".to_string()));
        }
        return Ok(issued);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// Answers exactly one HTTP request and hands back what was received
    async fn serve_once(status: &'static str, body: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                received.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&received).to_string();
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let length = text[..head_end].lines()
                        .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:").map(|v| v.trim().parse::<usize>().unwrap()))
                        .unwrap_or(0);
                    if received.len() >= head_end + 4 + length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }

            let response = format!(
                "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&received).to_string()
        });

        (url, handle)
    }

    fn request() -> ProvisionRequest {
        ProvisionRequest { serial_number: "dev01".to_string(), csr: "-----BEGIN CERTIFICATE REQUEST-----".to_string() }
    }

    #[tokio::test]
    async fn test_submit_success() {
        let (url, server) = serve_once("201 Created", r#"{"certificate":"CERT","caCertificate":"CA"}"#).await;

        let issued = HttpIssuer::new().unwrap().submit(&url, &request()).await.unwrap();
        assert_eq!(issued, IssuedCertificates { certificate: "CERT".to_string(), ca_certificate: "CA".to_string() });

        let received = server.await.unwrap();
        assert!(received.starts_with("POST /devices/provision HTTP/1.1"));
        let body = &received[received.find("\r\n\r\n").unwrap() + 4..];
        let json: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(json["serialNumber"], "dev01");
        assert_eq!(json["csr"], "-----BEGIN CERTIFICATE REQUEST-----");
    }

    #[tokio::test]
    async fn test_submit_rejected() {
        let (url, _server) = serve_once("404 Not Found", r#"{"message":"not registered"}"#).await;

        match HttpIssuer::new().unwrap().submit(&url, &request()).await {
            Err(ProvisioningError::IssuerStatus(404, body)) => assert!(body.contains("not registered")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_submit_missing_fields() {
        let (url, _server) = serve_once("200 OK", r#"{"certificate":"CERT"}"#).await;

        let result = HttpIssuer::new().unwrap().submit(&url, &request()).await;
        assert!(matches!(result, Err(ProvisioningError::InvalidResponse(_))));
    }
}
