//! HTTP sheet writer

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use super::{BatchWriteReport, CellUpdate, SheetError, SheetWriter};
use crate::util::{is_http_url, normalize_text_option};

/// Writes batches to `{base}/documents/{id}/values:batchWrite`
#[derive(Clone)]
pub struct HttpSheetWriter {
    base_url: String,
    token: Option<String>,
    client: Client,
}

impl std::fmt::Debug for HttpSheetWriter {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpSheetWriter")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish_non_exhaustive()
    }
}

#[derive(Serialize)]
struct BatchWriteBody<'a> {
    updates: &'a [CellUpdate],
}

#[derive(Debug, Deserialize)]
struct BatchWriteResponse {
    confirmed: Option<Vec<usize>>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

impl HttpSheetWriter {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self, SheetError> {
        let base_url = normalize_base_url(base_url.into())?;
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|error| SheetError::InvalidConfiguration(error.to_string()))?;
        Ok(Self {
            base_url,
            token: normalize_text_option(token),
            client,
        })
    }

    fn endpoint(&self, document_id: &str) -> String {
        format!(
            "{}/documents/{}/values:batchWrite",
            self.base_url,
            urlencoding::encode(document_id)
        )
    }

    fn build_request(
        &self,
        document_id: &str,
        updates: &[CellUpdate],
    ) -> Result<reqwest::Request, SheetError> {
        let mut builder = self
            .client
            .post(self.endpoint(document_id))
            .header(reqwest::header::ACCEPT, "application/json")
            .json(&BatchWriteBody { updates });
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        builder
            .build()
            .map_err(|error| SheetError::InvalidConfiguration(error.to_string()))
    }
}

#[async_trait::async_trait]
impl SheetWriter for HttpSheetWriter {
    async fn batch_write(
        &self,
        document_id: &str,
        updates: &[CellUpdate],
    ) -> Result<BatchWriteReport, SheetError> {
        let request = self.build_request(document_id, updates)?;
        let response = self
            .client
            .execute(request)
            .await
            .map_err(|error| SheetError::Transient(error.to_string()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(parse_retry_after);
            return Err(SheetError::RateLimited { retry_after });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = parse_api_error(status, &body);
            return Err(if status.is_client_error() {
                SheetError::Rejected(message)
            } else {
                SheetError::Transient(message)
            });
        }

        let body = response
            .text()
            .await
            .map_err(|error| SheetError::Transient(error.to_string()))?;
        Ok(parse_report(&body, updates.len()))
    }
}

/// Confirmed indices from a success body; an empty or index-less body
/// confirms the whole batch.
fn parse_report(body: &str, len: usize) -> BatchWriteReport {
    match serde_json::from_str::<BatchWriteResponse>(body) {
        Ok(BatchWriteResponse {
            confirmed: Some(confirmed),
        }) => BatchWriteReport {
            confirmed: confirmed.into_iter().filter(|index| *index < len).collect(),
        },
        _ => BatchWriteReport::all(len),
    }
}

fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return format!("{} ({})", message.trim(), status.as_u16());
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", crate::util::compact_text(trimmed), status.as_u16())
    }
}

fn normalize_base_url(raw: String) -> Result<String, SheetError> {
    let base_url = normalize_text_option(Some(raw)).ok_or_else(|| {
        SheetError::InvalidConfiguration("sheet API URL must not be empty".to_string())
    })?;
    if is_http_url(&base_url) {
        Ok(base_url.trim_end_matches('/').to_string())
    } else {
        Err(SheetError::InvalidConfiguration(
            "sheet API URL must include http:// or https://".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn writer() -> HttpSheetWriter {
        HttpSheetWriter::new("https://sheets.example.com/v1/", Some("secret".to_string())).unwrap()
    }

    fn update() -> CellUpdate {
        CellUpdate {
            sheet_name: "Orders".to_string(),
            row: 2,
            col: 3,
            value: "4.5".to_string(),
        }
    }

    #[test]
    fn new_rejects_invalid_urls() {
        assert!(HttpSheetWriter::new("", None).is_err());
        assert!(HttpSheetWriter::new("sheets.example.com", None).is_err());
    }

    #[test]
    fn request_shape_is_correct() {
        let request = writer().build_request("doc/1 a", &[update()]).unwrap();

        assert_eq!(request.method(), reqwest::Method::POST);
        assert_eq!(
            request.url().as_str(),
            "https://sheets.example.com/v1/documents/doc%2F1%20a/values:batchWrite"
        );
        let auth = request
            .headers()
            .get(reqwest::header::AUTHORIZATION)
            .unwrap()
            .to_str()
            .unwrap();
        assert_eq!(auth, "Bearer secret");

        let body = request.body().and_then(reqwest::Body::as_bytes).unwrap();
        let json: serde_json::Value = serde_json::from_slice(body).unwrap();
        assert_eq!(json["updates"][0]["sheetName"], "Orders");
        assert_eq!(json["updates"][0]["value"], "4.5");
    }

    #[test]
    fn debug_redacts_token() {
        let debug = format!("{:?}", writer());
        assert!(!debug.contains("secret"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn parse_report_handles_partial_and_empty_bodies() {
        assert_eq!(parse_report("", 3), BatchWriteReport::all(3));
        assert_eq!(parse_report("{}", 2), BatchWriteReport::all(2));
        assert_eq!(
            parse_report(r#"{"confirmed":[0,2,7]}"#, 3).confirmed,
            vec![0, 2]
        );
    }

    #[test]
    fn parse_api_error_prefers_message() {
        assert_eq!(
            parse_api_error(StatusCode::BAD_REQUEST, r#"{"message":" bad range "}"#),
            "bad range (400)"
        );
        assert_eq!(parse_api_error(StatusCode::BAD_GATEWAY, ""), "HTTP 502");
        assert_eq!(parse_retry_after("12"), Some(Duration::from_secs(12)));
        assert_eq!(parse_retry_after("soon"), None);
    }
}
