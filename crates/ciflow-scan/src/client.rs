use std::time::Duration;

use async_trait::async_trait;
use ciflow_core::ReportId;
use reqwest::Client;
use tracing::debug;

use crate::types::{LicenseScanner, ScanError, ScanReport, SubmitResponse, Verdict, VerdictBody};

/// Scanning service over HTTP.
///
/// `POST {base}/api/v1/reports` submits, `GET {base}/api/v1/reports/{id}/verdict`
/// reads the verdict. The API key is sent as a bearer token.
pub struct HttpScanner {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpScanner {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self, ScanError> {
        if base_url.trim().is_empty() {
            return Err(ScanError::NotConfigured("empty base url".into()));
        }
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(k) => req.bearer_auth(k),
            None => req,
        }
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, ScanError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ScanError::Status { status: status.as_u16(), body })
}

#[async_trait]
impl LicenseScanner for HttpScanner {
    async fn submit(&self, report: &ScanReport) -> Result<ReportId, ScanError> {
        let url = format!("{}/api/v1/reports", self.base_url);
        debug!(url = %url, variant = report.variant.as_str(), deps = report.dependencies.len(), "submitting report");
        let resp = self.authed(self.client.post(&url)).json(report).send().await?;
        let body: SubmitResponse = check_status(resp).await?.json().await?;
        Ok(ReportId::from_str(body.report_id))
    }

    async fn verdict(&self, report_id: &ReportId) -> Result<Verdict, ScanError> {
        let url = format!("{}/api/v1/reports/{}/verdict", self.base_url, report_id.as_str());
        let resp = self.authed(self.client.get(&url)).send().await?;
        let body: VerdictBody = check_status(resp).await?.json().await?;
        Verdict::try_from(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Violation;
    use axum::extract::{Path, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use ciflow_core::{Dependency, DependencyVariant};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Fake {
        submitted: Arc<Mutex<Vec<(Option<String>, ScanReport)>>>,
    }

    async fn submit(State(f): State<Fake>, headers: HeaderMap, Json(r): Json<ScanReport>) -> Json<SubmitResponse> {
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        f.submitted.lock().unwrap().push((auth, r));
        Json(SubmitResponse { report_id: "rep-1".into() })
    }

    async fn verdict(Path(id): Path<String>) -> Result<Json<VerdictBody>, StatusCode> {
        match id.as_str() {
            "rep-1" => Ok(Json(VerdictBody {
                status: "failed".into(),
                violations: vec![Violation {
                    dependency: "gplthing".into(),
                    license: "GPL-3.0".into(),
                    reason: None,
                }],
            })),
            _ => Err(StatusCode::NOT_FOUND),
        }
    }

    async fn serve(fake: Fake) -> String {
        let app = Router::new()
            .route("/api/v1/reports", post(submit))
            .route("/api/v1/reports/{id}/verdict", get(verdict))
            .with_state(fake);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/")
    }

    #[tokio::test]
    async fn submits_with_bearer_and_reads_verdict() {
        let fake = Fake::default();
        let base = serve(fake.clone()).await;
        let scanner = HttpScanner::new(&base, Some("k3y".into()), Duration::from_secs(5)).unwrap();

        let report = ScanReport {
            project: "acme/widgets".into(),
            revision: "abc".into(),
            variant: DependencyVariant::Gpu,
            dependencies: vec![Dependency { name: "torch".into(), version: "2.1.0".into() }],
        };
        let id = scanner.submit(&report).await.unwrap();
        assert_eq!(id.as_str(), "rep-1");

        let seen = fake.submitted.lock().unwrap().clone();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0.as_deref(), Some("Bearer k3y"));
        assert_eq!(seen[0].1, report);

        match scanner.verdict(&id).await.unwrap() {
            Verdict::Failed { violations } => assert_eq!(violations[0].license, "GPL-3.0"),
            other => panic!("unexpected verdict {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let base = serve(Fake::default()).await;
        let scanner = HttpScanner::new(&base, None, Duration::from_secs(5)).unwrap();
        let err = scanner.verdict(&ReportId::from_str("missing")).await.unwrap_err();
        assert!(matches!(err, ScanError::Status { status: 404, .. }));
    }

    #[test]
    fn empty_base_url_is_not_configured() {
        assert!(matches!(
            HttpScanner::new("  ", None, Duration::from_secs(1)),
            Err(ScanError::NotConfigured(_))
        ));
    }
}
