use std::time::Duration;

use async_trait::async_trait;
use cronkeeper_terminal::truncate::truncate_head;
use reqwest::Method;
use tracing::debug;

use super::Executor;
use crate::types::{ApiParams, RunResult, Task, TaskParams, TaskType};

/// Issues the HTTP request configured on `api` tasks.
pub struct ApiExecutor {
    client: reqwest::Client,
    max_output_chars: usize,
}

impl ApiExecutor {
    pub fn new(max_output_chars: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            max_output_chars,
        }
    }

    fn is_accepted(params: &ApiParams, status: reqwest::StatusCode) -> bool {
        match &params.accepted_statuses {
            Some(accepted) => accepted.contains(&status.as_u16()),
            None => status.is_success(),
        }
    }
}

#[async_trait]
impl Executor for ApiExecutor {
    fn kind(&self) -> TaskType {
        TaskType::Api
    }

    async fn run(&self, task: &Task, timeout: Duration) -> RunResult {
        let TaskParams::Api(params) = &task.params else {
            return RunResult::failure("not an api task");
        };
        let method = match Method::from_bytes(params.method.to_ascii_uppercase().as_bytes()) {
            Ok(m) => m,
            Err(_) => return RunResult::failure(format!("invalid http method: {}", params.method)),
        };

        let mut req = self
            .client
            .request(method.clone(), &params.url)
            .timeout(timeout);
        for (name, value) in &params.headers {
            req = req.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &params.body {
            if matches!(method, Method::POST | Method::PUT | Method::PATCH) {
                req = req.json(body);
            }
        }

        debug!(task_id = %task.id, %method, url = %params.url, "api request");
        let resp = match req.send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => return RunResult::timeout(timeout),
            Err(e) => return RunResult::failure(format!("request failed: {e}")),
        };

        let status = resp.status();
        let body = match resp.text().await {
            Ok(b) => b,
            Err(e) if e.is_timeout() => return RunResult::timeout(timeout),
            Err(e) => return RunResult::failure(format!("reading response body failed: {e}")),
        };
        let output = format!(
            "HTTP {}\n{}",
            status.as_u16(),
            truncate_head(&body, self.max_output_chars)
        );

        if Self::is_accepted(params, status) {
            RunResult::success(output)
        } else {
            RunResult::failure(format!("unexpected status {}", status.as_u16())).with_output(output)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::tests::task_with;
    use crate::types::Outcome;
    use std::collections::BTreeMap;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn api(url: String, method: &str) -> ApiParams {
        ApiParams {
            url,
            method: method.into(),
            headers: BTreeMap::new(),
            body: None,
            accepted_statuses: None,
        }
    }

    async fn run(params: ApiParams, timeout: Duration) -> RunResult {
        ApiExecutor::new(1000)
            .run(&task_with(TaskParams::Api(params)), timeout)
            .await
    }

    #[tokio::test]
    async fn success_reports_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .and(header("x-token", "abc"))
            .respond_with(ResponseTemplate::new(200).set_body_string("fine"))
            .expect(1)
            .mount(&server)
            .await;

        let mut p = api(format!("{}/health", server.uri()), "get");
        p.headers.insert("x-token".into(), "abc".into());
        let res = run(p, Duration::from_secs(5)).await;
        assert_eq!(res, RunResult::success("HTTP 200\nfine"));
    }

    #[tokio::test]
    async fn json_body_sent_for_post() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(body_json(serde_json::json!({"k": 1})))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let mut p = api(format!("{}/hook", server.uri()), "POST");
        p.body = Some(serde_json::json!({"k": 1}));
        assert_eq!(run(p, Duration::from_secs(5)).await.outcome, Outcome::Success);
    }

    #[tokio::test]
    async fn non_2xx_is_failure_unless_accepted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string("gone"))
            .mount(&server)
            .await;

        let p = api(server.uri(), "GET");
        let res = run(p.clone(), Duration::from_secs(5)).await;
        assert_eq!(res.outcome, Outcome::Failure);
        assert_eq!(res.error.as_deref(), Some("unexpected status 404"));
        assert_eq!(res.output, "HTTP 404\ngone");

        let mut accepting = p;
        accepting.accepted_statuses = Some(vec![404]);
        assert_eq!(run(accepting, Duration::from_secs(5)).await.outcome, Outcome::Success);
    }

    #[tokio::test]
    async fn slow_server_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let res = run(api(server.uri(), "GET"), Duration::from_millis(200)).await;
        assert_eq!(res.outcome, Outcome::Timeout);
    }

    #[tokio::test]
    async fn unreachable_host_is_failure() {
        // port 9 (discard) on localhost is closed in test environments
        let res = run(api("http://127.0.0.1:9/".into(), "GET"), Duration::from_secs(5)).await;
        assert_eq!(res.outcome, Outcome::Failure);
        assert!(res.error.unwrap().starts_with("request failed"));
    }

    #[tokio::test]
    async fn long_bodies_are_truncated() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(5000)))
            .mount(&server)
            .await;

        let res = ApiExecutor::new(100)
            .run(
                &task_with(TaskParams::Api(api(server.uri(), "GET"))),
                Duration::from_secs(5),
            )
            .await;
        assert!(res.output.ends_with("... [truncated 4900 chars]"));
    }
}
