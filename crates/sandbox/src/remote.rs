//! Hosted cloud sandbox provider over its REST API.

use std::time::Duration;

use {
    async_trait::async_trait,
    crucible_config::SandboxConfig,
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize, de::DeserializeOwned},
    tracing::{debug, info},
};

use crate::{
    error::{Error, Result},
    provider::{
        CodeResult, CommandOutput, FileEntry, ProviderKind, SandboxCreateInput, SandboxRuntime,
        parse_file_listing,
    },
};

const PROVIDER: &str = "remote_e2b";
/// Extra time over an execution timeout for the HTTP round trip.
const REQUEST_GRACE: Duration = Duration::from_secs(10);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Connection settings shared by every remote sandbox.
#[derive(Clone)]
pub struct RemoteSandboxApi {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<Secret<String>>,
}

impl std::fmt::Debug for RemoteSandboxApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSandboxApi")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateRequest {
    timeout_ms: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateResponse {
    sandbox_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CodeRequest<'a> {
    code: &'a str,
    timeout_ms: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CommandRequest<'a> {
    cmd: &'a str,
    timeout_ms: u64,
}

impl RemoteSandboxApi {
    #[must_use]
    pub fn new(base_url: impl Into<String>, api_key: Option<Secret<String>>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }

    /// `None` when no API URL is configured.
    #[must_use]
    pub fn from_config(config: &SandboxConfig) -> Option<Self> {
        let url = config
            .remote_api_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())?;
        Some(Self::new(url, config.remote_api_key.clone()))
    }

    fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        timeout: Duration,
    ) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{path}", self.base_url))
            .timeout(timeout);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key.expose_secret());
        }
        builder
    }

    async fn send(
        op: &'static str,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response> {
        let resp = builder.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(Error::Provider {
                provider: PROVIDER,
                op,
                code: i32::from(status.as_u16()),
                detail,
            });
        }
        Ok(resp)
    }

    async fn send_json<T: DeserializeOwned>(
        op: &'static str,
        builder: reqwest::RequestBuilder,
    ) -> Result<T> {
        Ok(Self::send(op, builder).await?.json().await?)
    }

    /// Create a sandbox that expires after `input.timeout_ms`.
    pub async fn create(&self, input: &SandboxCreateInput) -> Result<RemoteSandbox> {
        let builder = self
            .request(reqwest::Method::POST, "/sandboxes", DEFAULT_REQUEST_TIMEOUT)
            .json(&CreateRequest {
                timeout_ms: input.timeout_ms,
            });
        let created: CreateResponse = Self::send_json("create", builder).await?;
        info!(sandbox_id = %created.sandbox_id, user_id = %input.user_id, "remote sandbox created");
        Ok(RemoteSandbox {
            api: self.clone(),
            sandbox_id: created.sandbox_id,
        })
    }
}

/// A sandbox in the hosted service.
#[derive(Debug)]
pub struct RemoteSandbox {
    api: RemoteSandboxApi,
    sandbox_id: String,
}

impl RemoteSandbox {
    #[must_use]
    pub fn sandbox_id(&self) -> &str {
        &self.sandbox_id
    }

    fn path(&self, suffix: &str) -> String {
        format!("/sandboxes/{}{suffix}", self.sandbox_id)
    }
}

fn exec_timeout(timeout_ms: u64) -> Duration {
    Duration::from_millis(timeout_ms) + REQUEST_GRACE
}

#[async_trait]
impl SandboxRuntime for RemoteSandbox {
    fn provider(&self) -> ProviderKind {
        ProviderKind::RemoteE2b
    }

    fn supports_code(&self) -> bool {
        true
    }

    async fn run_code(&self, code: &str, timeout_ms: u64) -> Result<CodeResult> {
        let builder = self
            .api
            .request(reqwest::Method::POST, &self.path("/code"), exec_timeout(timeout_ms))
            .json(&CodeRequest { code, timeout_ms });
        RemoteSandboxApi::send_json("runCode", builder).await
    }

    async fn run_command(&self, command: &str, timeout_ms: u64) -> Result<CommandOutput> {
        let builder = self
            .api
            .request(
                reqwest::Method::POST,
                &self.path("/commands"),
                exec_timeout(timeout_ms),
            )
            .json(&CommandRequest {
                cmd: command,
                timeout_ms,
            });
        RemoteSandboxApi::send_json("runCommand", builder).await
    }

    async fn write_file(&self, path: &str, content: &[u8]) -> Result<()> {
        let builder = self
            .api
            .request(reqwest::Method::PUT, &self.path("/files"), DEFAULT_REQUEST_TIMEOUT)
            .query(&[("path", path)])
            .body(content.to_vec());
        RemoteSandboxApi::send("write", builder).await?;
        debug!(sandbox_id = %self.sandbox_id, path, bytes = content.len(), "wrote file");
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let builder = self
            .api
            .request(reqwest::Method::GET, &self.path("/files"), DEFAULT_REQUEST_TIMEOUT)
            .query(&[("path", path)]);
        let resp = RemoteSandboxApi::send("read", builder).await?;
        Ok(resp.bytes().await?.to_vec())
    }

    async fn list_files(&self, path: &str) -> Result<Vec<FileEntry>> {
        let builder = self
            .api
            .request(
                reqwest::Method::GET,
                &self.path("/files/list"),
                DEFAULT_REQUEST_TIMEOUT,
            )
            .query(&[("path", path)]);
        let body = RemoteSandboxApi::send("list", builder).await?.text().await?;
        parse_file_listing(&body, path)
    }

    async fn kill(&self) -> Result<()> {
        let builder = self.api.request(
            reqwest::Method::DELETE,
            &self.path(""),
            DEFAULT_REQUEST_TIMEOUT,
        );
        RemoteSandboxApi::send("kill", builder).await?;
        info!(sandbox_id = %self.sandbox_id, "remote sandbox killed");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {super::*, mockito::Matcher};

    fn input() -> SandboxCreateInput {
        SandboxCreateInput {
            user_id: "user-1".into(),
            timeout_ms: 600_000,
        }
    }

    async fn created(server: &mut mockito::Server) -> (RemoteSandbox, mockito::Mock) {
        let mock = server
            .mock("POST", "/sandboxes")
            .match_header("authorization", "Bearer test-key")
            .match_body(Matcher::Json(serde_json::json!({ "timeoutMs": 600000 })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"sandboxId":"sbx-42"}"#)
            .create_async()
            .await;
        let api = RemoteSandboxApi::new(server.url(), Some(Secret::new("test-key".into())));
        let sandbox = api.create(&input()).await.unwrap();
        (sandbox, mock)
    }

    #[test]
    fn from_config_requires_url() {
        assert!(RemoteSandboxApi::from_config(&SandboxConfig::default()).is_none());
        let cfg = SandboxConfig {
            remote_api_url: Some("https://sandbox.example.com/".into()),
            remote_api_key: Some(Secret::new("s3cret".into())),
            ..Default::default()
        };
        let api = RemoteSandboxApi::from_config(&cfg).unwrap();
        assert_eq!(api.base_url, "https://sandbox.example.com");
        assert!(!format!("{api:?}").contains("s3cret"));
    }

    #[tokio::test]
    async fn create_and_run_command() {
        let mut server = mockito::Server::new_async().await;
        let (sandbox, create) = created(&mut server).await;
        assert_eq!(sandbox.sandbox_id(), "sbx-42");
        create.assert_async().await;

        let mock = server
            .mock("POST", "/sandboxes/sbx-42/commands")
            .match_body(Matcher::Json(
                serde_json::json!({ "cmd": "pip install pandas -q", "timeoutMs": 60000 }),
            ))
            .with_status(200)
            .with_body(r#"{"exitCode":0,"stdout":"ok","stderr":""}"#)
            .create_async()
            .await;
        let out = sandbox
            .run_command("pip install pandas -q", 60_000)
            .await
            .unwrap();
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout, "ok");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn run_code_decodes_rich_result() {
        let mut server = mockito::Server::new_async().await;
        let (sandbox, _) = created(&mut server).await;
        server
            .mock("POST", "/sandboxes/sbx-42/code")
            .with_status(200)
            .with_body(
                r#"{"logs":{"stdout":["a\n"],"stderr":[]},"text":"","error":{"traceback":"Traceback..."},"results":[{"png":"iVBOR"}]}"#,
            )
            .create_async()
            .await;
        assert!(sandbox.supports_code());
        let result = sandbox.run_code("print(1)", 1_000).await.unwrap();
        assert_eq!(result.logs.stdout, vec!["a\n"]);
        assert_eq!(
            result.error.unwrap().traceback.as_deref(),
            Some("Traceback...")
        );
        assert_eq!(result.results[0].png.as_deref(), Some("iVBOR"));
    }

    #[tokio::test]
    async fn files_round_trip_through_api() {
        let mut server = mockito::Server::new_async().await;
        let (sandbox, _) = created(&mut server).await;

        let put = server
            .mock("PUT", "/sandboxes/sbx-42/files")
            .match_query(Matcher::UrlEncoded("path".into(), "/home/user/a.txt".into()))
            .match_body("hello")
            .with_status(204)
            .create_async()
            .await;
        sandbox.write_file("/home/user/a.txt", b"hello").await.unwrap();
        put.assert_async().await;

        server
            .mock("GET", "/sandboxes/sbx-42/files")
            .match_query(Matcher::UrlEncoded("path".into(), "/home/user/a.txt".into()))
            .with_status(200)
            .with_body("hello")
            .create_async()
            .await;
        assert_eq!(sandbox.read_text("/home/user/a.txt").await.unwrap(), "hello");

        server
            .mock("GET", "/sandboxes/sbx-42/files/list")
            .match_query(Matcher::UrlEncoded("path".into(), "/home/user/".into()))
            .with_status(200)
            .with_body(r#"[{"name":"a.txt","type":"file","size":5}]"#)
            .create_async()
            .await;
        let entries = sandbox.list_files("/home/user/").await.unwrap();
        assert_eq!(entries[0].path, "/home/user/a.txt");
    }

    #[tokio::test]
    async fn http_errors_map_to_provider_error() {
        let mut server = mockito::Server::new_async().await;
        let (sandbox, _) = created(&mut server).await;
        server
            .mock("DELETE", "/sandboxes/sbx-42")
            .with_status(404)
            .with_body("gone")
            .create_async()
            .await;
        let err = sandbox.kill().await.unwrap_err();
        assert_eq!(err.to_string(), "remote_e2b kill failed (404): gone");
    }
}
