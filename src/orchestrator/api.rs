//! HTTP implementation of the orchestrator contract.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Method, RequestBuilder, Response, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde_json::json;

use crate::error::OrchestratorError;
use crate::orchestrator::{
    CommandLine, CommandSettings, Orchestrator, TimeWindow, ToolRecord, ToolUpdate,
};

/// REST client for the orchestrator API (`http://host:port/api/v1/`).
#[derive(Clone)]
pub struct ApiClient {
    base: Url,
    client: reqwest::Client,
    token: Option<Arc<SecretString>>,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base", &self.base.as_str())
            .field("authorized", &self.token.is_some())
            .finish()
    }
}

impl ApiClient {
    /// Create a client for the API rooted at `base_url`.
    pub fn new(base_url: &str) -> Result<Self, OrchestratorError> {
        let mut base = Url::parse(base_url).map_err(|e| OrchestratorError::InvalidUrl {
            url: base_url.to_string(),
            reason: e.to_string(),
        })?;
        if base.cannot_be_a_base() {
            return Err(OrchestratorError::InvalidUrl {
                url: base_url.to_string(),
                reason: "URL cannot be used as a base".to_string(),
            });
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            base,
            client: reqwest::Client::new(),
            token: None,
        })
    }

    pub fn base_url(&self) -> &str {
        self.base.as_str()
    }

    /// Build an endpoint URL. Segments are percent-encoded, so pentest and
    /// worker names may contain any character.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token.expose_secret()),
            None => builder,
        }
    }

    async fn send(
        &self,
        operation: &str,
        builder: RequestBuilder,
    ) -> Result<Response, OrchestratorError> {
        let response = builder
            .send()
            .await
            .map_err(|e| OrchestratorError::RequestFailed {
                operation: operation.to_string(),
                reason: e.to_string(),
            })?;

        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        tracing::debug!(operation, status, body = %body, "Orchestrator rejected request");
        Err(OrchestratorError::Rejected {
            operation: operation.to_string(),
            status,
            body,
        })
    }

    async fn decode<T: DeserializeOwned>(
        operation: &str,
        response: Response,
    ) -> Result<T, OrchestratorError> {
        response
            .json::<T>()
            .await
            .map_err(|e| OrchestratorError::InvalidResponse {
                operation: operation.to_string(),
                reason: e.to_string(),
            })
    }

    /// Query a collection of the pentest database.
    async fn find(
        &self,
        pentest: &str,
        collection: &str,
        pipeline: serde_json::Value,
        many: bool,
    ) -> Result<serde_json::Value, OrchestratorError> {
        let operation = format!("find {collection}");
        let url = self.endpoint(&["find", pentest, collection]);
        let response = self
            .send(
                &operation,
                self.request(Method::POST, url)
                    .json(&json!({"pipeline": pipeline, "many": many})),
            )
            .await?;
        Self::decode(&operation, response).await
    }
}

#[async_trait]
impl Orchestrator for ApiClient {
    fn authorized(&self, token: &str) -> Arc<dyn Orchestrator> {
        Arc::new(Self {
            token: Some(Arc::new(SecretString::from(token.to_string()))),
            ..self.clone()
        })
    }

    async fn try_connection(&self) -> bool {
        match self
            .request(Method::GET, self.base.clone())
            .send()
            .await
        {
            Ok(response) => response.status() == reqwest::StatusCode::OK,
            Err(e) => {
                tracing::debug!(error = %e, url = %self.base, "Orchestrator probe failed");
                false
            }
        }
    }

    async fn register_commands(
        &self,
        worker_name: &str,
        commands: &[String],
    ) -> Result<(), OrchestratorError> {
        let url = self.endpoint(&["workers", worker_name, "registerCommands"]);
        self.send(
            "registerCommands",
            self.request(Method::PUT, url).json(commands),
        )
        .await?;
        Ok(())
    }

    async fn unregister(&self, worker_name: &str) -> Result<(), OrchestratorError> {
        let url = self.endpoint(&["workers", worker_name, "unregister"]);
        self.send("unregister", self.request(Method::POST, url))
            .await?;
        Ok(())
    }

    async fn craft_command_line(
        &self,
        pentest: &str,
        tool_id: &str,
        parser: &str,
    ) -> Result<CommandLine, OrchestratorError> {
        let url = self.endpoint(&["tools", pentest, "craftCommandLine", tool_id]);
        let response = self
            .send(
                "craftCommandLine",
                self.request(Method::GET, url).query(&[("plugin", parser)]),
            )
            .await?;
        Self::decode("craftCommandLine", response).await
    }

    async fn import_result(
        &self,
        pentest: &str,
        tool_id: &str,
        parser: &str,
        path: &Path,
    ) -> Result<String, OrchestratorError> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Err(OrchestratorError::MissingFile {
                path: path.to_path_buf(),
            });
        }
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "result".to_string());

        let form = Form::new()
            .part("upfile", Part::bytes(bytes).file_name(file_name))
            .text("plugin", parser.to_string());

        let url = self.endpoint(&["tools", pentest, "importResult", tool_id]);
        let response = self
            .send("importResult", self.request(Method::POST, url).multipart(form))
            .await?;

        let message: serde_json::Value = Self::decode("importResult", response).await?;
        Ok(match message {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        })
    }

    async fn set_status(
        &self,
        pentest: &str,
        tool_id: &str,
        status: &[String],
        arg: &str,
    ) -> Result<(), OrchestratorError> {
        let url = self.endpoint(&["tools", pentest, tool_id, "changeStatus"]);
        self.send(
            "changeStatus",
            self.request(Method::POST, url)
                .json(&json!({"newStatus": status, "arg": arg})),
        )
        .await?;
        Ok(())
    }

    async fn fetch_tool(
        &self,
        pentest: &str,
        tool_id: &str,
    ) -> Result<ToolRecord, OrchestratorError> {
        let found = self
            .find(pentest, "tools", json!({"_id": {"$oid": tool_id}}), false)
            .await?;
        if found.is_null() {
            return Err(OrchestratorError::NotFound {
                entity: "Tool".to_string(),
                id: tool_id.to_string(),
            });
        }
        serde_json::from_value(found).map_err(|e| OrchestratorError::InvalidResponse {
            operation: "find tools".to_string(),
            reason: e.to_string(),
        })
    }

    async fn fetch_command(
        &self,
        pentest: &str,
        command_id: &str,
    ) -> Result<Option<CommandSettings>, OrchestratorError> {
        if command_id.is_empty() {
            return Ok(None);
        }
        let found = self
            .find(pentest, "commands", json!({"_id": {"$oid": command_id}}), false)
            .await?;
        if found.is_null() {
            return Ok(None);
        }
        serde_json::from_value(found)
            .map(Some)
            .map_err(|e| OrchestratorError::InvalidResponse {
                operation: "find commands".to_string(),
                reason: e.to_string(),
            })
    }

    async fn fetch_intervals(
        &self,
        pentest: &str,
        wave: &str,
    ) -> Result<Vec<TimeWindow>, OrchestratorError> {
        let found = self
            .find(pentest, "intervals", json!({"wave": wave}), true)
            .await?;
        if found.is_null() {
            return Ok(Vec::new());
        }
        serde_json::from_value(found).map_err(|e| OrchestratorError::InvalidResponse {
            operation: "find intervals".to_string(),
            reason: e.to_string(),
        })
    }

    async fn update_tool(
        &self,
        pentest: &str,
        tool_id: &str,
        update: &ToolUpdate,
    ) -> Result<(), OrchestratorError> {
        let url = self.endpoint(&["tools", "update", pentest, tool_id]);
        self.send("update tool", self.request(Method::PUT, url).json(update))
            .await?;
        Ok(())
    }
}
