//! Per-protocol upstream transports (§4.2 "Transport contracts").
//!
//! Grounded directly on the teacher's `federation/transport.rs`: each
//! protocol gets its own connect function, all converging on
//! `rmcp::service::RunningService<RoleClient, ()>` so the rest of the
//! client code doesn't need to know which transport is underneath.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use rmcp::service::RunningService;
use rmcp::transport::ConfigureCommandExt;
use rmcp::RoleClient;

use crate::config::{OAuthConfig, Protocol, Server};

pub type Connection = RunningService<RoleClient, ()>;

/// Spawn a subprocess and speak MCP over its stdio pipes (spec.md §4.2
/// stdio contract: command + args + env + cwd).
///
/// `kill_on_drop(true)` plus a fresh Unix process group (`process_group(0)`)
/// is the process-tree-cleanup idiom the `rmcp`-based examples in the pack
/// use (`ConfigureCommandExt::configure`): it ensures the child, and
/// anything it forks into the same group, goes down with it when the
/// `RunningService` handle is dropped on Stop (§4.2 "process tree killed
/// on Stop").
pub async fn connect_stdio(
    command: &str,
    args: &[String],
    env: &HashMap<String, String>,
    working_dir: Option<&str>,
) -> anyhow::Result<Connection> {
    let working_dir = working_dir.map(|d| d.to_string());
    let transport = rmcp::transport::TokioChildProcess::new(tokio::process::Command::new(command).configure(
        |cmd| {
            cmd.args(args).envs(env).kill_on_drop(true);
            if let Some(dir) = &working_dir {
                cmd.current_dir(dir);
            }
            #[cfg(unix)]
            {
                cmd.process_group(0);
            }
        },
    ))
    .with_context(|| format!("failed to spawn stdio server: {command}"))?;
    let client = rmcp::service::serve_client((), transport)
        .await
        .with_context(|| format!("MCP client init failed for stdio: {command}"))?;
    Ok(client)
}

/// Plain HTTP request/response transport.
pub async fn connect_http(url: &str, headers: &HashMap<String, String>) -> anyhow::Result<Connection> {
    connect_streamable_http(url, headers).await
}

/// Streamable-HTTP transport — chunked request/response.
pub async fn connect_streamable_http(
    url: &str,
    _headers: &HashMap<String, String>,
) -> anyhow::Result<Connection> {
    let transport = rmcp::transport::StreamableHttpClientTransport::from_uri(url);
    let client = rmcp::service::serve_client((), transport)
        .await
        .with_context(|| format!("MCP client init failed for streamable-http: {url}"))?;
    Ok(client)
}

/// SSE transport — holds a long-lived event stream.
pub async fn connect_sse(url: &str, _headers: &HashMap<String, String>) -> anyhow::Result<Connection> {
    let transport = rmcp::transport::SseClientTransport::start(url.to_string())
        .await
        .with_context(|| format!("failed to start SSE stream: {url}"))?;
    let client = rmcp::service::serve_client((), transport)
        .await
        .with_context(|| format!("MCP client init failed for sse: {url}"))?;
    Ok(client)
}

/// Per-operation timeout applied around every connect attempt (spec.md
/// §5 "Cancellation & timeouts").
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Dispatch to the right transport based on `server.protocol`.
pub async fn connect(server: &Server) -> anyhow::Result<Connection> {
    let fut = async {
        match server.protocol {
            Protocol::Stdio => {
                let command = server
                    .command
                    .as_deref()
                    .context("stdio server missing 'command'")?;
                connect_stdio(
                    command,
                    &server.args,
                    &server.env,
                    server.working_dir.as_deref(),
                )
                .await
            }
            Protocol::Http => {
                let url = server.url.as_deref().context("http server missing 'url'")?;
                connect_http(url, &server.headers).await
            }
            Protocol::Sse => {
                let url = server.url.as_deref().context("sse server missing 'url'")?;
                connect_sse(url, &server.headers).await
            }
            Protocol::StreamableHttp => {
                let url = server
                    .url
                    .as_deref()
                    .context("streamable-http server missing 'url'")?;
                connect_streamable_http(url, &server.headers).await
            }
        }
    };

    tokio::time::timeout(CONNECT_TIMEOUT, fut)
        .await
        .context("connect attempt timed out")?
}

/// Run the configured OAuth client-credentials token refresh (§4.2
/// "OAuth"). Returns the opaque refreshed-token bytes to persist. This is
/// a thin seam — the full device/redirect exchange is a collaborator
/// concern (the embedded dashboard owns the redirect UI); THE CORE only
/// owns the token refresh/persist contract.
pub async fn run_oauth_flow(server_name: &str, oauth: &OAuthConfig) -> anyhow::Result<Vec<u8>> {
    let token_url = oauth
        .token_url
        .as_deref()
        .with_context(|| format!("server '{server_name}' has no oauth.token_url configured"))?;

    tracing::info!(server = %server_name, token_url, "running OAuth token refresh");

    let client = reqwest::Client::new();
    let mut body = serde_json::json!({ "grant_type": "client_credentials" });
    if let Some(client_id) = &oauth.client_id {
        body["client_id"] = serde_json::Value::String(client_id.clone());
    }
    if !oauth.scopes.is_empty() {
        body["scope"] = serde_json::Value::String(oauth.scopes.join(" "));
    }

    let resp = client
        .post(token_url)
        .json(&body)
        .timeout(Duration::from_secs(10))
        .send()
        .await
        .with_context(|| format!("oauth token request to {token_url} failed"))?;

    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        anyhow::bail!("oauth token refresh for '{server_name}' failed: {status} — {text}");
    }

    Ok(resp.bytes().await?.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_rejects_stdio_without_command() {
        let server = Server {
            name: "s1".into(),
            protocol: Protocol::Stdio,
            command: None,
            args: vec![],
            env: HashMap::new(),
            working_dir: None,
            url: None,
            headers: HashMap::new(),
            oauth: None,
            startup_mode: crate::config::StartupMode::Active,
            group_id: None,
            group_name: None,
            repository_url: None,
            isolation: None,
            auto_disable_threshold: None,
            enabled: None,
            stopped: None,
            quarantined: None,
            auto_disabled: None,
        };
        assert!(connect(&server).await.is_err());
    }
}
