use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::URL_SAFE, Engine};
use clap::Args;
use reqwest::{multipart, StatusCode};
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::config::DEFAULT_PORT;

#[derive(Args, Debug, Clone)]
pub(crate) struct ClientArgs {
    #[arg(long, env = "LEMONADE_CLIENT_HOST", default_value = "127.0.0.1")]
    pub(crate) host: String,

    #[arg(long, env = "LEMONADE_PORT", default_value_t = DEFAULT_PORT)]
    pub(crate) port: u16,
}

#[derive(Debug, Error)]
pub(crate) enum ClientError {
    #[error("invalid agent address {0:?}")]
    Endpoint(String),
    #[error("request to agent failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("agent answered {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// HTTP client for a running agent.
pub(crate) struct BridgeClient {
    base: Url,
    http: reqwest::Client,
}

impl BridgeClient {
    pub(crate) fn new(args: &ClientArgs) -> Result<Self, ClientError> {
        let host = if args.host.contains(':') && !args.host.starts_with('[') {
            format!("[{}]", args.host)
        } else {
            args.host.clone()
        };
        let raw = format!("http://{host}:{}/", args.port);
        let base = Url::parse(&raw).map_err(|_| ClientError::Endpoint(raw))?;

        // The agent is reached directly or through an ssh forward, never a proxy.
        let http = reqwest::Client::builder().no_proxy().build()?;

        Ok(Self { base, http })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ClientError> {
        self.base
            .join(path)
            .map_err(|_| ClientError::Endpoint(format!("{}{path}", self.base)))
    }

    pub(crate) async fn copy(&self, text: String) -> Result<(), ClientError> {
        let response = self
            .http
            .post(self.endpoint("copy")?)
            .body(text)
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    pub(crate) async fn paste(&self) -> Result<String, ClientError> {
        let response = self.http.get(self.endpoint("paste")?).send().await?;
        let response = check_status(response).await?;
        Ok(response.text().await?)
    }

    /// Opens `target` on the agent host. With `trans_localfile`, an existing
    /// local file is uploaded and opened from the agent's file store instead.
    pub(crate) async fn open(
        &self,
        target: &str,
        trans_loopback: bool,
        trans_localfile: bool,
    ) -> Result<(), ClientError> {
        if trans_localfile && Path::new(target).is_file() {
            return self.upload(Path::new(target), true).await;
        }

        let encoded = URL_SAFE.encode(target);
        let mut query = vec![("uri", encoded.as_str()), ("base64", "true")];
        if trans_loopback {
            query.push(("transLoopback", "true"));
        }

        debug!(%target, trans_loopback, "requesting open");
        let response = self
            .http
            .get(self.endpoint("open")?)
            .query(&query)
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    pub(crate) async fn upload(&self, path: &Path, open: bool) -> Result<(), ClientError> {
        let bytes = tokio::fs::read(path).await.map_err(|source| ClientError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "upload".to_string());

        debug!(%file_name, bytes = bytes.len(), open, "uploading file");
        let form = multipart::Form::new().part(
            "uploadFile",
            multipart::Part::bytes(bytes).file_name(file_name),
        );

        let mut request = self.http.post(self.endpoint("upload")?).multipart(form);
        if open {
            request = request.query(&[("open", "true")]);
        }
        check_status(request.send().await?).await?;
        Ok(())
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ClientError::Status {
        status,
        body: body.trim().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        services::{clipboard::MemoryClipboard, LineEnding},
        test_support::TestAgent,
    };
    use std::sync::Arc;

    fn client_for(agent: &TestAgent) -> BridgeClient {
        BridgeClient::new(&ClientArgs {
            host: "127.0.0.1".into(),
            port: agent.addr.port(),
        })
        .expect("client")
    }

    #[test]
    fn brackets_ipv6_hosts() {
        let client = BridgeClient::new(&ClientArgs {
            host: "::1".into(),
            port: 2489,
        })
        .expect("client");
        assert_eq!(client.base.as_str(), "http://[::1]:2489/");
    }

    #[tokio::test]
    async fn copy_then_paste_through_live_agent() {
        let clipboard = Arc::new(MemoryClipboard::default());
        let agent = TestAgent::start("127.0.0.1", LineEnding::Lf, clipboard.clone()).await;
        let client = client_for(&agent);

        client.copy("hello\r\nworld".into()).await.expect("copy");
        assert_eq!(clipboard.contents(), "hello\nworld");
        assert_eq!(client.paste().await.expect("paste"), "hello\nworld");
    }

    #[tokio::test]
    async fn open_sends_base64_encoded_uri() {
        let agent = TestAgent::start(
            "127.0.0.1",
            LineEnding::Auto,
            Arc::new(MemoryClipboard::default()),
        )
        .await;
        let client = client_for(&agent);

        let uri = "https://example.com/search?q=a&b=c d";
        client.open(uri, false, false).await.expect("open");
        assert_eq!(agent.opener.opened(), vec![uri.to_string()]);
    }

    #[tokio::test]
    async fn open_local_file_uploads_and_opens_it() {
        let agent = TestAgent::start(
            "127.0.0.1",
            LineEnding::Auto,
            Arc::new(MemoryClipboard::default()),
        )
        .await;
        let client = client_for(&agent);

        let source = tempfile::TempDir::new().unwrap();
        let path = source.path().join("notes.txt");
        std::fs::write(&path, b"local notes").unwrap();

        client
            .open(path.to_str().unwrap(), false, true)
            .await
            .expect("open local file");

        let stored = agent.store_dir().join("notes.txt");
        assert_eq!(std::fs::read(stored).unwrap(), b"local notes");
        assert_eq!(
            agent.opener.opened(),
            vec![format!("http://127.0.0.1:{}/files/notes.txt", agent.addr.port())]
        );
    }

    #[tokio::test]
    async fn rejected_origin_maps_to_status_error() {
        let agent = TestAgent::start(
            "10.0.0.0/8",
            LineEnding::Auto,
            Arc::new(MemoryClipboard::default()),
        )
        .await;
        let client = client_for(&agent);

        match client.paste().await {
            Err(ClientError::Status { status, .. }) => {
                assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE)
            }
            other => panic!("expected 503, got {other:?}"),
        }
    }
}
