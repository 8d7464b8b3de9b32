use std::{
    io::Read,
    net::SocketAddr,
    path::{Component, Path, PathBuf},
    sync::Arc,
    time::Instant,
};

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{
        multipart::MultipartRejection,
        rejection::{BytesRejection, ExtensionRejection},
        ConnectInfo, DefaultBodyLimit, Multipart, Query, Request, State,
    },
    http::{Method, StatusCode},
    middleware::{self, Next},
    http::header,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

mod client;
mod config;
mod services;

use client::{BridgeClient, ClientArgs};
use config::{AgentConfig, ServerArgs};
use services::{
    file_href, local_file_url, resolve_open_target, AllowList, ClipboardService, FileStore, Opener,
    StoreError, SystemClipboard, SystemOpener,
};

const UPLOAD_FIELD: &str = "uploadFile";

#[derive(Parser, Debug)]
#[command(author, version, about = "Clipboard and open-url bridge for remote sessions", long_about = None)]
struct Cli {
    #[arg(
        long,
        global = true,
        env = "LEMONADE_LOG_LEVEL",
        default_value_t = 1,
        value_parser = clap::value_parser!(u8).range(0..=4),
        help = "0 debug, 1 info, 2 warn, 3 error, 4 critical (RUST_LOG takes precedence)"
    )]
    log_level: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the agent.
    Server(ServerArgs),
    /// Copy TEXT (or stdin) to the agent's clipboard.
    Copy {
        #[command(flatten)]
        client: ClientArgs,
        text: Option<String>,
    },
    /// Print the agent's clipboard.
    Paste {
        #[command(flatten)]
        client: ClientArgs,
    },
    /// Open a URI (or, with --trans-localfile, a local file) on the agent host.
    Open {
        #[command(flatten)]
        client: ClientArgs,
        uri: String,
        #[arg(long, help = "Point loopback URIs at this machine's address")]
        trans_loopback: bool,
        #[arg(long, help = "Upload an existing local file and open it from the agent")]
        trans_localfile: bool,
    },
}

struct AppState {
    config: Arc<AgentConfig>,
    allow_list: Arc<AllowList>,
    clipboard: Arc<ClipboardService>,
    opener: Arc<dyn Opener>,
    store: Arc<FileStore>,
    started_at: Instant,
}

#[derive(Debug)]
struct AgentError {
    status: StatusCode,
    message: String,
}

impl AgentError {
    fn method_not_allowed(message: &str) -> Self {
        Self {
            status: StatusCode::METHOD_NOT_ALLOWED,
            message: message.to_string(),
        }
    }

    fn transport(message: &str) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.to_string(),
        }
    }

    fn forbidden_origin() -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: "Not allow ip.".to_string(),
        }
    }

    fn bad_request(message: &str) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.to_string(),
        }
    }

    fn server(message: &str) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.to_string(),
        }
    }

    fn rejected(status: StatusCode, message: String) -> Self {
        Self { status, message }
    }
}

impl IntoResponse for AgentError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::log_filter(cli.log_level))),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();

    match cli.command {
        Command::Server(args) => {
            let config = AgentConfig::from_args(args)?;
            serve(config).await
        }
        Command::Copy { client, text } => {
            let text = match text {
                Some(text) => text,
                None => {
                    let mut buffer = String::new();
                    std::io::stdin()
                        .read_to_string(&mut buffer)
                        .context("failed to read text from stdin")?;
                    buffer
                }
            };
            BridgeClient::new(&client)?.copy(text).await?;
            Ok(())
        }
        Command::Paste { client } => {
            let text = BridgeClient::new(&client)?.paste().await?;
            print!("{text}");
            Ok(())
        }
        Command::Open {
            client,
            uri,
            trans_loopback,
            trans_localfile,
        } => {
            BridgeClient::new(&client)?
                .open(&uri, trans_loopback, trans_localfile)
                .await?;
            Ok(())
        }
    }
}

async fn serve(config: AgentConfig) -> anyhow::Result<()> {
    let allow_list = AllowList::new(&config.allow)?;
    if allow_list.is_empty() {
        warn!("allow-list is empty; every protected request will be rejected");
    }

    let store = FileStore::open(config.store_dir.clone())
        .await
        .with_context(|| format!("failed to prepare store directory {:?}", config.store_dir))?;
    let backend = SystemClipboard::spawn().context("failed to start clipboard thread")?;
    let clipboard = ClipboardService::new(Arc::new(backend), config.line_ending);
    let opener = SystemOpener::new(config.open_command.clone());

    info!(
        allow = %allow_list,
        line_ending = ?config.line_ending,
        clipboard = clipboard.backend_id(),
        opener = %opener.describe(),
        files_behind_allow_list = config.serve_files_behind_allow_list,
        "agent configured"
    );

    let listen = config.listen;
    let store_dir = config.store_dir.clone();
    let state = Arc::new(AppState {
        config: Arc::new(config),
        allow_list: Arc::new(allow_list),
        clipboard: Arc::new(clipboard),
        opener: Arc::new(opener),
        store: Arc::new(store),
        started_at: Instant::now(),
    });

    let app = build_router(state);

    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    info!(%listen, store_dir = %store_dir.display(), "lemonade-bridge listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

    info!("lemonade-bridge stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(%error, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                warn!(%error, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received, draining connections");
}

fn build_router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/copy", post(copy_handler))
        .route("/paste", get(paste_handler))
        .route("/open", get(open_handler))
        .route("/upload", post(upload_handler))
        .route("/health", get(health_handler))
        .layer(DefaultBodyLimit::max(state.config.max_upload_bytes))
        .layer(middleware::from_fn_with_state(state.clone(), access_guard))
        .with_state(state.clone());

    // ServeDir hands directory requests without an index.html to the fallback.
    let index = get(file_index_handler).with_state(state.clone());
    let mut files =
        Router::new().nest_service("/files", ServeDir::new(state.store.root()).fallback(index));
    if state.config.serve_files_behind_allow_list {
        files = files.route_layer(middleware::from_fn_with_state(state.clone(), access_guard));
    }

    protected.merge(files).layer(TraceLayer::new_for_http())
}

/// Gate in front of every dynamic endpoint: method, then transport address,
/// then allow-list membership.
async fn access_guard(
    State(state): State<Arc<AppState>>,
    connect_info: Result<ConnectInfo<SocketAddr>, ExtensionRejection>,
    request: Request,
    next: Next,
) -> Result<Response, AgentError> {
    if request.method() != Method::GET && request.method() != Method::POST {
        return Err(AgentError::method_not_allowed("Not support method."));
    }

    let ConnectInfo(peer) = connect_info.map_err(|rejection| {
        error!(error = %rejection, "peer address unavailable");
        AgentError::transport("RemoteAddr error.")
    })?;

    if !state.allow_list.includes(&peer.ip().to_string()) {
        info!(ip = %peer.ip(), path = %request.uri().path(), "rejected request from address outside allow-list");
        return Err(AgentError::forbidden_origin());
    }

    Ok(next.run(request).await)
}

async fn copy_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Bytes, BytesRejection>,
) -> Result<StatusCode, AgentError> {
    let body = body.map_err(|rejection| {
        error!(error = %rejection, "failed to read copy body");
        AgentError::rejected(rejection.status(), rejection.body_text())
    })?;

    if let Err(error) = state.clipboard.copy(&body).await {
        error!(%error, "clipboard write failed");
    }
    Ok(StatusCode::OK)
}

async fn paste_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.clipboard.paste().await {
        Ok(text) => text.into_response(),
        Err(error) => {
            error!(%error, "clipboard read failed");
            StatusCode::OK.into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct OpenQuery {
    #[serde(default)]
    uri: String,
    base64: Option<String>,
    #[serde(rename = "transLoopback")]
    trans_loopback: Option<String>,
}

async fn open_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(query): Query<OpenQuery>,
) -> Result<StatusCode, AgentError> {
    if query.uri.is_empty() {
        return Err(AgentError::bad_request("uri is required"));
    }

    let target = match resolve_open_target(
        &query.uri,
        is_flag_set(query.base64.as_deref()),
        is_flag_set(query.trans_loopback.as_deref()),
        peer.ip(),
    ) {
        Ok(target) => target,
        Err(error) => {
            error!(%error, uri = %query.uri, "discarding open request");
            return Ok(StatusCode::OK);
        }
    };

    launch(state.opener.as_ref(), &target).await;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
struct UploadQuery {
    open: Option<String>,
}

async fn upload_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UploadQuery>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<StatusCode, AgentError> {
    let mut multipart = multipart.map_err(|rejection| {
        error!(error = %rejection, "upload is not a multipart form");
        AgentError::server("Error Retrieving the File")
    })?;

    let mut upload = None;
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(error) => {
                error!(%error, "failed to parse multipart form");
                return Err(AgentError::server("Error Retrieving the File"));
            }
        };
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }

        let file_name = field.file_name().unwrap_or_default().to_string();
        let bytes = field.bytes().await.map_err(|error| {
            error!(%error, "failed to read uploaded file");
            AgentError::server("Error Read the File")
        })?;
        upload = Some((file_name, bytes));
        break;
    }

    let Some((file_name, bytes)) = upload else {
        error!(field = UPLOAD_FIELD, "upload form has no file field");
        return Err(AgentError::server("Error Retrieving the File"));
    };

    match state.store.store(&file_name, &bytes).await {
        Ok(path) => info!(path = %path.display(), bytes = bytes.len(), "stored upload"),
        Err(StoreError::InvalidName(name)) => {
            warn!(%name, "rejected upload with unsafe file name");
            return Err(AgentError::bad_request("Invalid file name"));
        }
        Err(error) => {
            error!(%error, "failed to store upload");
            return Err(AgentError::server("Error Write the File"));
        }
    }

    if is_flag_set(query.open.as_deref()) {
        match local_file_url(state.config.port, &file_name) {
            Some(target) => launch(state.opener.as_ref(), &target).await,
            None => warn!(%file_name, "could not build file url to open"),
        }
    }

    Ok(StatusCode::OK)
}

/// Listing of the store root. Uploads are flat, so deeper paths are not found.
async fn file_index_handler(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let path = request.uri().path();
    if !path.is_empty() && path != "/" {
        return StatusCode::NOT_FOUND.into_response();
    }

    let names = match state.store.list().await {
        Ok(names) => names,
        Err(error) => {
            error!(%error, "failed to list file store");
            return AgentError::server("Error reading directory").into_response();
        }
    };

    let mut body = String::from("<pre>\n");
    for name in names {
        let Some(href) = file_href(&name) else {
            continue;
        };
        body.push_str(&format!(
            "<a href=\"{}\">{}</a>\n",
            escape_html(&href),
            escape_html(&name)
        ));
    }
    body.push_str("</pre>\n");
    ([(header::CACHE_CONTROL, "no-cache")], Html(body)).into_response()
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&#34;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "at": now_iso(),
        "uptimeSec": state.started_at.elapsed().as_secs(),
    }))
}

/// Hands `target` to the opener. Failures stay in the log.
async fn launch(opener: &dyn Opener, target: &str) {
    info!(uri = %target, "open");
    if let Err(error) = opener.open(target).await {
        error!(%error, uri = %target, "open failed");
    } else {
        debug!(uri = %target, "open dispatched");
    }
}

fn is_flag_set(value: Option<&str>) -> bool {
    value == Some("true")
}

fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();

    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            Component::RootDir | Component::Prefix(_) | Component::Normal(_) => {
                normalized.push(component.as_os_str());
            }
        }
    }

    normalized
}

#[cfg(test)]
mod test_support {
    use std::{net::SocketAddr, path::Path, sync::Arc, time::Instant};

    use tempfile::TempDir;
    use tokio::net::TcpListener;

    use super::{build_router, AppState};
    use crate::{
        config::AgentConfig,
        services::{
            clipboard::MemoryClipboard, opener::RecordingOpener, AllowList, ClipboardService,
            FileStore, LineEnding,
        },
    };

    pub(crate) fn test_config(allow: &str, line_ending: LineEnding, store: &Path) -> AgentConfig {
        AgentConfig {
            listen: "127.0.0.1:8082".parse().unwrap(),
            port: 8082,
            allow: allow.to_string(),
            line_ending,
            store_dir: store.to_path_buf(),
            serve_files_behind_allow_list: false,
            max_upload_bytes: 10 << 20,
            open_command: None,
        }
    }

    pub(crate) async fn test_state(
        config: AgentConfig,
        clipboard: Arc<MemoryClipboard>,
        opener: Arc<RecordingOpener>,
    ) -> Arc<AppState> {
        let allow_list = AllowList::new(&config.allow).expect("allow-list");
        let store = FileStore::open(config.store_dir.clone())
            .await
            .expect("store");
        let line_ending = config.line_ending;
        Arc::new(AppState {
            config: Arc::new(config),
            allow_list: Arc::new(allow_list),
            clipboard: Arc::new(ClipboardService::new(clipboard, line_ending)),
            opener,
            store: Arc::new(store),
            started_at: Instant::now(),
        })
    }

    /// Agent served on an ephemeral loopback port.
    pub(crate) struct TestAgent {
        pub(crate) addr: SocketAddr,
        pub(crate) opener: Arc<RecordingOpener>,
        store: TempDir,
    }

    impl TestAgent {
        pub(crate) async fn start(
            allow: &str,
            line_ending: LineEnding,
            clipboard: Arc<MemoryClipboard>,
        ) -> Self {
            let store = TempDir::new().expect("temp store");
            let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
            let addr = listener.local_addr().expect("local addr");

            let mut config = test_config(allow, line_ending, store.path());
            config.listen = addr;
            config.port = addr.port();

            let opener = Arc::new(RecordingOpener::default());
            let state = test_state(config, clipboard, opener.clone()).await;
            let app = build_router(state);
            tokio::spawn(async move {
                let _ = axum::serve(
                    listener,
                    app.into_make_service_with_connect_info::<SocketAddr>(),
                )
                .await;
            });

            Self {
                addr,
                opener,
                store,
            }
        }

        pub(crate) fn store_dir(&self) -> &Path {
            self.store.path()
        }
    }
}
