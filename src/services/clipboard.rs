use std::{str::FromStr, sync::Arc, thread};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

use crate::config::ConfigError;

#[derive(Debug, Error)]
pub(crate) enum ClipboardError {
    #[error("clipboard backend {backend} unavailable: {reason}")]
    Unavailable { backend: String, reason: String },
    #[error("clipboard read failed: {0}")]
    Read(String),
    #[error("clipboard write failed: {0}")]
    Write(String),
}

/// Host clipboard capability. Implementations hold a single text buffer with
/// last-writer-wins semantics.
#[async_trait]
pub(crate) trait ClipboardBackend: Send + Sync {
    fn id(&self) -> &str;

    async fn read_text(&self) -> Result<String, ClipboardError>;

    async fn write_text(&self, text: &str) -> Result<(), ClipboardError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) enum LineEnding {
    Lf,
    Crlf,
    Cr,
    #[default]
    Auto,
}

impl LineEnding {
    fn sequence(self) -> Option<&'static str> {
        match self {
            Self::Lf => Some("\n"),
            Self::Crlf => Some("\r\n"),
            Self::Cr => Some("\r"),
            Self::Auto => None,
        }
    }

    /// Rewrites every `\r\n`, lone `\r` and lone `\n` to the target sequence.
    /// `Auto` keeps the text as received.
    pub(crate) fn apply(self, text: &str) -> String {
        let Some(target) = self.sequence() else {
            return text.to_string();
        };

        let mut converted = String::with_capacity(text.len());
        let mut chars = text.chars().peekable();
        while let Some(ch) = chars.next() {
            match ch {
                '\r' => {
                    if chars.peek() == Some(&'\n') {
                        chars.next();
                    }
                    converted.push_str(target);
                }
                '\n' => converted.push_str(target),
                other => converted.push(other),
            }
        }
        converted
    }
}

impl FromStr for LineEnding {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "lf" => Ok(Self::Lf),
            "crlf" => Ok(Self::Crlf),
            "cr" => Ok(Self::Cr),
            "" | "auto" => Ok(Self::Auto),
            _ => Err(ConfigError::LineEnding(value.to_string())),
        }
    }
}

/// Serializes agent access to the host clipboard and applies line-ending
/// normalization on the way in.
pub(crate) struct ClipboardService {
    backend: Arc<dyn ClipboardBackend>,
    line_ending: LineEnding,
    lock: Mutex<()>,
}

impl ClipboardService {
    pub(crate) fn new(backend: Arc<dyn ClipboardBackend>, line_ending: LineEnding) -> Self {
        Self {
            backend,
            line_ending,
            lock: Mutex::new(()),
        }
    }

    pub(crate) fn backend_id(&self) -> &str {
        self.backend.id()
    }

    /// Decodes `raw` (lossy UTF-8), normalizes it and writes it. Returns the
    /// text that was handed to the backend.
    pub(crate) async fn copy(&self, raw: &[u8]) -> Result<String, ClipboardError> {
        let text = self.line_ending.apply(&String::from_utf8_lossy(raw));
        let _guard = self.lock.lock().await;
        self.backend.write_text(&text).await?;
        debug!(backend = self.backend.id(), bytes = text.len(), "clipboard written");
        Ok(text)
    }

    pub(crate) async fn paste(&self) -> Result<String, ClipboardError> {
        let _guard = self.lock.lock().await;
        let text = self.backend.read_text().await?;
        debug!(backend = self.backend.id(), bytes = text.len(), "clipboard read");
        Ok(text)
    }
}

enum ClipboardCommand {
    Read(oneshot::Sender<Result<String, ClipboardError>>),
    Write(String, oneshot::Sender<Result<(), ClipboardError>>),
}

/// System clipboard backed by `arboard`.
///
/// The arboard handle lives on a dedicated thread for the lifetime of the
/// agent; on X11 the selection is only served while that handle exists.
pub(crate) struct SystemClipboard {
    commands: mpsc::UnboundedSender<ClipboardCommand>,
}

const SYSTEM_BACKEND: &str = "arboard";

impl SystemClipboard {
    pub(crate) fn spawn() -> Result<Self, std::io::Error> {
        let (tx, mut rx) = mpsc::unbounded_channel::<ClipboardCommand>();

        thread::Builder::new()
            .name("clipboard".into())
            .spawn(move || {
                let mut handle: Option<arboard::Clipboard> = None;
                while let Some(command) = rx.blocking_recv() {
                    if handle.is_none() {
                        match arboard::Clipboard::new() {
                            Ok(clipboard) => handle = Some(clipboard),
                            Err(error) => {
                                warn!(%error, "system clipboard unavailable");
                                let unavailable = || ClipboardError::Unavailable {
                                    backend: SYSTEM_BACKEND.to_string(),
                                    reason: error.to_string(),
                                };
                                match command {
                                    ClipboardCommand::Read(reply) => {
                                        let _ = reply.send(Err(unavailable()));
                                    }
                                    ClipboardCommand::Write(_, reply) => {
                                        let _ = reply.send(Err(unavailable()));
                                    }
                                }
                                continue;
                            }
                        }
                    }

                    let Some(clipboard) = handle.as_mut() else {
                        continue;
                    };
                    match command {
                        ClipboardCommand::Read(reply) => {
                            let result = clipboard
                                .get_text()
                                .map_err(|error| ClipboardError::Read(error.to_string()));
                            let _ = reply.send(result);
                        }
                        ClipboardCommand::Write(text, reply) => {
                            let result = clipboard
                                .set_text(text)
                                .map_err(|error| ClipboardError::Write(error.to_string()));
                            let _ = reply.send(result);
                        }
                    }
                }
            })?;

        Ok(Self { commands: tx })
    }

    fn closed() -> ClipboardError {
        ClipboardError::Unavailable {
            backend: SYSTEM_BACKEND.to_string(),
            reason: "clipboard thread stopped".to_string(),
        }
    }
}

#[async_trait]
impl ClipboardBackend for SystemClipboard {
    fn id(&self) -> &str {
        SYSTEM_BACKEND
    }

    async fn read_text(&self) -> Result<String, ClipboardError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(ClipboardCommand::Read(reply))
            .map_err(|_| Self::closed())?;
        rx.await.map_err(|_| Self::closed())?
    }

    async fn write_text(&self, text: &str) -> Result<(), ClipboardError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(ClipboardCommand::Write(text.to_string(), reply))
            .map_err(|_| Self::closed())?;
        rx.await.map_err(|_| Self::closed())?
    }
}

/// In-process clipboard used by tests.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct MemoryClipboard {
    text: std::sync::Mutex<String>,
    failing: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl MemoryClipboard {
    pub(crate) fn with_text(text: &str) -> Self {
        let clipboard = Self::default();
        *clipboard.text.lock().unwrap() = text.to_string();
        clipboard
    }

    pub(crate) fn failing() -> Self {
        let clipboard = Self::default();
        clipboard
            .failing
            .store(true, std::sync::atomic::Ordering::SeqCst);
        clipboard
    }

    pub(crate) fn contents(&self) -> String {
        self.text.lock().unwrap().clone()
    }

    fn is_failing(&self) -> bool {
        self.failing.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
#[async_trait]
impl ClipboardBackend for MemoryClipboard {
    fn id(&self) -> &str {
        "memory"
    }

    async fn read_text(&self) -> Result<String, ClipboardError> {
        if self.is_failing() {
            return Err(ClipboardError::Read("memory clipboard offline".into()));
        }
        Ok(self.contents())
    }

    async fn write_text(&self, text: &str) -> Result<(), ClipboardError> {
        if self.is_failing() {
            return Err(ClipboardError::Write("memory clipboard offline".into()));
        }
        *self.text.lock().unwrap() = text.to_string();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(mode: LineEnding) -> (Arc<MemoryClipboard>, ClipboardService) {
        let backend = Arc::new(MemoryClipboard::default());
        let service = ClipboardService::new(backend.clone(), mode);
        (backend, service)
    }

    #[test]
    fn converts_mixed_line_endings() {
        let mixed = "a\r\nb\nc\rd\r\n\r\ne";
        assert_eq!(LineEnding::Lf.apply(mixed), "a\nb\nc\nd\n\ne");
        assert_eq!(LineEnding::Crlf.apply(mixed), "a\r\nb\r\nc\r\nd\r\n\r\ne");
        assert_eq!(LineEnding::Cr.apply(mixed), "a\rb\rc\rd\r\re");
        assert_eq!(LineEnding::Auto.apply(mixed), mixed);
    }

    #[test]
    fn conversion_handles_edges() {
        assert_eq!(LineEnding::Crlf.apply(""), "");
        assert_eq!(LineEnding::Crlf.apply("\n"), "\r\n");
        assert_eq!(LineEnding::Lf.apply("\r"), "\n");
        assert_eq!(LineEnding::Lf.apply("trailing\r\n"), "trailing\n");
        assert_eq!(LineEnding::Cr.apply("héllo\nwörld"), "héllo\rwörld");
    }

    #[test]
    fn parses_modes_case_insensitively() {
        assert_eq!("LF".parse::<LineEnding>().unwrap(), LineEnding::Lf);
        assert_eq!("crlf".parse::<LineEnding>().unwrap(), LineEnding::Crlf);
        assert_eq!(" Cr ".parse::<LineEnding>().unwrap(), LineEnding::Cr);
        assert_eq!("".parse::<LineEnding>().unwrap(), LineEnding::Auto);
        assert!("dos".parse::<LineEnding>().is_err());
    }

    #[tokio::test]
    async fn copy_normalizes_before_writing() {
        let (backend, service) = service(LineEnding::Lf);
        let written = service.copy(b"hello\r\nworld").await.expect("copy");
        assert_eq!(written, "hello\nworld");
        assert_eq!(backend.contents(), "hello\nworld");
    }

    #[tokio::test]
    async fn copy_then_paste_round_trips_normalized_text() {
        for mode in [LineEnding::Lf, LineEnding::Crlf, LineEnding::Cr, LineEnding::Auto] {
            let (_, service) = service(mode);
            let input = "one\r\ntwo\nthree\rfour";
            service.copy(input.as_bytes()).await.expect("copy");
            assert_eq!(service.paste().await.expect("paste"), mode.apply(input));
        }
    }

    #[tokio::test]
    async fn repeated_paste_is_stable() {
        let backend = Arc::new(MemoryClipboard::with_text("stable"));
        let service = ClipboardService::new(backend, LineEnding::Auto);
        let first = service.paste().await.expect("first paste");
        let second = service.paste().await.expect("second paste");
        assert_eq!(first, "stable");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn invalid_utf8_is_decoded_lossily() {
        let (backend, service) = service(LineEnding::Auto);
        service.copy(&[b'o', b'k', 0xff]).await.expect("copy");
        assert_eq!(backend.contents(), "ok\u{fffd}");
    }

    #[tokio::test]
    async fn backend_failures_surface_as_errors() {
        let service = ClipboardService::new(Arc::new(MemoryClipboard::failing()), LineEnding::Lf);
        assert!(matches!(
            service.copy(b"x").await,
            Err(ClipboardError::Write(_))
        ));
        assert!(matches!(service.paste().await, Err(ClipboardError::Read(_))));
    }

    #[tokio::test]
    async fn concurrent_copies_leave_one_complete_value() {
        let (backend, service) = service(LineEnding::Auto);
        let service = Arc::new(service);
        let writers = (0..16)
            .map(|index| {
                let service = service.clone();
                tokio::spawn(async move {
                    let text = format!("writer-{index}");
                    service.copy(text.as_bytes()).await.expect("copy");
                })
            })
            .collect::<Vec<_>>();
        for writer in writers {
            writer.await.expect("join");
        }
        let value = backend.contents();
        assert!(value.starts_with("writer-"), "unexpected value {value:?}");
    }
}
