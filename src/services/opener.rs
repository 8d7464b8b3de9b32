use std::{net::IpAddr, process::Stdio};

use async_trait::async_trait;
use base64::{
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
    Engine,
};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};
use url::{Host, Url};

/// URL-safe alphabet, accepting payloads with or without `=` padding.
const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Debug, Error)]
pub(crate) enum OpenError {
    #[error("uri is not valid url-safe base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("decoded uri is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// "Open in the default application" capability. Callers log failures and do
/// not report them to the HTTP client.
#[async_trait]
pub(crate) trait Opener: Send + Sync {
    async fn open(&self, target: &str) -> Result<(), OpenError>;
}

/// Opener that launches a platform command with the target as last argument.
pub(crate) struct SystemOpener {
    program: String,
    args: Vec<String>,
}

impl SystemOpener {
    /// `command` is an already split program + arguments list; `None` selects
    /// the platform default.
    pub(crate) fn new(command: Option<Vec<String>>) -> Self {
        let mut tokens = command
            .filter(|tokens| !tokens.is_empty())
            .unwrap_or_else(default_command);
        let program = tokens.remove(0);
        Self {
            program,
            args: tokens,
        }
    }

    pub(crate) fn describe(&self) -> String {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn default_command() -> Vec<String> {
    let tokens: &[&str] = if cfg!(target_os = "macos") {
        &["open"]
    } else if cfg!(target_os = "windows") {
        &["rundll32.exe", "url.dll,FileProtocolHandler"]
    } else {
        &["xdg-open"]
    };
    tokens.iter().map(|token| token.to_string()).collect()
}

#[async_trait]
impl Opener for SystemOpener {
    async fn open(&self, target: &str) -> Result<(), OpenError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(target)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| OpenError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let program = self.program.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => debug!(%program, "open command finished"),
                Ok(status) => warn!(%program, %status, "open command exited unsuccessfully"),
                Err(error) => warn!(%program, %error, "failed waiting for open command"),
            }
        });

        Ok(())
    }
}

/// Produces the URI that should be opened for an `/open` request.
pub(crate) fn resolve_open_target(
    uri: &str,
    is_base64: bool,
    trans_loopback: bool,
    requester: IpAddr,
) -> Result<String, OpenError> {
    let uri = if is_base64 {
        String::from_utf8(URL_SAFE_LENIENT.decode(uri.trim())?)?
    } else {
        uri.to_string()
    };

    if trans_loopback {
        Ok(translate_loopback(&uri, requester))
    } else {
        Ok(uri)
    }
}

/// Points a URI whose host is a literal loopback address at `remote`,
/// keeping the port. Anything else comes back unchanged.
pub(crate) fn translate_loopback(uri: &str, remote: IpAddr) -> String {
    let Ok(mut parsed) = Url::parse(uri) else {
        return uri.to_string();
    };

    let is_loopback = match parsed.host() {
        Some(Host::Ipv4(ip)) => ip.is_loopback(),
        Some(Host::Ipv6(ip)) => ip.is_loopback(),
        _ => false,
    };
    if !is_loopback {
        return uri.to_string();
    }

    if parsed.set_ip_host(remote.to_canonical()).is_err() {
        return uri.to_string();
    }
    parsed.to_string()
}

/// Opener that records targets instead of launching anything.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingOpener {
    opened: std::sync::Mutex<Vec<String>>,
}

#[cfg(test)]
impl RecordingOpener {
    pub(crate) fn opened(&self) -> Vec<String> {
        self.opened.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl Opener for RecordingOpener {
    async fn open(&self, target: &str) -> Result<(), OpenError> {
        self.opened.lock().unwrap().push(target.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};

    fn ip(raw: &str) -> IpAddr {
        raw.parse().unwrap()
    }

    #[test]
    fn platform_default_takes_target_as_single_argument() {
        let opener = SystemOpener::new(None);
        let expected = if cfg!(target_os = "macos") {
            "open"
        } else if cfg!(target_os = "windows") {
            "rundll32.exe url.dll,FileProtocolHandler"
        } else {
            "xdg-open"
        };
        assert_eq!(opener.describe(), expected);
        assert!(!opener.args.iter().any(|arg| arg.eq_ignore_ascii_case("/c")));
    }

    #[test]
    fn rewrites_loopback_host_and_keeps_port() {
        assert_eq!(
            translate_loopback("http://127.0.0.1:8080/x", ip("203.0.113.9")),
            "http://203.0.113.9:8080/x"
        );
        assert_eq!(
            translate_loopback("http://127.10.0.3:3000/a?b=c#d", ip("10.0.0.7")),
            "http://10.0.0.7:3000/a?b=c#d"
        );
    }

    #[test]
    fn rewrites_loopback_without_port() {
        assert_eq!(
            translate_loopback("http://127.0.0.1/index.html", ip("203.0.113.9")),
            "http://203.0.113.9/index.html"
        );
    }

    #[test]
    fn rewrites_ipv6_loopback_and_brackets_ipv6_requesters() {
        assert_eq!(
            translate_loopback("http://[::1]:9000/", ip("2001:db8::5")),
            "http://[2001:db8::5]:9000/"
        );
        assert_eq!(
            translate_loopback("http://127.0.0.1:9000/", ip("::ffff:192.0.2.1")),
            "http://192.0.2.1:9000/"
        );
    }

    #[test]
    fn leaves_non_loopback_uris_untouched() {
        for uri in [
            "http://localhost:8080/x",
            "https://example.com/path",
            "http://192.168.1.10:8080/",
            "file:///tmp/report.pdf",
            "not a url at all",
            "mailto:someone@example.com",
        ] {
            assert_eq!(translate_loopback(uri, ip("203.0.113.9")), uri);
        }
    }

    #[test]
    fn resolves_plain_target() {
        let target =
            resolve_open_target("https://example.com", false, false, ip("127.0.0.1")).unwrap();
        assert_eq!(target, "https://example.com");
    }

    #[test]
    fn decodes_base64_with_or_without_padding() {
        let uri = "http://127.0.0.1:8080/?q=a b&c=d";
        for encoded in [URL_SAFE.encode(uri), URL_SAFE_NO_PAD.encode(uri)] {
            let target = resolve_open_target(&encoded, true, false, ip("127.0.0.1")).unwrap();
            assert_eq!(target, uri);
        }
    }

    #[test]
    fn decodes_then_translates() {
        let encoded = URL_SAFE.encode("http://127.0.0.1:8080/x");
        let target = resolve_open_target(&encoded, true, true, ip("203.0.113.9")).unwrap();
        assert_eq!(target, "http://203.0.113.9:8080/x");
    }

    #[test]
    fn rejects_invalid_base64() {
        let result = resolve_open_target("%%%not-base64%%%", true, false, ip("127.0.0.1"));
        assert!(matches!(result, Err(OpenError::Base64(_))));
    }

    #[test]
    fn rejects_non_utf8_payload() {
        let encoded = URL_SAFE.encode([0xff, 0xfe]);
        let result = resolve_open_target(&encoded, true, false, ip("127.0.0.1"));
        assert!(matches!(result, Err(OpenError::Utf8(_))));
    }

    #[test]
    fn system_opener_uses_configured_command() {
        let opener = SystemOpener::new(Some(vec!["firefox".into(), "--new-tab".into()]));
        assert_eq!(opener.describe(), "firefox --new-tab");

        let default = SystemOpener::new(None);
        assert!(!default.describe().is_empty());
    }

    #[tokio::test]
    async fn system_opener_reports_missing_program() {
        let opener = SystemOpener::new(Some(vec!["lemonade-no-such-opener-binary".into()]));
        let result = opener.open("https://example.com").await;
        assert!(matches!(result, Err(OpenError::Spawn { .. })));
    }
}
