use std::fs::{File, OpenOptions};
use std::io::{self, Write as _};
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use url::Url;

use super::Sender;
use crate::error::{ForwardError, SendError};

enum Target {
    Open(Box<dyn io::Write + Send>),
    Closed,
}

/// Sends batches to a local writer: a file path (`file:`) or an inherited
/// file descriptor (`fd:`).
///
/// Accepted forms:
///
/// - `file:///var/log/metrics.ln` (truncates; add `?append=true` to append)
/// - `file:///dev/null` (discards)
/// - `file:///dev/fd/1` (forwards to the descriptor)
/// - `fd:1` or `fd:/1`
///
/// After `close`, sends are silently discarded; a second `close` reports
/// [`ForwardError::Closed`].
pub(crate) struct WriterSender {
    target: Mutex<Target>,
}

fn bool_option(value: &str) -> bool {
    matches!(value, "1" | "true" | "t" | "yes" | "y")
}

#[cfg(unix)]
fn descriptor_writer(fd_text: &str) -> Result<Box<dyn io::Write + Send>, ForwardError> {
    use std::os::fd::FromRawFd as _;

    let fd: i32 = fd_text.parse().map_err(|_| ForwardError::UnusableUrl {
        reason: format!("'{fd_text}' is not a file descriptor number"),
    })?;

    // The URL hands ownership of the descriptor to this sender.
    let file = unsafe { File::from_raw_fd(fd) };
    Ok(Box::new(file))
}

#[cfg(not(unix))]
fn descriptor_writer(_fd_text: &str) -> Result<Box<dyn io::Write + Send>, ForwardError> {
    Err(ForwardError::UnusableUrl {
        reason: "fd destinations are only supported on unix".to_string(),
    })
}

impl WriterSender {
    pub fn open(url: &Url) -> Result<Self, ForwardError> {
        let writer = match url.scheme() {
            "fd" => {
                // fd:1234 parses as an opaque path; fd:/1234 as a rooted one.
                let fd_text = url.path().trim_start_matches('/');
                if fd_text.is_empty() {
                    return Err(ForwardError::UnusableUrl {
                        reason: "fd destination needs a descriptor number".to_string(),
                    });
                }
                descriptor_writer(fd_text)?
            }
            "file" => {
                let path = url.to_file_path().map_err(|()| ForwardError::UnusableUrl {
                    reason: "file destination needs an absolute path".to_string(),
                })?;
                Self::file_writer(url, &path)?
            }
            other => {
                return Err(ForwardError::NoSender {
                    scheme: other.to_string(),
                })
            }
        };

        Ok(Self {
            target: Mutex::new(Target::Open(writer)),
        })
    }

    fn file_writer(url: &Url, path: &Path) -> Result<Box<dyn io::Write + Send>, ForwardError> {
        if path == Path::new("/dev/null") {
            return Ok(Box::new(io::sink()));
        }

        if let Ok(fd_path) = path.strip_prefix("/dev/fd") {
            if let Some(fd_text) = fd_path.to_str() {
                if !fd_text.is_empty() {
                    return descriptor_writer(fd_text);
                }
            }
        }

        let append = url
            .query_pairs()
            .any(|(name, value)| name == "append" && bool_option(&value));

        let file = if append {
            OpenOptions::new().append(true).create(true).open(path)
        } else {
            File::create(path)
        }
        .map_err(|e| ForwardError::Transport { source: Box::new(e) })?;

        Ok(Box::new(file))
    }
}

#[async_trait]
impl Sender for WriterSender {
    async fn send(&self, payload: Bytes) -> Result<(), SendError> {
        let mut target = self.target.lock().unwrap();
        match &mut *target {
            Target::Open(writer) => writer
                .write_all(&payload)
                .and_then(|()| writer.flush())
                .map_err(|e| SendError::terminal(ForwardError::Transport { source: Box::new(e) })),
            // A closed writer swallows sends, like writing to a sink.
            Target::Closed => Ok(()),
        }
    }

    async fn close(&self) -> Result<(), ForwardError> {
        let mut target = self.target.lock().unwrap();
        match std::mem::replace(&mut *target, Target::Closed) {
            Target::Open(mut writer) => {
                let _ = writer.flush();
                Ok(())
            }
            Target::Closed => Err(ForwardError::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_batches_to_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.ln");
        let url = Url::from_file_path(&path).unwrap();

        let sender = WriterSender::open(&url).unwrap();
        sender.send(Bytes::from_static(b"cpu value=1i 1\n")).await.unwrap();
        sender.send(Bytes::from_static(b"cpu value=2i 2\n")).await.unwrap();

        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "cpu value=1i 1\ncpu value=2i 2\n"
        );
    }

    #[tokio::test]
    async fn append_mode_preserves_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.ln");
        std::fs::write(&path, "existing\n").unwrap();

        let mut url = Url::from_file_path(&path).unwrap();
        url.set_query(Some("append=true"));

        let sender = WriterSender::open(&url).unwrap();
        sender.send(Bytes::from_static(b"new\n")).await.unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "existing\nnew\n");
    }

    #[tokio::test]
    async fn dev_null_discards() {
        let url = Url::parse("file:///dev/null").unwrap();
        let sender = WriterSender::open(&url).unwrap();
        sender.send(Bytes::from_static(b"into the void")).await.unwrap();
    }

    #[tokio::test]
    async fn second_close_reports_closed() {
        let url = Url::parse("file:///dev/null").unwrap();
        let sender = WriterSender::open(&url).unwrap();

        sender.close().await.unwrap();
        assert!(matches!(sender.close().await, Err(ForwardError::Closed)));

        // Sends after close are discarded, not errors.
        sender.send(Bytes::from_static(b"late")).await.unwrap();
    }

    #[test]
    fn bad_fd_path_is_unusable() {
        let url = Url::parse("fd:notanumber").unwrap();
        assert!(matches!(
            WriterSender::open(&url),
            Err(ForwardError::UnusableUrl { .. })
        ));

        let url = Url::parse("fd:/").unwrap();
        assert!(matches!(
            WriterSender::open(&url),
            Err(ForwardError::UnusableUrl { .. })
        ));
    }
}
