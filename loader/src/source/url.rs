//! File/URL/stdin source
//!
//! Reads JSON Lines from a local file, an HTTP(S) URL, or standard input.
//! There is no broker on the other side: nothing is acknowledged, nothing
//! is redelivered, and the source reports `Closed` at end of input so the
//! loader can drain and exit.

use std::collections::VecDeque;

use async_trait::async_trait;
use loader_common::{Error, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{AckToken, RawMessage, Received, Source};

type DynReader = Box<dyn AsyncRead + Send + Unpin>;

enum Input {
    /// Streaming lines from a file or stdin.
    Stream(Lines<BufReader<DynReader>>),
    /// Pre-fetched lines from an HTTP(S) URL.
    Fetched(VecDeque<String>),
}

/// Pollable line source over a URL-addressable input.
pub struct UrlSource {
    input: Mutex<Input>,
}

impl UrlSource {
    /// Open the input named by `input_url`; `None` reads standard input.
    pub async fn open(input_url: Option<&str>) -> Result<UrlSource> {
        let input = match input_url {
            None => {
                let reader: DynReader = Box::new(tokio::io::stdin());
                Input::Stream(BufReader::new(reader).lines())
            }
            Some(url) if url.starts_with("http://") || url.starts_with("https://") => {
                let response = reqwest::get(url)
                    .await
                    .and_then(|r| r.error_for_status())
                    .map_err(|err| Error::Source(format!("fetching {url}: {err}")))?;
                let text = response
                    .text()
                    .await
                    .map_err(|err| Error::Source(format!("reading {url}: {err}")))?;
                Input::Fetched(text.lines().map(str::to_string).collect())
            }
            Some(url) => {
                let path = url.strip_prefix("file://").unwrap_or(url);
                let file = tokio::fs::File::open(path).await?;
                let reader: DynReader = Box::new(file);
                Input::Stream(BufReader::new(reader).lines())
            }
        };

        Ok(UrlSource {
            input: Mutex::new(input),
        })
    }

    fn message(&self, body: String) -> RawMessage {
        RawMessage {
            id: Uuid::new_v4(),
            body,
            token: AckToken::None,
        }
    }
}

#[async_trait]
impl Source for UrlSource {
    fn name(&self) -> &'static str {
        "url"
    }

    async fn receive(&self) -> Result<Received> {
        let mut input = self.input.lock().await;
        loop {
            let line = match &mut *input {
                Input::Stream(lines) => lines.next_line().await?,
                Input::Fetched(lines) => lines.pop_front(),
            };
            match line {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => return Ok(Received::Message(self.message(line))),
                None => return Ok(Received::Closed),
            }
        }
    }

    async fn ack(&self, _message: &RawMessage) -> Result<()> {
        Ok(())
    }

    async fn nack(&self, _message: &RawMessage) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn reads_lines_and_closes_at_eof() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"RECORD_ID":"1"}}"#).unwrap();
        writeln!(file).unwrap();
        writeln!(file, r#"{{"RECORD_ID":"2"}}"#).unwrap();
        file.flush().unwrap();

        let source = UrlSource::open(Some(file.path().to_str().unwrap()))
            .await
            .unwrap();

        let Received::Message(first) = source.receive().await.unwrap() else {
            panic!("expected a message");
        };
        assert!(first.body.contains("\"1\""));
        assert_eq!(first.token, AckToken::None);

        // The blank line is skipped.
        let Received::Message(second) = source.receive().await.unwrap() else {
            panic!("expected a message");
        };
        assert!(second.body.contains("\"2\""));

        assert!(matches!(source.receive().await.unwrap(), Received::Closed));
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        assert!(UrlSource::open(Some("/no/such/file.jsonl")).await.is_err());
    }
}
