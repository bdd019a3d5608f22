use std::{fmt, io, io::Write, sync::Arc};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use similar::{ChangeTag, TextDiff};
use tabwriter::TabWriter;

use crate::common::data::RequestRecord;

const MAX_BODY_PREVIEW: usize = 60;

/// A failed harness assertion. `Display` renders the mismatch followed by a table of all
/// requests the server received, so the message is useful as a panic message as it is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssertionFailure {
    /// What was checked, e.g. `request count`.
    pub subject: String,
    pub expected: String,
    pub actual: String,
    /// The rendered diagnostics: a diff if one applies and the received requests.
    pub details: String,
}

impl AssertionFailure {
    pub(crate) fn new<S, E, A>(
        subject: S,
        expected: E,
        actual: A,
        requests: &[Arc<RequestRecord>],
    ) -> Self
    where
        S: Into<String>,
        E: Into<String>,
        A: Into<String>,
    {
        Self {
            subject: subject.into(),
            expected: expected.into(),
            actual: actual.into(),
            details: render_requests(requests),
        }
    }

    /// Prepends a line diff of `expected` against `actual` to the details.
    pub(crate) fn with_diff(mut self, expected: &str, actual: &str) -> Self {
        self.details = format!("{}\n{}", render_diff(expected, actual), self.details);
        self
    }
}

impl fmt::Display for AssertionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} mismatch: expected {}, got {}",
            self.subject, self.expected, self.actual
        )?;
        write!(f, "\n{}", self.details)
    }
}

impl std::error::Error for AssertionFailure {}

/// Renders text or, for binary data, its base64 encoding.
pub(crate) fn body_preview(body: &[u8]) -> String {
    match std::str::from_utf8(body) {
        Ok(text) if text.chars().count() > MAX_BODY_PREVIEW => {
            let truncated: String = text.chars().take(MAX_BODY_PREVIEW).collect();
            format!("{:?}...", truncated)
        }
        Ok(text) => format!("{:?}", text),
        Err(_) => format!("base64:{}", BASE64.encode(body)),
    }
}

fn render_requests(requests: &[Arc<RequestRecord>]) -> String {
    if requests.is_empty() {
        return "No request has been received by the stub server.\n".to_string();
    }

    write_request_table(requests).unwrap_or_else(|err| format!("<cannot render requests: {}>\n", err))
}

fn write_request_table(requests: &[Arc<RequestRecord>]) -> io::Result<String> {
    let mut tw = TabWriter::new(vec![]);

    writeln!(tw, "Received requests:")?;
    writeln!(tw, "#\tmethod\ttarget\tbody")?;
    for req in requests {
        match req.parse_error() {
            Some(reason) => writeln!(tw, "{}\t-\t-\tmalformed: {}", req.sequence(), reason)?,
            None => writeln!(
                tw,
                "{}\t{}\t{}\t{}",
                req.sequence(),
                req.method(),
                req.uri(),
                body_preview(req.body())
            )?,
        }
    }

    tw.flush()?;
    let bytes = tw
        .into_inner()
        .map_err(|err| io::Error::new(err.error().kind(), err.error().to_string()))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn render_diff(expected: &str, actual: &str) -> String {
    let mut output = String::from("Diff (- expected, + actual):\n");

    for change in TextDiff::from_lines(expected, actual).iter_all_changes() {
        let sign = match change.tag() {
            ChangeTag::Equal => ' ',
            ChangeTag::Delete => '-',
            ChangeTag::Insert => '+',
        };
        output.push(sign);
        output.push_str(&change.to_string_lossy());
        if change.missing_newline() {
            output.push('\n');
        }
    }

    output
}
