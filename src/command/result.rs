/// Maximum length of an error description sent to the orchestrator.
pub const MAX_ERROR_TEXT: usize = 300;

pub const DEFAULT_REPORT_MIME: &str = "text/plain";

/// Report file attached to a finished execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub filename: String,
    pub data: Vec<u8>,
    pub mime_type: String,
}

impl Report {
    pub fn new(
        filename: impl Into<String>,
        data: impl Into<Vec<u8>>,
        mime_type: impl Into<String>,
    ) -> Self {
        Self {
            filename: filename.into(),
            data: data.into(),
            mime_type: mime_type.into(),
        }
    }

    pub fn text(filename: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self::new(filename, data, DEFAULT_REPORT_MIME)
    }
}

/// Terminal outcome of one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResult {
    /// The command was interrupted by a stop request.
    Stopped,
    /// Ran to completion without a pass/fail verdict.
    Completed(Report),
    Passed(Report),
    Failed(Report),
    /// The command could not produce a verdict. Never carries a report.
    Error { name: String, description: String },
}

impl CommandResult {
    /// Builds an error result with both texts sanitized.
    pub fn error(name: impl AsRef<str>, description: impl AsRef<str>) -> Self {
        CommandResult::Error {
            name: sanitize_error_text(name.as_ref()),
            description: sanitize_error_text(description.as_ref()),
        }
    }

    /// Result tag as the orchestrator spells it.
    pub fn tag(&self) -> &'static str {
        match self {
            CommandResult::Stopped => "Stopped",
            CommandResult::Completed(_) => "Completed",
            CommandResult::Passed(_) => "Passed",
            CommandResult::Failed(_) => "Failed",
            CommandResult::Error { .. } => "Error",
        }
    }

    pub fn error_name(&self) -> &str {
        match self {
            CommandResult::Error { name, .. } => name,
            _ => "",
        }
    }

    pub fn error_description(&self) -> &str {
        match self {
            CommandResult::Error { description, .. } => description,
            _ => "",
        }
    }

    /// Report to upload, if one with a non-empty filename is attached.
    pub fn report(&self) -> Option<&Report> {
        match self {
            CommandResult::Completed(report)
            | CommandResult::Passed(report)
            | CommandResult::Failed(report) => Some(report).filter(|r| !r.filename.is_empty()),
            CommandResult::Stopped | CommandResult::Error { .. } => None,
        }
    }
}

impl std::fmt::Display for CommandResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandResult::Error { name, description } => {
                write!(f, "Error name={} description={}", name, description)
            }
            other => match other.report() {
                Some(report) => write!(
                    f,
                    "{} report={} ({} bytes, {})",
                    other.tag(),
                    report.filename,
                    report.data.len(),
                    report.mime_type
                ),
                None => write!(f, "{}", other.tag()),
            },
        }
    }
}

fn is_allowed(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '[' | ']' | ':' | '/' | '(' | ')' | '*' | '.' | ',' | ' ' | '\n')
}

/// Makes free text safe for the orchestrator's error fields.
///
/// Tabs become two spaces, `==`/`--` separator runs are removed, runs of
/// spaces collapse to one, characters outside the allowed set become `_`, and
/// the result is capped at [`MAX_ERROR_TEXT`] characters. Applying it twice
/// gives the same text as applying it once.
pub fn sanitize_error_text(text: &str) -> String {
    let mut s = text.replace('\t', "  ");

    while s.contains("==") || s.contains("--") {
        s = s.replace("==", "").replace("--", "");
    }

    let mut collapsed = String::with_capacity(s.len());
    let mut prev_space = false;
    for c in s.chars() {
        if c == ' ' {
            if !prev_space {
                collapsed.push(c);
            }
            prev_space = true;
        } else {
            collapsed.push(c);
            prev_space = false;
        }
    }

    collapsed
        .chars()
        .map(|c| if is_allowed(c) { c } else { '_' })
        .take(MAX_ERROR_TEXT)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_match_wire_names() {
        assert_eq!(CommandResult::Stopped.tag(), "Stopped");
        assert_eq!(CommandResult::Passed(Report::text("r.log", "ok")).tag(), "Passed");
        assert_eq!(CommandResult::Failed(Report::text("r.log", "")).tag(), "Failed");
        assert_eq!(CommandResult::Completed(Report::text("r.log", "")).tag(), "Completed");
        assert_eq!(CommandResult::error("x", "y").tag(), "Error");
    }

    #[test]
    fn report_requires_filename() {
        let with = CommandResult::Passed(Report::text("r.log", "ok"));
        assert_eq!(with.report().map(|r| r.data.as_slice()), Some(&b"ok"[..]));

        let without = CommandResult::Passed(Report::text("", "ok"));
        assert!(without.report().is_none());
        assert!(CommandResult::Stopped.report().is_none());
    }

    #[test]
    fn error_fields_only_on_error() {
        let err = CommandResult::error("Internal error", "it broke");
        assert_eq!(err.error_name(), "Internal error");
        assert_eq!(err.error_description(), "it broke");
        assert_eq!(CommandResult::Stopped.error_name(), "");
        assert_eq!(CommandResult::Stopped.error_description(), "");
    }

    #[test]
    fn sanitize_collapses_spaces_and_tabs() {
        assert_eq!(sanitize_error_text("a    b\tc"), "a b c");
    }

    #[test]
    fn sanitize_strips_separator_runs() {
        assert_eq!(sanitize_error_text("=====\nheader\n-----"), "_\nheader\n-");
        assert_eq!(sanitize_error_text("a -- b"), "a b");
        assert_eq!(sanitize_error_text("-==-"), "");
    }

    #[test]
    fn sanitize_replaces_disallowed_characters() {
        assert_eq!(
            sanitize_error_text("Error: \"bad\" value; x=1 <tag> é"),
            "Error: _bad_ value_ x_1 _tag_ _"
        );
        assert_eq!(
            sanitize_error_text("File /tmp/x.py, line 3 (main) [ok] *"),
            "File /tmp/x.py, line 3 (main) [ok] *"
        );
    }

    #[test]
    fn sanitize_caps_length() {
        let long = "x".repeat(1000);
        assert_eq!(sanitize_error_text(&long).chars().count(), MAX_ERROR_TEXT);
    }

    #[test]
    fn sanitize_is_idempotent() {
        let long = "long line with spaces   and\ttabs ".repeat(30);
        let samples = [
            "Traceback (most recent call last):\n\tFile \"x\", line 1\n  ==> boom -- again",
            " -- \t -- ",
            "a\t\tb == c --- d ==== e",
            "unicode: héllo wörld ✓",
            long.as_str(),
        ];
        for sample in samples {
            let once = sanitize_error_text(sample);
            let twice = sanitize_error_text(&once);
            assert_eq!(once, twice, "sample: {sample:?}");
            assert!(once.chars().count() <= MAX_ERROR_TEXT);
            assert!(once.chars().all(|c| is_allowed(c) || c == '_'));
        }
    }

    #[test]
    fn display_hides_report_payload() {
        let result = CommandResult::Passed(Report::text("r.log", "secret output"));
        let shown = result.to_string();
        assert_eq!(shown, "Passed report=r.log (13 bytes, text/plain)");
    }
}
