use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dispatch::poller::Task;
use crate::error::AgentError;
use crate::normalize::NormalizedResult;

/// Diffs beyond this size are cut before being embedded in a prompt.
pub const MAX_DIFF_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReviewCommand {
    #[serde(rename = "/review")]
    Review,
    #[serde(rename = "/gemini-review")]
    GeminiReview,
    #[serde(rename = "/korbit-review")]
    KorbitReview,
    #[serde(rename = "/improve")]
    Improve,
}

impl ReviewCommand {
    pub const ALL: [ReviewCommand; 4] = [
        Self::Review,
        Self::GeminiReview,
        Self::KorbitReview,
        Self::Improve,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Review => "/review",
            Self::GeminiReview => "/gemini-review",
            Self::KorbitReview => "/korbit-review",
            Self::Improve => "/improve",
        }
    }

    /// What the reviewer is asked to focus on.
    pub fn instructions(self) -> &'static str {
        match self {
            Self::Review => {
                "Review this pull request. Point out bugs, edge cases, security issues \
                 and deviations from the surrounding code's conventions."
            }
            Self::GeminiReview => {
                "Perform a thorough second-opinion review of this pull request. Focus on \
                 correctness and on anything a first reviewer is likely to miss."
            }
            Self::KorbitReview => {
                "Review this pull request for maintainability. Flag duplicated logic, \
                 unclear naming, missing tests and risky error handling."
            }
            Self::Improve => {
                "Suggest concrete improvements to the code changed in this pull request. \
                 Each suggestion should name the file and line and show the better version."
            }
        }
    }

    fn expected() -> String {
        Self::ALL
            .iter()
            .map(|c| c.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for ReviewCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReviewCommand {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s.trim())
            .ok_or_else(|| AgentError::InvalidReviewCommand {
                command: s.to_string(),
                expected: Self::expected(),
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReviewRequest {
    pub repo_owner: String,
    pub repo_name: String,
    pub pr_number: u64,
    pub command: ReviewCommand,
}

impl ReviewRequest {
    /// `owner/name`
    pub fn repo(&self) -> String {
        format!("{}/{}", self.repo_owner, self.repo_name)
    }

    pub fn build_prompt(&self, diff: Option<&str>) -> String {
        let mut prompt = format!(
            "{}\n\nRepository: {}\nPull request: #{}\nCommand: {}\n",
            self.command.instructions(),
            self.repo(),
            self.pr_number,
            self.command,
        );

        match diff {
            Some(diff) if !diff.trim().is_empty() => {
                let (shown, cut) = truncate_at_char_boundary(diff, MAX_DIFF_BYTES);
                prompt.push_str("\nDiff:\n```diff\n");
                prompt.push_str(shown);
                if !shown.ends_with('\n') {
                    prompt.push('\n');
                }
                prompt.push_str("```\n");
                if cut {
                    prompt.push_str("(diff truncated)\n");
                }
            }
            _ => {
                prompt.push_str("\nThe diff is not attached; fetch the pull request yourself.\n");
            }
        }

        prompt.push_str(
            "\nRespond with JSON only, in this shape:\n\
             {\"summary\": \"...\", \"comments\": [{\"path\": \"src/file.rs\", \"line\": 12, \"body\": \"...\"}]}\n\
             Use an empty comments array when there is nothing to report.\n",
        );
        prompt
    }
}

fn truncate_at_char_boundary(s: &str, max: usize) -> (&str, bool) {
    if s.len() <= max {
        return (s, false);
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    (&s[..end], true)
}

/// One comment to post on a pull request. Without `path` and `line` it is a
/// general conversation comment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewComment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u64>,
    pub body: String,
}

impl ReviewComment {
    pub fn general(body: impl Into<String>) -> Self {
        Self {
            path: None,
            line: None,
            body: body.into(),
        }
    }

    pub fn inline(path: impl Into<String>, line: u64, body: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            line: Some(line),
            body: body.into(),
        }
    }

    /// Anchored to a file line rather than the PR conversation. Lines are
    /// 1-based, so line 0 never anchors.
    pub fn is_inline(&self) -> bool {
        self.path.as_deref().is_some_and(|p| !p.is_empty()) && self.line.is_some_and(|l| l > 0)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewOutcome {
    pub request: ReviewRequest,
    pub task: Task,
    /// Present when the task completed.
    pub result: Option<NormalizedResult>,
    pub comments: Vec<ReviewComment>,
}

/// Map a normalized review result to comments, in the order the reviewer
/// produced them. A summary, if any, comes first.
pub fn comments_from_result(result: &NormalizedResult) -> Vec<ReviewComment> {
    if !result.success {
        let text = result.raw_text.trim();
        return if text.is_empty() {
            Vec::new()
        } else {
            vec![ReviewComment::general(text)]
        };
    }

    let mut comments = Vec::new();
    let items = match &result.data {
        Value::Array(items) => Some(items),
        Value::Object(map) => {
            if let Some(summary) = map.get("summary").and_then(Value::as_str)
                && !summary.trim().is_empty()
            {
                comments.push(ReviewComment::general(summary.trim()));
            }
            ["comments", "findings", "issues"]
                .iter()
                .find_map(|key| map.get(*key).and_then(Value::as_array))
        }
        _ => None,
    };

    comments.extend(items.into_iter().flatten().filter_map(comment_from_value));
    comments
}

fn comment_from_value(item: &Value) -> Option<ReviewComment> {
    if let Some(text) = item.as_str() {
        let text = text.trim();
        return (!text.is_empty()).then(|| ReviewComment::general(text));
    }

    let body = ["body", "comment", "message", "text"]
        .iter()
        .find_map(|key| item.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .filter(|b| !b.is_empty())?;
    let path = ["path", "file"]
        .iter()
        .find_map(|key| item.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string);
    let line = item
        .get("line")
        .and_then(|l| {
            l.as_u64()
                .or_else(|| l.as_str().and_then(|s| s.trim().parse().ok()))
        })
        .filter(|&l| l > 0);

    Some(ReviewComment {
        path,
        line,
        body: body.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize;

    fn request(command: ReviewCommand) -> ReviewRequest {
        ReviewRequest {
            repo_owner: "octo".into(),
            repo_name: "widgets".into(),
            pr_number: 7,
            command,
        }
    }

    #[test]
    fn parses_every_known_command() {
        for command in ReviewCommand::ALL {
            assert_eq!(command.as_str().parse::<ReviewCommand>().unwrap(), command);
        }
    }

    #[test]
    fn rejects_unknown_command() {
        let err = "/bogus".parse::<ReviewCommand>().unwrap_err();
        match err {
            AgentError::InvalidReviewCommand { command, expected } => {
                assert_eq!(command, "/bogus");
                assert!(expected.contains("/korbit-review"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!("review".parse::<ReviewCommand>().is_err());
    }

    #[test]
    fn command_serde_uses_slash_names() {
        let json = serde_json::to_string(&ReviewCommand::GeminiReview).unwrap();
        assert_eq!(json, "\"/gemini-review\"");
        let back: ReviewCommand = serde_json::from_str("\"/improve\"").unwrap();
        assert_eq!(back, ReviewCommand::Improve);
    }

    #[test]
    fn prompt_names_pr_and_embeds_diff() {
        let prompt = request(ReviewCommand::Review).build_prompt(Some("+fn main() {}"));
        assert!(prompt.contains("octo/widgets"));
        assert!(prompt.contains("#7"));
        assert!(prompt.contains("```diff\n+fn main() {}\n```"));
        assert!(prompt.contains("\"comments\""));
    }

    #[test]
    fn prompt_without_diff() {
        let prompt = request(ReviewCommand::Improve).build_prompt(None);
        assert!(prompt.contains("not attached"));
        assert!(!prompt.contains("```diff"));
    }

    #[test]
    fn long_diff_is_truncated_on_char_boundary() {
        let diff = "é".repeat(MAX_DIFF_BYTES);
        let prompt = request(ReviewCommand::Review).build_prompt(Some(&diff));
        assert!(prompt.contains("(diff truncated)"));
        assert!(prompt.len() < diff.len());
    }

    #[test]
    fn comments_keep_reviewer_order() {
        let raw = r#"{"summary": "Two issues.", "comments": [
            {"path": "src/a.rs", "line": 3, "body": "off by one"},
            {"file": "src/b.rs", "line": "10", "message": "unchecked unwrap"},
            "general remark",
            {"path": "src/c.rs"}
        ]}"#;
        let comments = comments_from_result(&normalize(raw));
        assert_eq!(
            comments,
            vec![
                ReviewComment::general("Two issues."),
                ReviewComment::inline("src/a.rs", 3, "off by one"),
                ReviewComment::inline("src/b.rs", 10, "unchecked unwrap"),
                ReviewComment::general("general remark"),
            ]
        );
    }

    #[test]
    fn top_level_array_of_comments() {
        let comments = comments_from_result(&normalize(r#"[{"body": "a"}, {"body": "b"}]"#));
        let bodies: Vec<_> = comments.iter().map(|c| c.body.as_str()).collect();
        assert_eq!(bodies, ["a", "b"]);
    }

    #[test]
    fn unparsed_text_becomes_single_comment() {
        let comments = comments_from_result(&normalize("  Looks good to me.  "));
        assert_eq!(comments, vec![ReviewComment::general("Looks good to me.")]);
        assert!(comments_from_result(&normalize("   ")).is_empty());
    }

    #[test]
    fn inline_requires_path_and_line() {
        assert!(ReviewComment::inline("a.rs", 1, "x").is_inline());
        assert!(!ReviewComment::general("x").is_inline());
        assert!(!ReviewComment::inline("a.rs", 0, "x").is_inline());
        assert!(!ReviewComment::inline("", 3, "x").is_inline());
    }

    #[test]
    fn zero_or_negative_line_becomes_general() {
        let result = normalize(
            r#"{"comments": [
                {"path": "a.rs", "line": 0, "body": "zero"},
                {"path": "b.rs", "line": "-4", "body": "negative"},
                {"path": "c.rs", "line": "12", "body": "ok"}
            ]}"#,
        );
        let comments = comments_from_result(&result);
        assert!(!comments[0].is_inline());
        assert_eq!(comments[0].line, None);
        assert!(!comments[1].is_inline());
        assert_eq!(comments[2], ReviewComment::inline("c.rs", 12, "ok"));
    }
}
