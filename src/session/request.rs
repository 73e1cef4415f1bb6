//! Parsing of the untrusted forced-command string into an authorization
//! request.
//!
//! The daemon hands us whatever the client asked to execute, verbatim, via
//! `SSH_ORIGINAL_COMMAND`.  Only the exact shape
//! `git-<upload|receive>-<pack|archive> '<owner>/<repo>'` is accepted; any
//! deviation is a total rejection — there is no partial or best-effort parse
//! of a string that ends up driving process execution.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

// ---------------------------------------------------------------------------
// Grammars
// ---------------------------------------------------------------------------

static OPERATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^git-(upload|receive)-(pack|archive)$").unwrap());

/// Single-quoted `owner/repo` path token: optional leading slash, both
/// segments restricted to word characters plus `+`, `-`, `.`; the repo
/// segment may be empty.
static PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^'/?(\w[\w+.-]*)/(\w[\w+.-]*)?'$").unwrap());

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

/// Whether the requested operation only reads repository state or mutates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Read,
    Write,
}

/// The identity a directive line bound to this session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    /// Username from the matched credential record.
    pub name: String,
    /// Fingerprint of the key that authenticated, proving which record
    /// authorized the session.
    pub key: String,
}

/// One authorization request, constructed fresh per connection and discarded
/// after the policy returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthRequest {
    pub action: Action,
    pub repo: String,
    pub user: Identity,
}

/// A successfully parsed transport command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitCommand {
    /// The validated operation name, e.g. `git-upload-pack`.  Doubles as the
    /// executable the dispatcher spawns.
    pub program: String,
    pub action: Action,
    /// `owner/repo` with quotes and any leading slash stripped.
    pub repo: String,
}

impl GitCommand {
    /// Build the request handed to the policy gateway.
    pub fn auth_request(&self, username: &str, fingerprint: &str) -> AuthRequest {
        AuthRequest {
            action: self.action,
            repo: self.repo.clone(),
            user: Identity {
                name: username.to_string(),
                key: fingerprint.to_string(),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Parse a raw forced-command string, or reject it with `None`.
///
/// The string is split on single spaces: the first token must match the
/// operation grammar, the second the quoted path grammar.  Tokens past the
/// second are ignored.
pub fn parse_command(raw: &str) -> Option<GitCommand> {
    let mut tokens = raw.split(' ');
    let program = tokens.next()?;
    let path = tokens.next()?;

    if !OPERATION_RE.is_match(program) {
        return None;
    }
    let captures = PATH_RE.captures(path)?;

    let owner = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
    let repo_name = captures.get(2).map(|m| m.as_str()).unwrap_or_default();

    let action = if program.contains("upload") {
        Action::Read
    } else {
        Action::Write
    };

    Some(GitCommand {
        program: program.to_string(),
        action,
        repo: format!("{owner}/{repo_name}"),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_pack_is_a_read() {
        let cmd = parse_command("git-upload-pack 'alice/repo'").unwrap();
        assert_eq!(cmd.program, "git-upload-pack");
        assert_eq!(cmd.action, Action::Read);
        assert_eq!(cmd.repo, "alice/repo");
    }

    #[test]
    fn receive_pack_is_a_write() {
        let cmd = parse_command("git-receive-pack 'alice/repo'").unwrap();
        assert_eq!(cmd.action, Action::Write);
        assert_eq!(cmd.repo, "alice/repo");
    }

    #[test]
    fn archive_operations_parse() {
        assert_eq!(
            parse_command("git-upload-archive 'a/b'").unwrap().action,
            Action::Read
        );
        assert_eq!(
            parse_command("git-receive-archive 'a/b'").unwrap().action,
            Action::Write
        );
    }

    #[test]
    fn leading_slash_is_stripped() {
        let cmd = parse_command("git-upload-pack '/alice/repo.git'").unwrap();
        assert_eq!(cmd.repo, "alice/repo.git");
    }

    #[test]
    fn empty_repo_segment_keeps_trailing_slash() {
        let cmd = parse_command("git-upload-pack 'alice/'").unwrap();
        assert_eq!(cmd.repo, "alice/");
    }

    #[test]
    fn arbitrary_commands_are_rejected() {
        assert!(parse_command("rm -rf /").is_none());
        assert!(parse_command("git-upload-pack 'a/b'; rm -rf /").is_none());
        assert!(parse_command("scp -f file").is_none());
    }

    #[test]
    fn missing_quotes_are_rejected() {
        assert!(parse_command("git-upload-pack alice/repo").is_none());
    }

    #[test]
    fn path_traversal_is_rejected() {
        assert!(parse_command("git-upload-pack '../../etc/passwd'").is_none());
        assert!(parse_command("git-upload-pack 'alice/../bob'").is_none());
    }

    #[test]
    fn absent_argument_is_rejected() {
        assert!(parse_command("git-upload-pack").is_none());
        assert!(parse_command("").is_none());
    }

    #[test]
    fn double_space_is_rejected() {
        // Splitting on single spaces makes the second token empty.
        assert!(parse_command("git-upload-pack  'alice/repo'").is_none());
    }

    #[test]
    fn operation_name_is_case_sensitive() {
        assert!(parse_command("GIT-UPLOAD-PACK 'alice/repo'").is_none());
    }

    #[test]
    fn tokens_past_the_second_are_ignored() {
        let cmd = parse_command("git-upload-pack 'alice/repo' extra").unwrap();
        assert_eq!(cmd.repo, "alice/repo");
    }

    #[test]
    fn auth_request_serializes_per_policy_contract() {
        let cmd = parse_command("git-receive-pack 'alice/repo'").unwrap();
        let request = cmd.auth_request("alice", "00ff");
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "action": "write",
                "repo": "alice/repo",
                "user": { "name": "alice", "key": "00ff" }
            })
        );
    }
}
