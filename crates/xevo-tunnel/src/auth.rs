//! User database and per-route authorization
//!
//! Users authenticate with name/password over the SSH layer. Each user
//! carries a set of compiled regular expressions; a route is allowed iff at
//! least one expression matches the route's textual form. Passwords are
//! compared by digest so the comparison cost does not depend on where the
//! candidate diverges.

use crate::error::{Result, TunnelError};
use parking_lot::RwLock;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Pattern granting access to every route
const ALLOW_ALL: &str = ".*";

/// One authenticated identity and its allowed routes
pub struct User {
    /// Login name
    pub name: String,
    /// Plaintext password as loaded from configuration
    pass: String,
    /// Compiled allow-list; empty means nothing is allowed
    allowed: Vec<Regex>,
}

impl User {
    /// Create a user with an explicit allow-list
    ///
    /// # Errors
    ///
    /// Returns a configuration error if any pattern fails to compile.
    pub fn new(name: impl Into<String>, pass: impl Into<String>, patterns: &[&str]) -> Result<Self> {
        let mut allowed = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            let re = Regex::new(pattern).map_err(|e| {
                TunnelError::config(format!("invalid address pattern '{pattern}': {e}"))
            })?;
            allowed.push(re);
        }
        Ok(Self {
            name: name.into(),
            pass: pass.into(),
            allowed,
        })
    }

    /// Create a user allowed to reach every route
    ///
    /// # Errors
    ///
    /// Never fails in practice; the sentinel pattern always compiles.
    pub fn allow_all(name: impl Into<String>, pass: impl Into<String>) -> Result<Self> {
        Self::new(name, pass, &[ALLOW_ALL])
    }

    /// Digest-based password check; cost is independent of the candidate
    #[must_use]
    pub fn verify_password(&self, candidate: &str) -> bool {
        Sha256::digest(self.pass.as_bytes()) == Sha256::digest(candidate.as_bytes())
    }

    /// True when at least one allow pattern matches the route text
    #[must_use]
    pub fn has_access(&self, route: &str) -> bool {
        self.allowed.iter().any(|re| re.is_match(route))
    }
}

impl fmt::Debug for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print the password.
        f.debug_struct("User")
            .field("name", &self.name)
            .field("patterns", &self.allowed.len())
            .finish()
    }
}

/// Read-mostly index of configured users
#[derive(Default)]
pub struct UserIndex {
    users: RwLock<HashMap<String, Arc<User>>>,
}

impl UserIndex {
    /// Create an empty index
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of configured users
    #[must_use]
    pub fn len(&self) -> usize {
        self.users.read().len()
    }

    /// True when no users are configured (authentication disabled)
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.users.read().is_empty()
    }

    /// Look up a user by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<User>> {
        self.users.read().get(name).cloned()
    }

    /// Insert or replace a user
    pub fn add(&self, user: User) {
        self.users.write().insert(user.name.clone(), Arc::new(user));
    }

    /// Remove a user by name
    pub fn remove(&self, name: &str) {
        self.users.write().remove(name);
    }

    /// Load users from a credentials file.
    ///
    /// One record per line: `name:password:addr-regex[,addr-regex...]`.
    /// Blank lines and lines starting with `#` are skipped.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the file cannot be read or any
    /// record is malformed; a bad credentials file aborts startup.
    pub fn load_file(&self, path: &Path) -> Result<()> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            TunnelError::config(format!("cannot read auth file {}: {e}", path.display()))
        })?;
        for (lineno, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let user = parse_auth_record(line).map_err(|e| {
                TunnelError::config(format!(
                    "{}:{}: {e}",
                    path.display(),
                    lineno + 1
                ))
            })?;
            self.add(user);
        }
        Ok(())
    }
}

/// Parse one `name:password:regex[,regex...]` record
fn parse_auth_record(line: &str) -> Result<User> {
    let (name, rest) = line
        .split_once(':')
        .ok_or_else(|| TunnelError::config("expected name:password:patterns"))?;
    let (pass, patterns) = rest
        .split_once(':')
        .ok_or_else(|| TunnelError::config("expected name:password:patterns"))?;
    if name.is_empty() {
        return Err(TunnelError::config("user name cannot be empty"));
    }
    let patterns: Vec<&str> = patterns.split(',').map(str::trim).collect();
    User::new(name, pass, &patterns)
}

/// Parse a `user:pass` flag value; the password may be empty
#[must_use]
pub fn parse_auth(auth: &str) -> (String, String) {
    match auth.split_once(':') {
        Some((user, pass)) => (user.to_string(), pass.to_string()),
        None => (auth.to_string(), String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_password() {
        let user = User::allow_all("alice", "secret").unwrap();
        assert!(user.verify_password("secret"));
        assert!(!user.verify_password("Secret"));
        assert!(!user.verify_password(""));
        assert!(!user.verify_password("secret "));
    }

    #[test]
    fn test_has_access() {
        let user = User::new("alice", "pw", &["^tcp:.*:9001$"]).unwrap();
        assert!(user.has_access("tcp:0.0.0.0:34002:tcp:127.0.0.1:9001"));
        assert!(!user.has_access("tcp:0.0.0.0:34002:tcp:127.0.0.1:9002"));

        let user = User::allow_all("bob", "pw").unwrap();
        assert!(user.has_access("R:tcp:0.0.0.0:2222:tcp:127.0.0.1:22"));
        assert!(user.has_access("socks"));
    }

    #[test]
    fn test_bad_pattern_rejected() {
        assert!(User::new("alice", "pw", &["["]).is_err());
    }

    #[test]
    fn test_index_lookup() {
        let index = UserIndex::new();
        assert!(index.is_empty());

        index.add(User::allow_all("alice", "pw").unwrap());
        assert_eq!(index.len(), 1);
        assert!(index.get("alice").is_some());
        assert!(index.get("bob").is_none());

        index.remove("alice");
        assert!(index.is_empty());
    }

    #[test]
    fn test_parse_auth_record() {
        let user = parse_auth_record("alice:pw:^tcp:.*:22$,^socks$").unwrap();
        assert_eq!(user.name, "alice");
        assert!(user.verify_password("pw"));
        assert!(user.has_access("socks"));

        assert!(parse_auth_record("alice").is_err());
        assert!(parse_auth_record("alice:pw").is_err());
        assert!(parse_auth_record(":pw:.*").is_err());
    }

    #[test]
    fn test_parse_auth_flag() {
        assert_eq!(
            parse_auth("alice:secret"),
            ("alice".to_string(), "secret".to_string())
        );
        assert_eq!(parse_auth("alice"), ("alice".to_string(), String::new()));
        // Password may itself contain colons.
        assert_eq!(
            parse_auth("alice:a:b"),
            ("alice".to_string(), "a:b".to_string())
        );
    }

    #[test]
    fn test_load_file() {
        let dir = std::env::temp_dir().join("xevo-tunnel-auth-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("users.txt");
        std::fs::write(
            &path,
            "# comment\n\nalice:pw:^tcp:.*:9001$\nbob:pw2:.*\n",
        )
        .unwrap();

        let index = UserIndex::new();
        index.load_file(&path).unwrap();
        assert_eq!(index.len(), 2);
        assert!(index.get("alice").unwrap().has_access("tcp:x:9001"));

        std::fs::write(&path, "broken-line\n").unwrap();
        let index = UserIndex::new();
        assert!(index.load_file(&path).is_err());

        std::fs::remove_dir_all(&dir).ok();
    }
}
