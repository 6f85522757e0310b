/// The core sees an opaque credential verifier; account storage itself is
/// an external collaborator (spec §1).
pub trait CredentialVerifier: Send + Sync {
    fn verify(&self, login: &str, password: &str) -> bool;
}

impl CredentialVerifier for crate::config::Config {
    fn verify(&self, login: &str, password: &str) -> bool {
        crate::config::Config::verify(self, login, password)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub login: String,
    pub password: String,
}

/// The two shapes an auth prelude line may take, dispatched on before
/// verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthAttempt {
    /// `__test__:login:password` — a pre-login credential probe. Always
    /// answered and the link always closed; no session persists.
    Test(Credentials),
    /// `login:password` — starts a real session on success.
    Real(Credentials),
}

const TEST_DIALECT_PREFIX: &str = "__test__:";

/// Parses one line of the auth prelude (already UTF-8 decoded and trimmed of
/// surrounding whitespace). Returns `None` for any other shape; the caller
/// logs and closes the link.
pub fn parse_auth_line(line: &str) -> Option<AuthAttempt> {
    if let Some(rest) = line.strip_prefix(TEST_DIALECT_PREFIX) {
        let (login, password) = rest.split_once(':')?;
        return Some(AuthAttempt::Test(Credentials {
            login: login.to_string(),
            password: password.to_string(),
        }));
    }
    let (login, password) = line.split_once(':')?;
    Some(AuthAttempt::Real(Credentials { login: login.to_string(), password: password.to_string() }))
}
