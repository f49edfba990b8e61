// Credential hand-off for realm authentication

use crate::{Error, Result};

/// A request for one piece of credential data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Callback {
    /// Asks for the user name
    Name { prompt: String, name: Option<String> },
    /// Asks for the password
    Password {
        prompt: String,
        password: Option<String>,
    },
    /// Any callback kind this handler does not understand
    Other(String),
}

impl Callback {
    pub fn name(prompt: impl Into<String>) -> Self {
        Callback::Name {
            prompt: prompt.into(),
            name: None,
        }
    }

    pub fn password(prompt: impl Into<String>) -> Self {
        Callback::Password {
            prompt: prompt.into(),
            password: None,
        }
    }
}

/// Answers name and password callbacks from values supplied up front.
#[derive(Clone)]
pub struct CredentialCallbackHandler {
    username: String,
    password: String,
}

impl std::fmt::Debug for CredentialCallbackHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCallbackHandler")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl CredentialCallbackHandler {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Fill in every callback. Fails on the first unsupported kind.
    pub fn handle(&self, callbacks: &mut [Callback]) -> Result<()> {
        for callback in callbacks.iter_mut() {
            match callback {
                Callback::Name { name, .. } => *name = Some(self.username.clone()),
                Callback::Password { password, .. } => *password = Some(self.password.clone()),
                Callback::Other(kind) => return Err(Error::UnsupportedCallback(kind.clone())),
            }
        }
        Ok(())
    }
}
