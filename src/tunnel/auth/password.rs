//! Password-based SSH authentication.

use async_trait::async_trait;
use russh::{MethodKind, client};

use crate::tunnel::error::Result;
use crate::tunnel::handler::SshClientHandler;

use super::traits::AuthStrategy;

/// Password authentication strategy.
pub struct PasswordAuth {
    password: String,
}

impl PasswordAuth {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
        }
    }
}

#[async_trait]
impl AuthStrategy for PasswordAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool> {
        let result = handle
            .authenticate_password(username, &self.password)
            .await?;

        Ok(result.success())
    }

    fn name(&self) -> &'static str {
        "password"
    }

    fn method(&self) -> MethodKind {
        MethodKind::Password
    }
}
