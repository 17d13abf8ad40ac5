//! Authentication strategies for the tunnel transport.
//!
//! Authentication starts with a `none` request. A server that accepts it
//! authenticates the session without credentials; otherwise its answer
//! lists the methods it will take. The configured [`AuthType`] selects one
//! strategy, which only runs if the server advertises its method.
//!
//! # Available Strategies
//!
//! - [`PasswordAuth`]: Password-based authentication
//! - [`KeyAuth`]: Private key file authentication

mod key;
mod password;
mod traits;

pub use key::KeyAuth;
pub use password::PasswordAuth;
pub use traits::AuthStrategy;

use russh::client::{self, AuthResult};
use russh::MethodKind;
use tracing::{debug, info};

use crate::tunnel::config::{AuthType, Config};
use crate::tunnel::error::{Result, TunnelError};
use crate::tunnel::handler::SshClientHandler;

/// Build the strategy for the configured auth type.
///
/// `None` has no strategy: it only works through the `none` request.
pub(crate) fn strategy_for(config: &Config) -> Result<Option<Box<dyn AuthStrategy>>> {
    match config.auth_type {
        AuthType::None => Ok(None),
        AuthType::Password => {
            let password = config.password.as_deref().ok_or_else(|| {
                TunnelError::InvalidConfig("password authentication requires a password".into())
            })?;
            Ok(Some(Box::new(PasswordAuth::new(password))))
        }
        AuthType::PublicKey => {
            let path = config.private_key_path.as_ref().ok_or_else(|| {
                TunnelError::InvalidConfig(
                    "public-key authentication requires a private key path".into(),
                )
            })?;
            let mut auth = KeyAuth::new(path);
            if let Some(public) = &config.public_key_path {
                auth = auth.with_public_key(public);
            }
            if let Some(passphrase) = &config.passphrase {
                auth = auth.with_passphrase(passphrase);
            }
            Ok(Some(Box::new(auth)))
        }
    }
}

pub(crate) fn format_method_list(methods: &[MethodKind]) -> String {
    if methods.is_empty() {
        return "none".to_string();
    }
    methods
        .iter()
        .map(|method| {
            let label: &'static str = method.into();
            label
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Authenticate `handle` as configured.
///
/// Returns the name of the method that succeeded.
pub(crate) async fn authenticate(
    handle: &mut client::Handle<SshClientHandler>,
    config: &Config,
) -> Result<&'static str> {
    let username = config.username.as_str();

    let offered: Vec<MethodKind> = match handle.authenticate_none(username).await? {
        AuthResult::Success => {
            info!("Server accepted 'none' authentication for user '{}'", username);
            return Ok("none");
        }
        AuthResult::Failure {
            remaining_methods, ..
        } => remaining_methods.iter().copied().collect(),
    };
    let offered_list = format_method_list(&offered);
    debug!("Authentication methods supported by server: {}", offered_list);

    let Some(strategy) = strategy_for(config)?.filter(|s| offered.contains(&s.method())) else {
        return Err(TunnelError::NoSupportedAuthMethod {
            offered: offered_list,
        });
    };

    debug!("Authenticating by {}", strategy.name());
    if strategy.authenticate(handle, username).await? {
        info!("Authentication by {} succeeded", strategy.name());
        Ok(strategy.name())
    } else {
        Err(TunnelError::AuthenticationFailed {
            method: strategy.name(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        Config::new("bastion", "deploy", "db", 27017)
    }

    mod strategy_selection {
        use super::*;

        #[test]
        fn test_none_has_no_strategy() {
            assert!(strategy_for(&base()).unwrap().is_none());
        }

        #[test]
        fn test_password_strategy() {
            let strategy = strategy_for(&base().password("secret")).unwrap().unwrap();
            assert_eq!(strategy.name(), "password");
            assert_eq!(strategy.method(), MethodKind::Password);
        }

        #[test]
        fn test_public_key_strategy() {
            let config = base()
                .private_key("/keys/id_ed25519")
                .public_key("/keys/id_ed25519.pub")
                .passphrase("secret");
            let strategy = strategy_for(&config).unwrap().unwrap();
            assert_eq!(strategy.name(), "public key");
            assert_eq!(strategy.method(), MethodKind::PublicKey);
        }

        #[test]
        fn test_password_without_value_is_config_error() {
            let config = base().auth_type(AuthType::Password);
            assert!(matches!(strategy_for(&config), Err(TunnelError::InvalidConfig(_))));
        }

        #[test]
        fn test_public_key_without_path_is_config_error() {
            let config = base().auth_type(AuthType::PublicKey);
            assert!(matches!(strategy_for(&config), Err(TunnelError::InvalidConfig(_))));
        }
    }

    mod method_list {
        use super::*;

        #[test]
        fn test_empty_list() {
            assert_eq!(format_method_list(&[]), "none");
        }

        #[test]
        fn test_joined_list() {
            let list = format_method_list(&[MethodKind::Password, MethodKind::PublicKey]);
            assert_eq!(list, "password, publickey");
        }
    }
}
