pub mod providers;
pub mod token;

pub use providers::{ClientCredentials, RefreshToken, StaticKey};
pub use token::{
    AuthError, CredentialSource, Credentials, RefresherSettings, TokenRefresher, TokenState,
};
