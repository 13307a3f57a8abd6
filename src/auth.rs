//! OAuth2 authentication for the Gmail API

use google_gmail1::{hyper_rustls, hyper_util, yup_oauth2, Gmail};
use std::env;
use std::path::Path;
use tracing::{debug, info};
use yup_oauth2::ApplicationSecret;

use crate::error::{GmailError, Result};

/// Read/write access without permanent deletion, plus label management
pub const REQUIRED_SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/gmail.modify",
    "https://www.googleapis.com/auth/gmail.labels",
];

pub const MODIFY_SCOPE: &str = "https://www.googleapis.com/auth/gmail.modify";
pub const LABELS_SCOPE: &str = "https://www.googleapis.com/auth/gmail.labels";

pub const CLIENT_ID_ENV: &str = "GMAIL_CLIENT_ID";
pub const CLIENT_SECRET_ENV: &str = "GMAIL_CLIENT_SECRET";
pub const REDIRECT_URI_ENV: &str = "GMAIL_REDIRECT_URI";

pub type GmailHub =
    Gmail<hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>>;

/// Initialize the Gmail hub, running the installed-app flow if no cached
/// token exists. `force` discards the cached token first.
pub async fn initialize_gmail_hub(
    credentials_path: &Path,
    token_cache_path: &Path,
    force: bool,
) -> Result<GmailHub> {
    let secret = application_secret(credentials_path).await?;

    if force && token_cache_path.exists() {
        info!("Discarding cached token at {:?}", token_cache_path);
        tokio::fs::remove_file(token_cache_path).await?;
    }
    if let Some(parent) = token_cache_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let auth = yup_oauth2::InstalledFlowAuthenticator::builder(
        secret,
        yup_oauth2::InstalledFlowReturnMethod::HTTPRedirect,
    )
    .persist_tokens_to_disk(token_cache_path)
    .build()
    .await
    .map_err(|e| GmailError::AuthError(format!("Failed to build authenticator: {}", e)))?;

    // Request every scope up front so the cached token covers all calls
    auth.token(REQUIRED_SCOPES)
        .await
        .map_err(|e| GmailError::AuthError(format!("Failed to obtain token: {}", e)))?;

    if token_cache_path.exists() {
        secure_token_file(token_cache_path).await?;
    }
    debug!("OAuth token ready");

    let client = hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new())
        .build(
            hyper_rustls::HttpsConnectorBuilder::new()
                .with_native_roots()
                .map_err(|e| GmailError::AuthError(format!("Failed to load TLS roots: {}", e)))?
                .https_or_http()
                .enable_http1()
                .build(),
        );

    Ok(Gmail::new(client, auth))
}

/// OAuth client secret from the credentials file, or from the environment
/// when the file does not exist
pub async fn application_secret(credentials_path: &Path) -> Result<ApplicationSecret> {
    if credentials_path.exists() {
        return yup_oauth2::read_application_secret(credentials_path)
            .await
            .map_err(|e| GmailError::AuthError(format!("Failed to read credentials: {}", e)));
    }
    debug!(
        "No credentials file at {:?}, trying {} / {}",
        credentials_path, CLIENT_ID_ENV, CLIENT_SECRET_ENV
    );
    load_credentials_from_env().map_err(|_| {
        GmailError::AuthError(format!(
            "No credentials at {:?} and {} / {} not set",
            credentials_path, CLIENT_ID_ENV, CLIENT_SECRET_ENV
        ))
    })
}

pub fn load_credentials_from_env() -> Result<ApplicationSecret> {
    let client_id = env::var(CLIENT_ID_ENV)
        .map_err(|_| GmailError::ConfigError(format!("{} not set", CLIENT_ID_ENV)))?;
    let client_secret = env::var(CLIENT_SECRET_ENV)
        .map_err(|_| GmailError::ConfigError(format!("{} not set", CLIENT_SECRET_ENV)))?;
    let redirect_uri =
        env::var(REDIRECT_URI_ENV).unwrap_or_else(|_| "http://localhost:8080".to_string());

    Ok(ApplicationSecret {
        client_id,
        client_secret,
        auth_uri: "https://accounts.google.com/o/oauth2/auth".to_string(),
        token_uri: "https://oauth2.googleapis.com/token".to_string(),
        redirect_uris: vec![redirect_uri],
        ..Default::default()
    })
}

/// Restrict the token cache to the owner (0600)
#[cfg(unix)]
pub async fn secure_token_file(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut perms = tokio::fs::metadata(path).await?.permissions();
    perms.set_mode(0o600);
    tokio::fs::set_permissions(path, perms).await?;
    Ok(())
}

#[cfg(windows)]
pub async fn secure_token_file(_path: &Path) -> Result<()> {
    Ok(())
}
