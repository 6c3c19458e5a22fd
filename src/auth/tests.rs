//! Auth module tests

use argon2::password_hash::{PasswordHasher, SaltString};

use super::*;
use crate::config::{AuthConfig, UserConfig};

fn make_auth_config(enabled: bool, allow_anonymous: bool, users: Vec<UserConfig>) -> AuthConfig {
    AuthConfig {
        enabled,
        allow_anonymous,
        users,
    }
}

fn make_user_plaintext(username: &str, password: &str, role: Option<&str>) -> UserConfig {
    UserConfig {
        username: username.to_string(),
        password: Some(password.to_string()),
        password_hash: None,
        role: role.map(|s| s.to_string()),
    }
}

fn make_user_hashed(username: &str, password_hash: &str, role: Option<&str>) -> UserConfig {
    UserConfig {
        username: username.to_string(),
        password: None,
        password_hash: Some(password_hash.to_string()),
        role: role.map(|s| s.to_string()),
    }
}

fn hash_password(password: &str) -> String {
    let salt = SaltString::encode_b64(b"tidemq-test-salt").unwrap();
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .unwrap()
        .to_string()
}

#[tokio::test]
async fn test_auth_disabled_allows_all() {
    let config = make_auth_config(false, false, vec![]);
    let provider = AuthProvider::new(&config);

    let auth = provider
        .authenticate(Some("user"), Some(b"pass"))
        .await
        .unwrap();
    assert_eq!(auth.username.as_deref(), Some("user"));
}

#[tokio::test]
async fn test_auth_enabled_rejects_unknown_user() {
    let config = make_auth_config(
        true,
        false,
        vec![make_user_plaintext("admin", "secret", None)],
    );
    let provider = AuthProvider::new(&config);

    let result = provider.authenticate(Some("unknown"), Some(b"pass")).await;
    assert_eq!(result, Err(AuthError::BadCredentials));
}

#[tokio::test]
async fn test_auth_enabled_accepts_valid_credentials() {
    let config = make_auth_config(
        true,
        false,
        vec![make_user_plaintext("admin", "secret", Some("admin_role"))],
    );
    let provider = AuthProvider::new(&config);

    let auth = provider
        .authenticate(Some("admin"), Some(b"secret"))
        .await
        .unwrap();
    assert_eq!(auth.username.as_deref(), Some("admin"));
    assert_eq!(auth.role.as_deref(), Some("admin_role"));
}

#[tokio::test]
async fn test_auth_enabled_rejects_wrong_password() {
    let config = make_auth_config(
        true,
        false,
        vec![make_user_plaintext("admin", "secret", None)],
    );
    let provider = AuthProvider::new(&config);

    let result = provider.authenticate(Some("admin"), Some(b"wrong")).await;
    assert_eq!(result, Err(AuthError::BadCredentials));

    let result = provider.authenticate(Some("admin"), None).await;
    assert_eq!(result, Err(AuthError::BadCredentials));
}

#[tokio::test]
async fn test_anonymous_allowed() {
    let config = make_auth_config(true, true, vec![]);
    let provider = AuthProvider::new(&config);

    let auth = provider.authenticate(None, None).await.unwrap();
    assert_eq!(auth, Authentication::anonymous());
}

#[tokio::test]
async fn test_anonymous_rejected() {
    let config = make_auth_config(true, false, vec![]);
    let provider = AuthProvider::new(&config);

    let result = provider.authenticate(None, None).await;
    assert_eq!(result, Err(AuthError::NotAuthorized));
}

#[test]
fn test_get_user_role() {
    let config = make_auth_config(
        true,
        false,
        vec![make_user_plaintext("admin", "secret", Some("admin_role"))],
    );
    let provider = AuthProvider::new(&config);

    assert!(provider.is_enabled());
    assert_eq!(provider.get_user_role("admin"), Some("admin_role"));
    assert_eq!(provider.get_user_role("unknown"), None);
}

#[tokio::test]
async fn test_password_hash_accepts_valid() {
    let hash = hash_password("secret");
    let config = make_auth_config(true, false, vec![make_user_hashed("admin", &hash, None)]);
    let provider = AuthProvider::new(&config);

    assert!(provider
        .authenticate(Some("admin"), Some(b"secret"))
        .await
        .is_ok());
}

#[tokio::test]
async fn test_password_hash_rejects_wrong_password() {
    let hash = hash_password("secret");
    let config = make_auth_config(true, false, vec![make_user_hashed("admin", &hash, None)]);
    let provider = AuthProvider::new(&config);

    let result = provider.authenticate(Some("admin"), Some(b"wrong")).await;
    assert_eq!(result, Err(AuthError::BadCredentials));
}

#[tokio::test]
async fn test_unparsable_hash_is_backend_error() {
    let config = make_auth_config(
        true,
        false,
        vec![make_user_hashed("admin", "$argon2id$garbage", None)],
    );
    let provider = AuthProvider::new(&config);

    let result = provider.authenticate(Some("admin"), Some(b"secret")).await;
    assert!(matches!(result, Err(AuthError::Backend(_))));
}

#[tokio::test]
async fn test_mixed_auth_methods() {
    let hash = hash_password("hashedpass");
    let config = make_auth_config(
        true,
        false,
        vec![
            make_user_plaintext("plain_user", "plainpass", None),
            make_user_hashed("hash_user", &hash, None),
        ],
    );
    let provider = AuthProvider::new(&config);

    assert!(provider
        .authenticate(Some("plain_user"), Some(b"plainpass"))
        .await
        .is_ok());
    assert!(provider
        .authenticate(Some("hash_user"), Some(b"hashedpass"))
        .await
        .is_ok());
}
