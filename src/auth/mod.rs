use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("API key must be provided")]
    MissingApiKey,
    #[error("Location must be 'header', 'query', or 'cookie'")]
    InvalidLocation,
    #[error("Username must be provided")]
    MissingUsername,
    #[error("Password must be provided")]
    MissingPassword,
    #[error("Token URL must be provided")]
    MissingTokenUrl,
    #[error("Client ID must be provided")]
    MissingClientId,
    #[error("Client secret must be provided")]
    MissingClientSecret,
}

/// Authentication configuration attached to a provider, dispatched on the
/// `auth_type` tag when decoding provider documents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "auth_type", rename_all = "snake_case")]
pub enum Auth {
    ApiKey(ApiKeyAuth),
    Basic(BasicAuth),
    #[serde(rename = "oauth2")]
    OAuth2(OAuth2Auth),
}

impl Auth {
    pub fn validate(&self) -> Result<(), AuthError> {
        match self {
            Auth::ApiKey(auth) => auth.validate(),
            Auth::Basic(auth) => auth.validate(),
            Auth::OAuth2(auth) => auth.validate(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyAuth {
    pub api_key: String,
    /// Header / query-parameter / cookie name the key is injected under.
    #[serde(default = "ApiKeyAuth::default_var_name")]
    pub var_name: String,
    /// One of "header", "query", or "cookie".
    #[serde(default = "ApiKeyAuth::default_location")]
    pub location: String,
}

impl ApiKeyAuth {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            var_name: Self::default_var_name(),
            location: Self::default_location(),
        }
    }

    fn default_var_name() -> String {
        "X-Api-Key".to_string()
    }

    fn default_location() -> String {
        "header".to_string()
    }

    pub fn validate(&self) -> Result<(), AuthError> {
        if self.api_key.is_empty() {
            return Err(AuthError::MissingApiKey);
        }
        match self.location.to_ascii_lowercase().as_str() {
            "header" | "query" | "cookie" => Ok(()),
            _ => Err(AuthError::InvalidLocation),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

impl BasicAuth {
    pub fn new(username: String, password: String) -> Self {
        Self { username, password }
    }

    pub fn validate(&self) -> Result<(), AuthError> {
        if self.username.is_empty() {
            return Err(AuthError::MissingUsername);
        }
        if self.password.is_empty() {
            return Err(AuthError::MissingPassword);
        }
        Ok(())
    }
}

/// OAuth2 client-credentials configuration. Tokens fetched with these
/// credentials are cached per `client_id` inside the HTTP driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuth2Auth {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl OAuth2Auth {
    pub fn validate(&self) -> Result<(), AuthError> {
        if self.token_url.is_empty() {
            return Err(AuthError::MissingTokenUrl);
        }
        if self.client_id.is_empty() {
            return Err(AuthError::MissingClientId);
        }
        if self.client_secret.is_empty() {
            return Err(AuthError::MissingClientSecret);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn api_key_auth_validates_location() {
        let mut auth = ApiKeyAuth::new("secret".to_string());
        assert!(auth.validate().is_ok());

        auth.location = "body".to_string();
        assert!(matches!(auth.validate(), Err(AuthError::InvalidLocation)));

        auth.location = "query".to_string();
        auth.api_key = String::new();
        assert!(matches!(auth.validate(), Err(AuthError::MissingApiKey)));
    }

    #[test]
    fn basic_auth_requires_both_fields() {
        let auth = BasicAuth::new("user".into(), String::new());
        assert!(matches!(auth.validate(), Err(AuthError::MissingPassword)));

        let auth = BasicAuth::new(String::new(), "pass".into());
        assert!(matches!(auth.validate(), Err(AuthError::MissingUsername)));
    }

    #[test]
    fn auth_decodes_from_tagged_json() {
        let auth: Auth = serde_json::from_value(json!({
            "auth_type": "api_key",
            "api_key": "k",
            "var_name": "X-Key",
            "location": "header"
        }))
        .unwrap();
        assert!(matches!(auth, Auth::ApiKey(_)));

        let auth: Auth = serde_json::from_value(json!({
            "auth_type": "oauth2",
            "token_url": "https://auth.example.com/token",
            "client_id": "id",
            "client_secret": "secret"
        }))
        .unwrap();
        match auth {
            Auth::OAuth2(o) => {
                assert_eq!(o.client_id, "id");
                assert!(o.scope.is_none());
            }
            other => panic!("expected oauth2, got {:?}", other),
        }
    }

    #[test]
    fn oauth2_validation_reports_missing_fields() {
        let auth = OAuth2Auth {
            token_url: String::new(),
            client_id: "id".into(),
            client_secret: "s".into(),
            scope: None,
        };
        assert!(matches!(auth.validate(), Err(AuthError::MissingTokenUrl)));
    }
}
