use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Body of `POST /auth/wx-login`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub code: String,
}

/// `data` of a successful login envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginData {
    pub token: String,
    #[serde(default)]
    pub user: Option<UserProfile>,
}

/// Account profile returned alongside the token
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UserProfile {
    /// Numeric or string id depending on backend version
    pub id: Option<Value>,
    pub user_name: Option<String>,
    pub avatar: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_login_data_with_user() {
        let data: LoginData = serde_json::from_value(json!({
            "token": "abc",
            "user": {"id": 12, "user_name": "lin", "email": null, "plant_form": "cactus"}
        }))
        .unwrap();

        assert_eq!(data.token, "abc");
        let user = data.user.unwrap();
        assert_eq!(user.id, Some(json!(12)));
        assert_eq!(user.user_name.as_deref(), Some("lin"));
        assert!(user.email.is_none());
    }

    #[test]
    fn test_login_data_requires_token() {
        let result: Result<LoginData, _> = serde_json::from_value(json!({"user": {}}));
        assert!(result.is_err());
    }
}
