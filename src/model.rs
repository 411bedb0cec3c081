// User record shared by the relational tables and the document store

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub username: String,
    pub email: String,
    pub age: Option<i32>,
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<NaiveDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<NaiveDateTime>,
}

impl User {
    /// Build an unsaved user (no id, no timestamps)
    pub fn new(username: impl Into<String>, email: impl Into<String>, age: i32, city: impl Into<String>) -> Self {
        Self {
            id: None,
            username: username.into(),
            email: email.into(),
            age: Some(age),
            city: Some(city.into()),
            created_at: None,
            updated_at: None,
        }
    }
}

impl std::fmt::Display for User {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "User({}, {})", self.username, self.email)?;
        if let Some(id) = self.id {
            write!(f, " #{}", id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_user_is_unsaved() {
        let user = User::new("jdoe", "john.doe@example.com", 30, "New York");
        assert_eq!(user.id, None);
        assert_eq!(user.age, Some(30));
        assert_eq!(user.city.as_deref(), Some("New York"));
        assert!(user.created_at.is_none());
    }

    #[test]
    fn test_serialization_skips_unsaved_fields() {
        let user = User::new("jsmith", "jane.smith@example.com", 25, "Los Angeles");
        let json = serde_json::to_value(&user).unwrap();
        assert!(json.get("id").is_none());
        assert!(json.get("created_at").is_none());
        assert_eq!(json["username"], "jsmith");

        let back: User = serde_json::from_value(json).unwrap();
        assert_eq!(back, user);
    }
}
