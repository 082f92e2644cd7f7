use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Permission {
    pub action: String,
}

impl Permission {
    pub fn new(action: impl Into<String>) -> Self {
        Permission {
            action: action.into(),
        }
    }
}

/// One platform account as the external service knows it.
///
/// Equality ignores the order of `permissions` and `teams`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DirectoryUser {
    pub id: i64,
    pub name: String,
    pub login: String,
    pub email: String,
    pub role: String,
    pub avatar_url: String,
    #[serde(default)]
    pub permissions: Vec<Permission>,
    #[serde(default)]
    pub teams: Vec<i64>,
}

impl PartialEq for DirectoryUser {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.name == other.name
            && self.login == other.login
            && self.email == other.email
            && self.role == other.role
            && self.avatar_url == other.avatar_url
            && unordered_eq(&self.permissions, &other.permissions)
            && unordered_eq(&self.teams, &other.teams)
    }
}

impl Eq for DirectoryUser {}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
    #[serde(rename = "team_id")]
    pub id: i64,
    pub name: String,
    pub email: String,
    pub avatar_url: String,
}

/// The account on whose behalf an inbound request is made.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallerIdentity {
    pub login: String,
}

/// Multiset comparison that does not depend on element order.
pub fn unordered_eq<T: Ord + Clone>(a: &[T], b: &[T]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut a = a.to_vec();
    let mut b = b.to_vec();
    a.sort_unstable();
    b.sort_unstable();
    a == b
}
