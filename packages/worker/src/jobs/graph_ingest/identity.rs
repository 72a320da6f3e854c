//! Resolution of loosely-typed Graph identity objects against the local
//! user table.
//!
//! Graph attaches `identitySet`-shaped objects (owner, createdBy,
//! lastModifiedBy, permission grantees) whose shape varies by API and by
//! principal kind. The resolver classifies the principal and, for users,
//! maps it onto the local `msgraph_users` row by id or by email/UPN.

use std::collections::HashMap;

use anyhow::Result;
use serde_json::Value;
use sqlx::PgPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrincipalType {
    User,
    Group,
    Application,
    SharePoint,
    System,
    Unknown,
}

impl PrincipalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrincipalType::User => "user",
            PrincipalType::Group => "group",
            PrincipalType::Application => "application",
            PrincipalType::SharePoint => "sharepoint",
            PrincipalType::System => "system",
            PrincipalType::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedIdentity {
    pub user_fk: Option<String>,
    pub principal_type: PrincipalType,
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub external_id: Option<String>,
}

impl ResolvedIdentity {
    fn unknown() -> Self {
        Self {
            user_fk: None,
            principal_type: PrincipalType::Unknown,
            display_name: None,
            email: None,
            external_id: None,
        }
    }
}

/// Non-deleted users indexed by Graph id and by lowercased mail/UPN.
#[derive(Debug, Default)]
pub struct UserMaps {
    by_id: HashMap<String, String>,
    by_email: HashMap<String, String>,
}

impl UserMaps {
    pub async fn load(pool: &PgPool) -> Result<Self> {
        let rows: Vec<(String, Option<String>, Option<String>)> = sqlx::query_as(
            r#"
            SELECT id, mail, user_principal_name
            FROM msgraph_users
            WHERE deleted_at IS NULL
            "#,
        )
        .fetch_all(pool)
        .await?;

        Ok(Self::from_rows(rows))
    }

    pub fn from_rows(rows: Vec<(String, Option<String>, Option<String>)>) -> Self {
        let mut maps = Self::default();
        for (user_id, mail, upn) in rows {
            if user_id.is_empty() {
                continue;
            }
            maps.by_id.insert(user_id.clone(), user_id.clone());
            if let Some(mail) = mail.filter(|m| !m.is_empty()) {
                maps.by_email.insert(mail.to_lowercase(), user_id.clone());
            }
            if let Some(upn) = upn.filter(|u| !u.is_empty()) {
                maps.by_email.insert(upn.to_lowercase(), user_id.clone());
            }
        }
        maps
    }

    pub fn user_fk(&self, graph_id: Option<&str>, email_like: Option<&str>) -> Option<String> {
        if let Some(gid) = graph_id {
            if let Some(fk) = self.by_id.get(gid) {
                return Some(fk.clone());
            }
        }
        if let Some(email) = email_like {
            if let Some(fk) = self.by_email.get(&email.to_lowercase()) {
                return Some(fk.clone());
            }
        }
        None
    }
}

const SYSTEM_DISPLAY_NAMES: [&str; 5] = [
    "system account",
    "sharepoint app",
    "sharepoint",
    "microsoft office",
    "sharepoint migration tool",
];

fn looks_system(display: Option<&str>) -> bool {
    let Some(display) = display else {
        return false;
    };
    let d = display.trim().to_lowercase();
    if d.is_empty() {
        return false;
    }
    SYSTEM_DISPLAY_NAMES.contains(&d.as_str()) || d.contains("system")
}

fn str_field<'a>(obj: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|key| obj.get(*key).and_then(Value::as_str))
        .filter(|s| !s.is_empty())
}

/// Classify a directory identity and resolve its local user FK where the
/// principal is a user.
pub fn resolve_identity(identity: Option<&Value>, users: &UserMaps) -> ResolvedIdentity {
    let Some(identity) = identity.filter(|v| v.is_object()) else {
        return ResolvedIdentity::unknown();
    };

    for key in [
        "user",
        "group",
        "application",
        "siteGroup",
        "siteUser",
        "device",
        "site",
    ] {
        let Some(obj) = identity.get(key).filter(|v| v.is_object()) else {
            continue;
        };
        let display = str_field(obj, &["displayName", "name"]);
        let email = str_field(obj, &["email", "userPrincipalName"]);
        let graph_id = str_field(obj, &["id"]);

        return match key {
            "user" => {
                if looks_system(display) {
                    ResolvedIdentity {
                        user_fk: None,
                        principal_type: PrincipalType::System,
                        display_name: display.map(str::to_string),
                        email: None,
                        external_id: None,
                    }
                } else {
                    ResolvedIdentity {
                        user_fk: users.user_fk(graph_id, email),
                        principal_type: PrincipalType::User,
                        display_name: display.map(str::to_string),
                        email: email.map(str::to_string),
                        external_id: graph_id.map(str::to_string),
                    }
                }
            }
            "group" => ResolvedIdentity {
                user_fk: None,
                principal_type: PrincipalType::Group,
                display_name: display.map(str::to_string),
                email: None,
                external_id: graph_id.map(str::to_string),
            },
            "application" => ResolvedIdentity {
                user_fk: None,
                principal_type: PrincipalType::Application,
                display_name: display.map(str::to_string),
                email: None,
                external_id: graph_id.map(str::to_string),
            },
            _ => ResolvedIdentity {
                user_fk: None,
                principal_type: PrincipalType::SharePoint,
                display_name: display.map(str::to_string),
                email: None,
                external_id: graph_id.map(str::to_string),
            },
        };
    }

    if let Some(otype) = identity
        .get("@odata.type")
        .or_else(|| identity.get("odata.type"))
        .and_then(Value::as_str)
    {
        let display = str_field(identity, &["displayName", "name"]);
        let graph_id = str_field(identity, &["id"]);
        let email = str_field(identity, &["email", "userPrincipalName"]);

        if looks_system(display) && graph_id.is_none() && email.is_none() {
            return ResolvedIdentity {
                user_fk: None,
                principal_type: PrincipalType::System,
                display_name: display.map(str::to_string),
                email: None,
                external_id: None,
            };
        }
        if otype.contains("userIdentity") {
            return ResolvedIdentity {
                user_fk: users.user_fk(graph_id, email),
                principal_type: PrincipalType::User,
                display_name: display.map(str::to_string),
                email: email.map(str::to_string),
                external_id: graph_id.map(str::to_string),
            };
        }
        if otype.contains("groupIdentity") {
            return ResolvedIdentity {
                user_fk: None,
                principal_type: PrincipalType::Group,
                display_name: display.map(str::to_string),
                email: None,
                external_id: graph_id.map(str::to_string),
            };
        }
        if otype.contains("appIdentity") || otype.contains("application") {
            return ResolvedIdentity {
                user_fk: None,
                principal_type: PrincipalType::Application,
                display_name: display.map(str::to_string),
                email: None,
                external_id: graph_id.map(str::to_string),
            };
        }
        if otype.contains("sharepoint") || otype.contains("site") || otype.contains("deviceIdentity")
        {
            return ResolvedIdentity {
                user_fk: None,
                principal_type: PrincipalType::SharePoint,
                display_name: display.map(str::to_string),
                email: None,
                external_id: graph_id.map(str::to_string),
            };
        }
    }

    let display = str_field(identity, &["displayName"]);
    if looks_system(display) {
        return ResolvedIdentity {
            user_fk: None,
            principal_type: PrincipalType::System,
            display_name: display.map(str::to_string),
            email: None,
            external_id: None,
        };
    }

    ResolvedIdentity {
        user_fk: None,
        principal_type: PrincipalType::Unknown,
        display_name: display.map(str::to_string),
        email: str_field(identity, &["email", "userPrincipalName"]).map(str::to_string),
        external_id: str_field(identity, &["id"]).map(str::to_string),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn maps() -> UserMaps {
        UserMaps::from_rows(vec![
            (
                "u1".to_string(),
                Some("Alice@Example.com".to_string()),
                Some("alice@corp.example.com".to_string()),
            ),
            ("u2".to_string(), None, Some("bob@corp.example.com".to_string())),
        ])
    }

    #[test]
    fn resolves_user_by_id() {
        let identity = json!({"user": {"id": "u1", "displayName": "Alice", "email": "x@y.z"}});
        let resolved = resolve_identity(Some(&identity), &maps());
        assert_eq!(resolved.principal_type, PrincipalType::User);
        assert_eq!(resolved.user_fk.as_deref(), Some("u1"));
        assert_eq!(resolved.external_id.as_deref(), Some("u1"));
    }

    #[test]
    fn resolves_user_by_email_case_insensitively() {
        let identity = json!({"user": {"displayName": "Alice", "email": "ALICE@example.COM"}});
        let resolved = resolve_identity(Some(&identity), &maps());
        assert_eq!(resolved.user_fk.as_deref(), Some("u1"));
    }

    #[test]
    fn system_display_names_short_circuit_user_resolution() {
        let identity = json!({"user": {"displayName": "SharePoint App", "id": "u1"}});
        let resolved = resolve_identity(Some(&identity), &maps());
        assert_eq!(resolved.principal_type, PrincipalType::System);
        assert!(resolved.user_fk.is_none());
    }

    #[test]
    fn group_and_application_sub_objects_select_type() {
        let group = json!({"group": {"id": "g1", "displayName": "Team"}});
        assert_eq!(
            resolve_identity(Some(&group), &maps()).principal_type,
            PrincipalType::Group
        );
        let app = json!({"application": {"id": "a1", "displayName": "Sync App"}});
        assert_eq!(
            resolve_identity(Some(&app), &maps()).principal_type,
            PrincipalType::Application
        );
        let site_user = json!({"siteUser": {"id": "5", "loginName": "x"}});
        assert_eq!(
            resolve_identity(Some(&site_user), &maps()).principal_type,
            PrincipalType::SharePoint
        );
    }

    #[test]
    fn odata_type_fallback_parses_identity_kind() {
        let identity = json!({
            "@odata.type": "#microsoft.graph.userIdentity",
            "id": "u2",
            "displayName": "Bob",
            "userPrincipalName": "bob@corp.example.com"
        });
        let resolved = resolve_identity(Some(&identity), &maps());
        assert_eq!(resolved.principal_type, PrincipalType::User);
        assert_eq!(resolved.user_fk.as_deref(), Some("u2"));
    }

    #[test]
    fn unknown_identity_preserves_raw_fields() {
        let identity = json!({"displayName": "Mystery", "id": "m1"});
        let resolved = resolve_identity(Some(&identity), &maps());
        assert_eq!(resolved.principal_type, PrincipalType::Unknown);
        assert_eq!(resolved.display_name.as_deref(), Some("Mystery"));
        assert_eq!(resolved.external_id.as_deref(), Some("m1"));
    }

    #[test]
    fn missing_identity_is_unknown() {
        let resolved = resolve_identity(None, &maps());
        assert_eq!(resolved.principal_type, PrincipalType::Unknown);
        assert!(resolved.user_fk.is_none());
    }
}
