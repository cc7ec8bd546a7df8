//! Permission registry and authorization checks (§4.A `IAM()`, §4.C
//! permission-check middleware stage). Session bookkeeping follows the
//! teacher's `auth::session::SessionManager` (`Arc<RwLock<HashMap<...>>>`),
//! swapping ATProto OAuth tokens for locally-issued JWTs via
//! `jsonwebtoken` — this host has no external identity provider to
//! delegate to.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use crate::descriptor::PermissionDecl;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub roles: Vec<String>,
    pub exp: u64,
}

/// `admin` carries every permission implicitly (§4.A), bypassing the
/// per-extension grant table entirely.
pub const ADMIN_ROLE: &str = "admin";

#[derive(Default)]
struct Grants {
    /// `(extension, permission_name)` -> roles allowed to exercise it.
    by_permission: HashMap<(String, String), BTreeSet<String>>,
}

pub struct Iam {
    jwt_encoding: EncodingKey,
    jwt_decoding: DecodingKey,
    grants: RwLock<Grants>,
}

impl Iam {
    pub fn new(jwt_secret: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            jwt_encoding: EncodingKey::from_secret(jwt_secret),
            jwt_decoding: DecodingKey::from_secret(jwt_secret),
            grants: RwLock::new(Grants::default()),
        })
    }

    /// Records the permission namespace an extension claimed at
    /// registration, plus which roles are allowed to use it. A fresh
    /// extension starts with no grantees beyond `admin`; an operator
    /// assigns roles out of band (config or an admin-only API, not
    /// modeled here).
    pub fn register_permissions(&self, extension: &str, perms: &[PermissionDecl]) {
        let mut grants = self.grants.write().expect("iam grants lock poisoned");
        for perm in perms {
            grants
                .by_permission
                .entry((extension.to_string(), perm.name.clone()))
                .or_default();
        }
    }

    pub fn grant_role(&self, extension: &str, permission: &str, role: &str) {
        let mut grants = self.grants.write().expect("iam grants lock poisoned");
        grants
            .by_permission
            .entry((extension.to_string(), permission.to_string()))
            .or_default()
            .insert(role.to_string());
    }

    pub fn issue_token(&self, subject: &str, roles: Vec<String>, ttl_secs: u64) -> anyhow::Result<String> {
        let exp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
            + ttl_secs;
        let claims = Claims {
            sub: subject.to_string(),
            roles,
            exp,
        };
        Ok(encode(&Header::default(), &claims, &self.jwt_encoding)?)
    }

    pub fn verify_token(&self, token: &str) -> anyhow::Result<Claims> {
        let data = decode::<Claims>(token, &self.jwt_decoding, &Validation::default())?;
        Ok(data.claims)
    }

    /// `May(subject, extension, permission)`: true if any of the
    /// subject's roles is `admin` or is explicitly granted the named
    /// permission under that extension's namespace.
    pub fn may(&self, claims: &Claims, extension: &str, permission: &str) -> bool {
        if claims.roles.iter().any(|r| r == ADMIN_ROLE) {
            return true;
        }
        let grants = self.grants.read().expect("iam grants lock poisoned");
        match grants
            .by_permission
            .get(&(extension.to_string(), permission.to_string()))
        {
            Some(allowed_roles) => claims.roles.iter().any(|r| allowed_roles.contains(r)),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn perm(name: &str) -> PermissionDecl {
        PermissionDecl {
            name: name.to_string(),
            description: String::new(),
            resource: "items".to_string(),
            actions: BTreeSet::from(["read".to_string()]),
        }
    }

    #[test]
    fn admin_bypasses_grant_table() {
        let iam = Iam::new(b"test-secret");
        iam.register_permissions("notes", &[perm("notes.read")]);
        let claims = Claims {
            sub: "root".into(),
            roles: vec![ADMIN_ROLE.to_string()],
            exp: u64::MAX,
        };
        assert!(iam.may(&claims, "notes", "notes.read"));
    }

    #[test]
    fn ungranted_role_is_denied() {
        let iam = Iam::new(b"test-secret");
        iam.register_permissions("notes", &[perm("notes.read")]);
        let claims = Claims {
            sub: "alice".into(),
            roles: vec!["viewer".to_string()],
            exp: u64::MAX,
        };
        assert!(!iam.may(&claims, "notes", "notes.read"));

        iam.grant_role("notes", "notes.read", "viewer");
        assert!(iam.may(&claims, "notes", "notes.read"));
    }

    #[test]
    fn token_round_trips() {
        let iam = Iam::new(b"test-secret");
        let token = iam
            .issue_token("alice", vec!["viewer".to_string()], 3600)
            .unwrap();
        let claims = iam.verify_token(&token).unwrap();
        assert_eq!(claims.sub, "alice");
        assert_eq!(claims.roles, vec!["viewer".to_string()]);
    }
}
