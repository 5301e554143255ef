//! Permission levels, grants, and the admission gate contract.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::document::Document;
use crate::error::SyncError;
use crate::now_secs;

/// Access level, totally ordered: `View < Edit < Admin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PermissionLevel {
    View,
    Edit,
    Admin,
}

impl PermissionLevel {
    pub fn can_view(self) -> bool {
        self >= PermissionLevel::View
    }

    pub fn can_edit(self) -> bool {
        self >= PermissionLevel::Edit
    }

    pub fn can_admin(self) -> bool {
        self >= PermissionLevel::Admin
    }
}

/// A grant of `level` on `document` to `user`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub id: Uuid,
    pub document: Uuid,
    pub user: Uuid,
    pub level: PermissionLevel,
    pub granted_by: Uuid,
    pub created_at: u64,
    pub updated_at: u64,
    pub expires_at: Option<u64>,
}

impl Permission {
    pub fn new(document: Uuid, user: Uuid, level: PermissionLevel, granted_by: Uuid) -> Self {
        let now = now_secs();
        Self {
            id: Uuid::new_v4(),
            document,
            user,
            level,
            granted_by,
            created_at: now,
            updated_at: now,
            expires_at: None,
        }
    }

    pub fn is_expired_at(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|at| now > at)
    }

    /// The level this grant confers at `now`; `None` once expired.
    pub fn effective_level(&self, now: u64) -> Option<PermissionLevel> {
        (!self.is_expired_at(now)).then_some(self.level)
    }

    pub fn set_expiration(&mut self, expires_at: Option<u64>) {
        self.expires_at = expires_at;
        self.updated_at = now_secs();
    }

    /// Raise the level. Rejects anything not strictly higher.
    pub fn upgrade(&mut self, level: PermissionLevel) -> Result<(), SyncError> {
        if level <= self.level {
            return Err(SyncError::invalid(format!(
                "cannot upgrade {:?} to {:?}",
                self.level, level
            )));
        }
        self.level = level;
        self.updated_at = now_secs();
        Ok(())
    }

    /// Lower the level. Rejects anything not strictly lower.
    pub fn downgrade(&mut self, level: PermissionLevel) -> Result<(), SyncError> {
        if level >= self.level {
            return Err(SyncError::invalid(format!(
                "cannot downgrade {:?} to {:?}",
                self.level, level
            )));
        }
        self.level = level;
        self.updated_at = now_secs();
        Ok(())
    }
}

/// Source of truth for access decisions.
///
/// `None` means no access. Implementations must report expired grants as
/// `None`. Callers consult the gate on every decision and never cache it.
pub trait PermissionGate: Send + Sync {
    fn check_level(&self, user: Uuid, document: Uuid) -> Option<PermissionLevel>;
}

/// Resolve what `user` may do on `doc`: the owner is always admin, a public
/// document can be viewed by anyone, everything else goes to the gate.
pub fn access_level(doc: &Document, user: Uuid, gate: &dyn PermissionGate) -> Option<PermissionLevel> {
    if doc.owner == user {
        return Some(PermissionLevel::Admin);
    }
    let granted = gate.check_level(user, doc.id);
    if doc.is_public {
        return Some(granted.map_or(PermissionLevel::View, |l| l.max(PermissionLevel::View)));
    }
    granted
}

/// In-process permission table.
#[derive(Debug, Default)]
pub struct PermissionTable {
    grants: RwLock<HashMap<(Uuid, Uuid), Permission>>,
}

impl PermissionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant (or replace) `user`'s permission on `document`.
    pub fn grant(&self, document: Uuid, user: Uuid, level: PermissionLevel, granted_by: Uuid) -> Permission {
        let permission = Permission::new(document, user, level, granted_by);
        self.insert(permission.clone());
        permission
    }

    pub fn insert(&self, permission: Permission) {
        let mut grants = self.grants.write().unwrap_or_else(|e| e.into_inner());
        grants.insert((permission.document, permission.user), permission);
    }

    pub fn revoke(&self, document: Uuid, user: Uuid) -> bool {
        let mut grants = self.grants.write().unwrap_or_else(|e| e.into_inner());
        grants.remove(&(document, user)).is_some()
    }

    pub fn get(&self, document: Uuid, user: Uuid) -> Option<Permission> {
        let grants = self.grants.read().unwrap_or_else(|e| e.into_inner());
        grants.get(&(document, user)).cloned()
    }

    pub fn upgrade(&self, document: Uuid, user: Uuid, level: PermissionLevel) -> Result<(), SyncError> {
        self.modify(document, user, |p| p.upgrade(level))
    }

    pub fn downgrade(&self, document: Uuid, user: Uuid, level: PermissionLevel) -> Result<(), SyncError> {
        self.modify(document, user, |p| p.downgrade(level))
    }

    pub fn set_expiration(&self, document: Uuid, user: Uuid, expires_at: Option<u64>) -> Result<(), SyncError> {
        self.modify(document, user, |p| {
            p.set_expiration(expires_at);
            Ok(())
        })
    }

    fn modify(
        &self,
        document: Uuid,
        user: Uuid,
        f: impl FnOnce(&mut Permission) -> Result<(), SyncError>,
    ) -> Result<(), SyncError> {
        let mut grants = self.grants.write().unwrap_or_else(|e| e.into_inner());
        let permission = grants
            .get_mut(&(document, user))
            .ok_or(SyncError::NotFound(document))?;
        f(permission)
    }
}

impl PermissionGate for PermissionTable {
    fn check_level(&self, user: Uuid, document: Uuid) -> Option<PermissionLevel> {
        let grants = self.grants.read().unwrap_or_else(|e| e.into_inner());
        grants
            .get(&(document, user))
            .and_then(|p| p.effective_level(now_secs()))
    }
}
