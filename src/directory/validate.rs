//! Snapshot invariant checks run before a snapshot is written to the store.

use std::collections::{BTreeMap, BTreeSet};

use super::{DirectorySnapshot, hierarchy};
use crate::sync::error::SyncError;

/// Rejects snapshots that would break the store's invariants.
///
/// Checks dangling parent references, parent cycles, duplicate live
/// usernames, multiple primary memberships per user, duplicate live
/// `(orgId, userId)` pairs and memberships that reference unknown entities.
pub fn validate_snapshot(snapshot: &DirectorySnapshot) -> Result<(), SyncError> {
    for org in snapshot.organizations.values().filter(|o| !o.deleted) {
        if let Some(parent) = org.parent_id.as_deref() {
            let resolves = snapshot
                .organizations
                .get(parent)
                .is_some_and(|p| !p.deleted);
            if !resolves {
                return Err(SyncError::invalid_snapshot(format!(
                    "organization '{}' references missing parent '{parent}'",
                    org.id
                ))
                .with_entity("organization", org.id.as_str()));
            }
        }
    }

    hierarchy::depths(&snapshot.organizations)?;

    let mut usernames: BTreeMap<&str, &str> = BTreeMap::new();
    for user in snapshot.users.values().filter(|u| !u.deleted) {
        if let Some(existing) = usernames.insert(user.username.as_str(), user.id.as_str()) {
            return Err(SyncError::invalid_snapshot(format!(
                "username '{}' used by both '{existing}' and '{}'",
                user.username, user.id
            ))
            .with_entity("user", user.id.as_str()));
        }
    }

    let mut primaries: BTreeSet<&str> = BTreeSet::new();
    let mut pairs: BTreeSet<(&str, &str)> = BTreeSet::new();
    for membership in snapshot.memberships.values().filter(|m| !m.deleted) {
        let org_known = snapshot
            .organizations
            .get(&membership.org_id)
            .is_some_and(|o| !o.deleted);
        let user_known = snapshot
            .users
            .get(&membership.user_id)
            .is_some_and(|u| !u.deleted);
        if !org_known || !user_known {
            return Err(SyncError::invalid_snapshot(format!(
                "membership '{}' references unknown {} '{}'",
                membership.id,
                if org_known { "user" } else { "organization" },
                if org_known {
                    &membership.user_id
                } else {
                    &membership.org_id
                }
            ))
            .with_entity("membership", membership.id.as_str()));
        }

        if !pairs.insert((membership.org_id.as_str(), membership.user_id.as_str())) {
            return Err(SyncError::invalid_snapshot(format!(
                "duplicate membership of user '{}' in organization '{}'",
                membership.user_id, membership.org_id
            ))
            .with_entity("membership", membership.id.as_str()));
        }

        if membership.is_primary && !primaries.insert(membership.user_id.as_str()) {
            return Err(SyncError::invalid_snapshot(format!(
                "user '{}' has more than one primary membership",
                membership.user_id
            ))
            .with_entity("membership", membership.id.as_str()));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{Membership, Organization, User};
    use crate::sync::error::SyncErrorKind;

    fn base() -> DirectorySnapshot {
        DirectorySnapshot::from_parts(
            vec![
                Organization::new("A", None, "Root"),
                Organization::new("B", Some("A"), "Child"),
            ],
            vec![User::new("u1", "alice"), User::new("u2", "bob")],
            vec![
                Membership::new("m1", "A", "u1", true),
                Membership::new("m2", "B", "u1", false),
                Membership::new("m3", "B", "u2", true),
            ],
        )
    }

    #[test]
    fn valid_snapshot_passes() {
        assert!(validate_snapshot(&base()).is_ok());
    }

    #[test]
    fn dangling_parent_rejected() {
        let mut s = base();
        s.organizations.get_mut("B").unwrap().parent_id = Some("Z".to_string());
        let err = validate_snapshot(&s).unwrap_err();
        assert_eq!(err.kind, SyncErrorKind::InvalidSnapshot);
        assert_eq!(err.entity_id.as_deref(), Some("B"));
    }

    #[test]
    fn cycle_rejected() {
        let mut s = base();
        s.organizations.get_mut("A").unwrap().parent_id = Some("B".to_string());
        assert_eq!(
            validate_snapshot(&s).unwrap_err().kind,
            SyncErrorKind::CyclicHierarchy
        );
    }

    #[test]
    fn duplicate_username_rejected_unless_deleted() {
        let mut s = base();
        s.users.insert("u3".to_string(), User::new("u3", "alice"));
        assert!(validate_snapshot(&s).is_err());

        s.users.get_mut("u3").unwrap().deleted = true;
        assert!(validate_snapshot(&s).is_ok());
    }

    #[test]
    fn second_primary_rejected() {
        let mut s = base();
        s.memberships.get_mut("m2").unwrap().is_primary = true;
        let err = validate_snapshot(&s).unwrap_err();
        assert!(err.message.contains("primary"));
    }

    #[test]
    fn duplicate_pair_rejected() {
        let mut s = base();
        s.memberships
            .insert("m4".to_string(), Membership::new("m4", "A", "u1", false));
        assert!(validate_snapshot(&s).unwrap_err().message.contains("duplicate"));
    }

    #[test]
    fn unknown_reference_rejected() {
        let mut s = base();
        s.memberships
            .insert("m5".to_string(), Membership::new("m5", "A", "ghost", false));
        assert!(validate_snapshot(&s).unwrap_err().message.contains("unknown user"));
    }
}
