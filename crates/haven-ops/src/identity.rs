//! Caller identity and capability checks.
//!
//! Identity arrives from the platform as a bearer-token claim set. It
//! is captured here as an explicit, immutable [`CapabilitySet`] passed
//! by value into every handler call; nothing downstream reads ambient
//! claims.
//!
//! # Privilege tiers
//!
//! - Escape actions, request review, and sealing require the safety
//!   team (or a platform admin).
//! - Unsealing requires the legal team exclusively. It is a distinct,
//!   higher tier than sealing: not even admins unseal without a legal
//!   claim.
//! - Compliance reads of sealed records require the compliance or
//!   legal team.

use serde::{Deserialize, Serialize};

use crate::error::OpError;

/// Platform claims carried by a caller's token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CapabilitySet {
    /// Platform administrator.
    #[serde(default)]
    pub is_admin: bool,
    /// Trust-and-safety team member.
    #[serde(default)]
    pub is_safety_team: bool,
    /// Legal team member.
    #[serde(default)]
    pub is_legal_team: bool,
    /// Compliance team member.
    #[serde(default)]
    pub is_compliance_team: bool,
    /// Customer support; carries no privileged access here.
    #[serde(default)]
    pub is_support_team: bool,
}

impl CapabilitySet {
    /// No capabilities at all.
    pub const NONE: Self = Self {
        is_admin: false,
        is_safety_team: false,
        is_legal_team: false,
        is_compliance_team: false,
        is_support_team: false,
    };
}

/// The caller of one operation. An absent uid means unauthenticated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerIdentity {
    uid: Option<String>,
    claims: CapabilitySet,
}

impl CallerIdentity {
    /// An authenticated caller with the given claims.
    #[must_use]
    pub fn authenticated(uid: impl Into<String>, claims: CapabilitySet) -> Self {
        Self {
            uid: Some(uid.into()),
            claims,
        }
    }

    /// An unauthenticated caller. Only submission accepts these.
    #[must_use]
    pub fn anonymous() -> Self {
        Self {
            uid: None,
            claims: CapabilitySet::NONE,
        }
    }

    /// The caller's uid, if authenticated.
    #[must_use]
    pub fn uid(&self) -> Option<&str> {
        self.uid.as_deref()
    }

    /// The caller's claims.
    #[must_use]
    pub fn claims(&self) -> CapabilitySet {
        self.claims
    }

    /// # Errors
    ///
    /// [`OpError::Unauthenticated`] when the caller carries no uid.
    pub fn require_uid(&self) -> Result<&str, OpError> {
        self.uid.as_deref().ok_or(OpError::Unauthenticated)
    }

    /// Authorizes escape actions, request review, and sealing.
    ///
    /// # Errors
    ///
    /// [`OpError::Unauthenticated`] without a uid,
    /// [`OpError::PermissionDenied`] without a safety-team or admin
    /// claim.
    pub fn require_safety_action(&self) -> Result<&str, OpError> {
        let uid = self.require_uid()?;
        if self.claims.is_safety_team || self.claims.is_admin {
            Ok(uid)
        } else {
            Err(OpError::PermissionDenied)
        }
    }

    /// Authorizes unsealing. Strictly the legal team; deliberately not
    /// satisfied by an admin claim.
    ///
    /// # Errors
    ///
    /// [`OpError::Unauthenticated`] without a uid,
    /// [`OpError::PermissionDenied`] without a legal-team claim.
    pub fn require_legal(&self) -> Result<&str, OpError> {
        let uid = self.require_uid()?;
        if self.claims.is_legal_team {
            Ok(uid)
        } else {
            Err(OpError::PermissionDenied)
        }
    }

    /// Authorizes compliance reads of sealed records.
    ///
    /// # Errors
    ///
    /// [`OpError::Unauthenticated`] without a uid,
    /// [`OpError::PermissionDenied`] without a compliance-team or
    /// legal-team claim.
    pub fn require_compliance(&self) -> Result<&str, OpError> {
        let uid = self.require_uid()?;
        if self.claims.is_compliance_team || self.claims.is_legal_team {
            Ok(uid)
        } else {
            Err(OpError::PermissionDenied)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with(claims: CapabilitySet) -> CallerIdentity {
        CallerIdentity::authenticated("u-1", claims)
    }

    #[test]
    fn anonymous_caller_fails_every_privileged_check() {
        let caller = CallerIdentity::anonymous();
        assert!(matches!(caller.require_uid(), Err(OpError::Unauthenticated)));
        assert!(matches!(
            caller.require_safety_action(),
            Err(OpError::Unauthenticated)
        ));
        assert!(matches!(caller.require_legal(), Err(OpError::Unauthenticated)));
    }

    #[test]
    fn safety_action_accepts_safety_team_and_admin() {
        assert!(with(CapabilitySet {
            is_safety_team: true,
            ..CapabilitySet::NONE
        })
        .require_safety_action()
        .is_ok());
        assert!(with(CapabilitySet {
            is_admin: true,
            ..CapabilitySet::NONE
        })
        .require_safety_action()
        .is_ok());
        assert!(matches!(
            with(CapabilitySet {
                is_support_team: true,
                ..CapabilitySet::NONE
            })
            .require_safety_action(),
            Err(OpError::PermissionDenied)
        ));
    }

    #[test]
    fn unseal_tier_is_legal_only() {
        assert!(with(CapabilitySet {
            is_legal_team: true,
            ..CapabilitySet::NONE
        })
        .require_legal()
        .is_ok());
        // An admin claim does not reach the legal tier.
        assert!(matches!(
            with(CapabilitySet {
                is_admin: true,
                is_safety_team: true,
                ..CapabilitySet::NONE
            })
            .require_legal(),
            Err(OpError::PermissionDenied)
        ));
    }

    #[test]
    fn compliance_accepts_compliance_and_legal() {
        assert!(with(CapabilitySet {
            is_compliance_team: true,
            ..CapabilitySet::NONE
        })
        .require_compliance()
        .is_ok());
        assert!(with(CapabilitySet {
            is_legal_team: true,
            ..CapabilitySet::NONE
        })
        .require_compliance()
        .is_ok());
        assert!(matches!(
            with(CapabilitySet {
                is_admin: true,
                ..CapabilitySet::NONE
            })
            .require_compliance(),
            Err(OpError::PermissionDenied)
        ));
    }
}
