//! Resolver verification policy.
//!
//! Deciding whether a verification claim proves ownership of a resolver is
//! left to a collaborator; the pipeline only acts on a confirmed verdict.

use async_trait::async_trait;

use crate::Result;
use crate::store::{ResolverRow, VerificationWrite};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyVerdict {
    /// Mark the resolver verified.
    Confirmed,
    /// Not decided yet; leave the resolver as is.
    Pending,
    /// Claim does not prove ownership.
    Rejected,
}

#[async_trait]
pub trait VerificationPolicy: Send + Sync {
    async fn evaluate(
        &self,
        resolver: &ResolverRow,
        claim: &VerificationWrite,
    ) -> Result<PolicyVerdict>;
}

/// Never confirms anything. Used when no policy service is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverVerify;

#[async_trait]
impl VerificationPolicy for NeverVerify {
    async fn evaluate(
        &self,
        _resolver: &ResolverRow,
        _claim: &VerificationWrite,
    ) -> Result<PolicyVerdict> {
        Ok(PolicyVerdict::Pending)
    }
}

/// Confirms a claim made by the same DID that registered the resolver.
///
/// This only checks authorship, not the challenge itself; deployments that
/// run the full challenge should plug in their own policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct SameAuthorPolicy;

#[async_trait]
impl VerificationPolicy for SameAuthorPolicy {
    async fn evaluate(
        &self,
        resolver: &ResolverRow,
        claim: &VerificationWrite,
    ) -> Result<PolicyVerdict> {
        if resolver.did == claim.did {
            Ok(PolicyVerdict::Confirmed)
        } else {
            Ok(PolicyVerdict::Rejected)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn resolver(did: &str) -> ResolverRow {
        ResolverRow {
            nsid: "app.bsky.feed.post".into(),
            schema_template: "https://bsky.app/{rkey}".into(),
            verified: false,
            did: did.into(),
            uri: format!("at://{did}/blue.rito.service.schema/self"),
        }
    }

    fn claim(did: &str) -> VerificationWrite {
        VerificationWrite {
            uri: format!("at://{did}/blue.rito.service.verification/v"),
            did: did.into(),
            subject: "https://bsky.app/".into(),
            nsid: Some("app.bsky.feed.post".into()),
            created_at: Utc::now(),
            time_us: 1,
        }
    }

    #[tokio::test]
    async fn test_never_verify() {
        let verdict = NeverVerify
            .evaluate(&resolver("did:plc:a"), &claim("did:plc:a"))
            .await
            .unwrap();
        assert_eq!(verdict, PolicyVerdict::Pending);
    }

    #[tokio::test]
    async fn test_same_author() {
        let policy = SameAuthorPolicy;
        assert_eq!(
            policy
                .evaluate(&resolver("did:plc:a"), &claim("did:plc:a"))
                .await
                .unwrap(),
            PolicyVerdict::Confirmed
        );
        assert_eq!(
            policy
                .evaluate(&resolver("did:plc:a"), &claim("did:plc:b"))
                .await
                .unwrap(),
            PolicyVerdict::Rejected
        );
    }
}
