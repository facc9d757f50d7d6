//! Comment moderation hook.

use async_trait::async_trait;

use rito_core::Lang;

use crate::Result;

/// Returns a verdict label to store on a comment, or `None` for no verdict.
#[async_trait]
pub trait Moderator: Send + Sync {
    async fn moderate_comment(&self, lang: Lang, title: &str, comment: &str)
    -> Result<Option<String>>;
}

/// Records no verdict.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoModeration;

#[async_trait]
impl Moderator for NoModeration {
    async fn moderate_comment(
        &self,
        _lang: Lang,
        _title: &str,
        _comment: &str,
    ) -> Result<Option<String>> {
        Ok(None)
    }
}
