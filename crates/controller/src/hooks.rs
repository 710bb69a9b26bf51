//! Named extension points run before render and after status derivation.
//! Hooks run in registration order.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use keel_core::model::Composition;

#[async_trait]
pub trait Hook: Send + Sync {
    /// `Ok(Some(d))` asks for the next pass after `d`.
    async fn exec(&self, comp: &Composition) -> Result<Option<Duration>>;
}

#[derive(Clone, Default)]
pub struct Hooks {
    pub pre: Vec<(String, Arc<dyn Hook>)>,
    pub post: Vec<(String, Arc<dyn Hook>)>,
}

impl Hooks {
    pub fn with_pre(mut self, name: &str, hook: Arc<dyn Hook>) -> Self {
        self.pre.push((name.to_string(), hook));
        self
    }

    pub fn with_post(mut self, name: &str, hook: Arc<dyn Hook>) -> Self {
        self.post.push((name.to_string(), hook));
        self
    }
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = |v: &[(String, Arc<dyn Hook>)]| v.iter().map(|(n, _)| n.clone()).collect::<Vec<_>>();
        f.debug_struct("Hooks").field("pre", &names(&self.pre)).field("post", &names(&self.post)).finish()
    }
}
