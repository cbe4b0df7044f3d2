//! Internal hand-off listener filter.
//!
//! Redirects the accepted socket to a named internal listener on the same
//! worker. The source listener's pipeline ends without creating a
//! connection; the target listener runs its own filter chain and owns the
//! connection from then on.

use std::io;

use async_trait::async_trait;

use super::{FilterStatus, ListenerFilter, ListenerFilterContext};

pub struct InternalHandoffFilter {
    target: String,
}

impl InternalHandoffFilter {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
        }
    }
}

#[async_trait]
impl ListenerFilter for InternalHandoffFilter {
    async fn on_accept(
        &mut self,
        cx: &mut ListenerFilterContext<'_>,
    ) -> io::Result<FilterStatus> {
        cx.request_internal_handoff(self.target.clone());
        Ok(FilterStatus::Continue)
    }
}
