//! Per-response request context.

use std::collections::BTreeSet;

use crate::core::Keyword;
use crate::utils::www2id;

/// Everything a single response is built from: the dataset name, the raw
/// constraint expression, the timeout, recognized keywords, and the protocol
/// version to advertise.
///
/// The context is fixed once emission starts; the setters exist so a front end
/// can populate it field by field while interpreting the request URL.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestContext {
    dataset: String,
    ce: String,
    timeout_seconds: u32,
    keywords: BTreeSet<Keyword>,
    protocol: String,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    /// Store the dataset name, undoing WWW escaping.
    pub fn set_dataset(&mut self, dataset: &str) {
        self.dataset = www2id(dataset);
    }

    pub fn ce(&self) -> &str {
        &self.ce
    }

    /// Store the constraint expression, undoing WWW escaping.
    pub fn set_ce(&mut self, ce: &str) {
        self.ce = www2id(ce);
    }

    pub fn timeout_seconds(&self) -> u32 {
        self.timeout_seconds
    }

    /// Zero disables the timeout.
    pub fn set_timeout_seconds(&mut self, seconds: u32) {
        self.timeout_seconds = seconds;
    }

    pub fn keywords(&self) -> impl Iterator<Item = Keyword> + '_ {
        self.keywords.iter().copied()
    }

    pub fn has_keyword(&self, keyword: Keyword) -> bool {
        self.keywords.contains(&keyword)
    }

    pub fn add_keyword(&mut self, keyword: Keyword) {
        self.keywords.insert(keyword);
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn set_protocol(&mut self, protocol: &str) {
        self.protocol = protocol.to_owned();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_ce_unescapes() {
        let mut ctx = RequestContext::new();
        ctx.set_ce("u%20v,w");
        assert_eq!(ctx.ce(), "u v,w");
    }

    #[test]
    fn test_keywords() {
        let mut ctx = RequestContext::new();
        ctx.add_keyword(Keyword::Dap4_0);
        assert!(ctx.has_keyword(Keyword::Dap4_0));
        assert!(!ctx.has_keyword(Keyword::Dap2));
    }
}
