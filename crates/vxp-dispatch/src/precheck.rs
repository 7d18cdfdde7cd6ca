// SPDX-License-Identifier: MIT OR Apache-2.0
//! Pre-dispatch authorization seam.

use async_trait::async_trait;
use vxp_extension::ExtensionDescriptor;
use vxp_protocol::InboundEnvelope;

/// Hook consulted before every backend call.
///
/// A real deployment validates the caller's rights and org membership here.
/// The shipped implementation is [`AllowAll`]; a refusal makes the worker
/// answer `500` without touching the backend.
#[async_trait]
pub trait PreCheck: Send + Sync {
    /// Whether the request may proceed to the backend.
    async fn check(&self, envelope: &InboundEnvelope, descriptor: &ExtensionDescriptor) -> bool;
}

/// Pass-through pre-check.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl PreCheck for AllowAll {
    async fn check(&self, _envelope: &InboundEnvelope, _descriptor: &ExtensionDescriptor) -> bool {
        true
    }
}
