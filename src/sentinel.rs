//! Stable, user-visible sentinel responses and the trait boundaries for the
//! two external collaborators the router treats as opaque: the embedded
//! fallback generator (used when no worker is reachable and
//! `OLLAMA_REQUIRED` is false) and anything that wants to observe a model
//! change (§4.2, §6).

use async_trait::async_trait;

/// No worker is reachable yet; the request will be retried once one comes
/// online.
pub const STILL_LEARNING: &str = "I'm still learning. Please ask me again later!";

/// A worker answered, but the response was empty or too short to be useful.
pub const INSUFFICIENT_INFORMATION: &str = "I don't have enough information to answer that yet.";

/// A worker failed transport-level (connection refused, 5xx after fallback)
/// and redistribution also failed to find a home for the request.
pub const TECHNICAL_DIFFICULTIES: &str =
    "I'm experiencing technical difficulties. Please try again later.";

/// The request was cancelled by the deadline timer and no faster
/// alternative worker was available to re-route to.
pub const TAKING_TOO_LONG: &str = "I'm taking too long to think. Let me try again.";

/// An external, opaque text generator used only when no backend worker is
/// reachable and `OLLAMA_REQUIRED` is false. The router never inspects its
/// internals; it exists purely as a trait boundary so the router compiles
/// and is testable without a real embedded model.
#[async_trait]
pub trait FallbackGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> String;
}

/// Fallback generator that always answers with the still-learning sentinel.
/// Used when no other collaborator is wired in (the common case for a
/// router deployed with `OLLAMA_REQUIRED=false` and no embedded model).
#[derive(Debug, Default)]
pub struct SentinelFallbackGenerator;

#[async_trait]
impl FallbackGenerator for SentinelFallbackGenerator {
    async fn generate(&self, _prompt: &str) -> String {
        STILL_LEARNING.to_string()
    }
}

/// Notified whenever `Router::change_model` completes, successfully or not.
/// Exists so an upstream layer (a WebSocket session manager, a CLI) can
/// react to a model rotation without the router depending on it directly.
#[async_trait]
pub trait ModelChangeObserver: Send + Sync {
    async fn on_model_changed(&self, model: &str, success: bool);
}
