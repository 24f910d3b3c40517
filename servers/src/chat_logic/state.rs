use crate::chat_logic::limiter::RouteLimits;
use lib_chat::validation::InboundValidator;
use lib_chat::{ClientRegistry, DeliveryOptions};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    // Clients the broadcast engine fans out to
    pub registry: Arc<ClientRegistry>,
    // Checks and publishes /submit messages
    pub validator: Arc<InboundValidator>,
    // Per-route connection limits
    pub limits: Arc<RouteLimits>,
    pub delivery: DeliveryOptions,
}

impl AppState {
    pub fn new(
        registry: Arc<ClientRegistry>,
        validator: InboundValidator,
        limits: RouteLimits,
        delivery: DeliveryOptions,
    ) -> Self {
        Self {
            registry,
            validator: Arc::new(validator),
            limits: Arc::new(limits),
            delivery,
        }
    }
}
