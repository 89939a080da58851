use std::sync::Arc;

use crate::auth::AuthorizationGate;
use crate::config::Settings;
use crate::hub::Hub;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub hub: Hub,
    pub gate: Arc<dyn AuthorizationGate>,
}

impl AppState {
    pub fn new(settings: Settings, hub: Hub, gate: Arc<dyn AuthorizationGate>) -> Self {
        Self {
            settings: Arc::new(settings),
            hub,
            gate,
        }
    }
}
