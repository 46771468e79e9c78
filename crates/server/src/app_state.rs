use std::sync::Arc;

use directory::DirectoryContext;
use storage::Storage;

use crate::gateway::{Gateway, GatewaySettings};

#[derive(Clone)]
pub struct AppState {
    pub directory: DirectoryContext,
    pub gateway: Arc<Gateway>,
}

impl AppState {
    /// Wires the gateway in as the directory's deletion sink.
    pub fn new(storage: Storage, settings: GatewaySettings) -> Arc<Self> {
        let gateway = Arc::new(Gateway::new(storage.clone(), settings));
        let directory = DirectoryContext::new(storage, gateway.clone());
        Arc::new(Self { directory, gateway })
    }
}
