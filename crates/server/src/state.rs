use std::sync::Arc;

use glinr_kernel::Kernel;

#[derive(Clone)]
pub struct AppState {
    pub kernel: Arc<Kernel>,
}

impl AppState {
    pub fn new(kernel: Arc<Kernel>) -> AppState {
        AppState { kernel }
    }
}
