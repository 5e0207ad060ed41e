//! Application state

use herald_core::ControlPlane;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct AppState {
    pub control: Arc<ControlPlane>,
}

impl AppState {
    pub fn new(control: Arc<ControlPlane>) -> Self {
        Self { control }
    }
}
